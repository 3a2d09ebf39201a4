//! Created-contract intake: polls new blocks and extracts the contracts they deployed.

use crate::scheduler::ScanScheduler;
use crate::types::CreatedContract;
use crate::utils::error::compact_error_message;
use crate::utils::rpc::{is_method_unavailable_error, HttpProvider, RobustRpc};
use alloy::primitives::{Address, B256};
use alloy::rpc::types::TransactionReceipt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::{Duration, Instant};

const RPC_RETRIES: usize = 3;
const BACKLOG_LOG_MIN_QUEUE: usize = 5;
const BACKLOG_LOG_INTERVAL: Duration = Duration::from_secs(10 * 60);

fn parse_field<T: FromStr>(value: &Value, key: &str) -> Option<T> {
    value.get(key)?.as_str().and_then(|s| T::from_str(s).ok())
}

/// Successful `create` traces. The deployer is the sender of the enclosing transaction, so
/// factory-created contracts are attributed to the account that called the factory.
pub fn created_contracts_from_traces(
    traces: &[Value],
    tx_senders: &HashMap<B256, Address>,
    block_number: u64,
    timestamp: u64,
) -> Vec<CreatedContract> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for trace in traces {
        if trace.get("type").and_then(Value::as_str) != Some("create") {
            continue;
        }
        if trace.get("error").is_some_and(|e| !e.is_null()) {
            continue;
        }
        let Some(address) = trace.get("result").and_then(|r| parse_field::<Address>(r, "address"))
        else {
            continue;
        };
        let Some(tx_hash) = parse_field::<B256>(trace, "transactionHash") else {
            continue;
        };
        let deployer = tx_senders.get(&tx_hash).copied().or_else(|| {
            trace
                .get("action")
                .and_then(|a| parse_field::<Address>(a, "from"))
        });
        let Some(deployer) = deployer else {
            continue;
        };
        if seen.insert(address) {
            out.push(CreatedContract {
                address,
                deployer,
                block_number,
                timestamp,
                tx_hash,
            });
        }
    }
    out
}

/// Top-level deployments only; used when the node has no trace API.
pub fn created_contracts_from_receipts(
    receipts: &[TransactionReceipt],
    block_number: u64,
    timestamp: u64,
) -> Vec<CreatedContract> {
    receipts
        .iter()
        .filter(|receipt| receipt.status())
        .filter_map(|receipt| {
            Some(CreatedContract {
                address: receipt.contract_address?,
                deployer: receipt.from,
                block_number,
                timestamp,
                tx_hash: receipt.transaction_hash,
            })
        })
        .collect()
}

pub struct ContractIntake {
    provider: HttpProvider,
    traces_supported: bool,
}

impl ContractIntake {
    pub fn new(provider: HttpProvider) -> Self {
        Self {
            provider,
            traces_supported: true,
        }
    }

    /// Block timestamp and the contracts created in `block_number`. `None` when the node
    /// does not serve the block yet.
    pub async fn created_in_block(
        &mut self,
        block_number: u64,
    ) -> anyhow::Result<Option<(u64, Vec<CreatedContract>)>> {
        let Some((_, timestamp)) =
            RobustRpc::get_block_header_with_retry(&self.provider, block_number, RPC_RETRIES)
                .await?
        else {
            return Ok(None);
        };
        let receipts =
            RobustRpc::get_block_receipts_with_retry(&self.provider, block_number, RPC_RETRIES)
                .await?;

        if self.traces_supported {
            match RobustRpc::trace_block_with_retry(&self.provider, block_number, RPC_RETRIES).await
            {
                Ok(traces) => {
                    let senders: HashMap<B256, Address> = receipts
                        .iter()
                        .map(|r| (r.transaction_hash, r.from))
                        .collect();
                    return Ok(Some((
                        timestamp,
                        created_contracts_from_traces(&traces, &senders, block_number, timestamp),
                    )));
                }
                Err(err) if is_method_unavailable_error(&err.to_string()) => {
                    tracing::warn!(
                        "[SCAN] trace_block unavailable; falling back to receipts (factory deployments will be missed)"
                    );
                    self.traces_supported = false;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Some((
            timestamp,
            created_contracts_from_receipts(&receipts, block_number, timestamp),
        )))
    }
}

pub struct BlockLoopConfig {
    pub poll_interval: Duration,
    /// Wait for the scan queue to drain after every block.
    pub debug: bool,
}

/// Follows the chain head from `start_block`, feeding created contracts to the scheduler.
/// Returns when the scheduler is closed.
pub async fn run_block_loop(
    mut intake: ContractIntake,
    scheduler: ScanScheduler,
    start_block: u64,
    config: BlockLoopConfig,
) {
    let provider = intake.provider.clone();
    let mut next_block = start_block;
    let mut stats_logged_at: Option<Instant> = None;

    loop {
        let head = match RobustRpc::get_block_number_with_retry(&provider, RPC_RETRIES).await {
            Ok(head) => head,
            Err(err) => {
                tracing::warn!(
                    "[SCAN] Failed to fetch head block: {}",
                    compact_error_message(&err.to_string(), 240)
                );
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        while next_block <= head {
            match intake.created_in_block(next_block).await {
                Ok(Some((timestamp, created))) => {
                    if !created.is_empty() {
                        tracing::debug!(
                            "[SCAN] Block {}: {} created contract(s)",
                            next_block,
                            created.len()
                        );
                    }
                    if let Err(err) = scheduler.on_block(timestamp, &created).await {
                        tracing::warn!("[QUEUE] Block {} bookkeeping failed: {:#}", next_block, err);
                    }
                    log_backlog(&scheduler, head, &mut stats_logged_at).await;
                    if config.debug {
                        scheduler.wait_idle().await;
                    }
                    next_block += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        "[SCAN] Failed to read block {}: {}",
                        next_block,
                        compact_error_message(&err.to_string(), 240)
                    );
                    break;
                }
            }
        }

        if scheduler.is_closed().await {
            return;
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

async fn log_backlog(scheduler: &ScanScheduler, head: u64, logged_at: &mut Option<Instant>) {
    let backlog = scheduler.backlog().await;
    if backlog.queued < BACKLOG_LOG_MIN_QUEUE {
        return;
    }
    if logged_at.is_some_and(|at| at.elapsed() < BACKLOG_LOG_INTERVAL) {
        return;
    }
    match backlog.scanning_block {
        Some(scanning) => tracing::warn!(
            "[QUEUE] Scan queue: {}. Current block: {}. Scanning block: {}. Block delay: {}.",
            backlog.queued,
            head,
            scanning,
            head.saturating_sub(scanning)
        ),
        None => tracing::warn!(
            "[QUEUE] Scan queue: {}. Current block: {}.",
            backlog.queued,
            head
        ),
    }
    *logged_at = Some(Instant::now());
}

#[cfg(test)]
mod tests {
    use super::created_contracts_from_traces;
    use alloy::primitives::{address, b256, Address, B256};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_create_traces_use_transaction_sender() {
        let tx = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        let factory_caller = address!("1111111111111111111111111111111111111111");
        let traces = vec![
            json!({
                "type": "call",
                "action": {"from": "0x2222222222222222222222222222222222222222"},
                "transactionHash": format!("{tx:#x}"),
            }),
            json!({
                "type": "create",
                "action": {"from": "0x3333333333333333333333333333333333333333"},
                "result": {"address": "0x4444444444444444444444444444444444444444"},
                "transactionHash": format!("{tx:#x}"),
            }),
            json!({
                "type": "create",
                "action": {"from": "0x3333333333333333333333333333333333333333"},
                "error": "Reverted",
                "result": null,
                "transactionHash": format!("{tx:#x}"),
            }),
        ];
        let senders: HashMap<B256, Address> = HashMap::from([(tx, factory_caller)]);
        let created = created_contracts_from_traces(&traces, &senders, 17, 1_700_000_000);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].address, address!("4444444444444444444444444444444444444444"));
        assert_eq!(created[0].deployer, factory_caller);
        assert_eq!(created[0].block_number, 17);
        assert_eq!(created[0].tx_hash, tx);
    }
}
