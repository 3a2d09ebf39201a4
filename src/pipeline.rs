//! Scan workers and the alert feed: the glue between the scheduler and the simulator.

use crate::alerts::{parse_alert_line, AlertRouter};
use crate::classifier::ExploitClassifier;
use crate::context::ScanContext;
use crate::fork_db::ForkDB;
use crate::fork_simulator::{search_contract, ForkProbe, RevmProbe, SearchOutcome};
use crate::report::{ExploitReport, Finding};
use crate::scheduler::{AlertEffect, ScanScheduler};
use crate::selector_scanner::scan_selectors;
use crate::types::CreatedContract;
use crate::utils::error::compact_error_message;
use crate::utils::rpc::{HttpProvider, RobustRpc};
use alloy::primitives::{Bytes, Selector};
use std::future::Future;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

const RPC_RETRIES: usize = 3;

/// Runs the signature search for `created` on an already prepared fork.
pub async fn scan_with_probe<P: ForkProbe + Send>(
    ctx: &ScanContext,
    probe: &mut P,
    created: &CreatedContract,
    selectors: &[Selector],
) -> Option<ExploitReport> {
    let mut classifier = ExploitClassifier {
        chain_id: ctx.chain_id,
        native_symbol: ctx.native_symbol(),
        oracle: ctx.oracle.as_ref(),
        thresholds: &ctx.thresholds,
        metadata: &ctx.metadata,
        created,
    };
    match search_contract(
        probe,
        &mut classifier,
        created.address,
        created.deployer,
        selectors,
        ctx.payable_value,
    )
    .await
    {
        SearchOutcome::Finding(report) => Some(*report),
        SearchOutcome::Exhausted => None,
        SearchOutcome::Aborted(reason) => {
            tracing::warn!(
                "[SCAN] Gave up on {}: {}",
                created.address,
                compact_error_message(&reason, 240)
            );
            None
        }
    }
}

/// Runtime code of `created` as of the end of its creation block.
pub async fn code_at_creation(
    provider: &HttpProvider,
    created: &CreatedContract,
) -> anyhow::Result<Bytes> {
    RobustRpc::get_code_at_block_with_retry(
        provider,
        created.address,
        created.block_number,
        RPC_RETRIES,
    )
    .await
}

/// Forks the chain at the block that created `created` and searches it for an exploit
/// function. Later blocks are never consulted, so a contract that was drained while
/// queued is still judged on its deployed state.
pub async fn scan_contract(
    ctx: &ScanContext,
    created: &CreatedContract,
) -> anyhow::Result<Option<ExploitReport>> {
    let fork_block = created.block_number;
    let code = code_at_creation(&ctx.provider, created).await?;
    if code.is_empty() {
        tracing::debug!("[SCAN] {} has no code at block {}", created.address, fork_block);
        return Ok(None);
    }
    let selectors = scan_selectors(&code);
    if selectors.is_empty() {
        tracing::debug!("[SCAN] {} exposes no selectors", created.address);
        return Ok(None);
    }

    let fork = ForkDB::with_block_number(ctx.provider.clone(), fork_block)?;
    let mut probe = RevmProbe::new(fork, ctx.chain_id, fork_block, created.timestamp);

    tracing::debug!(
        "[SCAN] {} selectors for {} at block {}",
        selectors.len(),
        created.address,
        fork_block
    );
    Ok(scan_with_probe(ctx, &mut probe, created, &selectors).await)
}

/// Drives `work` on the blocking pool. Fork reads and EVM execution inside it block their
/// thread, which must never be a runtime worker.
pub async fn run_blocking<T, F>(work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || handle.block_on(work))
        .await
        .map_err(|err| anyhow::anyhow!("scan task failed: {err}"))?
}

/// Pulls contracts off the scheduler one at a time until it is closed.
pub async fn run_worker(
    ctx: Arc<ScanContext>,
    scheduler: ScanScheduler,
    findings: mpsc::UnboundedSender<Finding>,
) {
    while let Some(created) = scheduler.next().await {
        let started = Instant::now();
        let scan = {
            let ctx = ctx.clone();
            let created = created.clone();
            run_blocking(async move { scan_contract(&ctx, &created).await })
        };
        match scan.await {
            Ok(Some(report)) => {
                ctx.anomaly.record_scan(true);
                let finding = report.to_finding(&ctx.developer_tag, ctx.anomaly.current());
                tracing::info!(
                    "[SCAN] Finding for {} (deployer {}, funded {})",
                    report.contract_address,
                    report.deployer_address,
                    report.funded_address
                );
                if findings.send(finding).is_err() {
                    tracing::warn!("[SCAN] Finding sink closed; dropping finding");
                }
            }
            Ok(None) => ctx.anomaly.record_scan(false),
            Err(err) => tracing::warn!(
                "[SCAN] Scan of {} failed: {}",
                created.address,
                compact_error_message(&format!("{err:#}"), 240)
            ),
        }
        tracing::debug!(
            "[SCAN] {} scanned in {} ms",
            created.address,
            started.elapsed().as_millis()
        );
        if let Err(err) = scheduler.complete(created.address).await {
            tracing::warn!("[QUEUE] Failed to retire {}: {:#}", created.address, err);
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reads newline-delimited JSON alert events and forwards the relevant ones to the
/// scheduler. Returns at end of input.
pub async fn run_alert_feed<R>(reader: R, router: AlertRouter, scheduler: ScanScheduler)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("[ALERT] Alert feed read failed: {}", err);
                break;
            }
        };
        let event = match parse_alert_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(
                    "[ALERT] Ignoring malformed alert: {}",
                    compact_error_message(&err.to_string(), 160)
                );
                continue;
            }
        };
        let Some(alert) = router.route(&event, unix_now()) else {
            continue;
        };
        match scheduler.on_alert(&alert).await {
            Ok(AlertEffect::Reprioritized { from, to }) => tracing::info!(
                "[ALERT] {} moved from priority {} to {} ({:?})",
                alert.address,
                from,
                to,
                alert.source
            ),
            Ok(AlertEffect::Unchanged) => {}
            Ok(AlertEffect::Suspicious) => tracing::debug!(
                "[ALERT] {} marked suspicious ({:?})",
                alert.address,
                alert.source
            ),
            Err(err) => tracing::warn!("[ALERT] Failed to apply alert for {}: {:#}", alert.address, err),
        }
    }
    tracing::info!("[ALERT] Alert feed ended");
}
