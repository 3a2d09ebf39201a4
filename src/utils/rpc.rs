//! Retrying JSON-RPC reads used by the block loop, the scan pipeline and the fork.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockTransactionsKind, TransactionReceipt};
use alloy::transports::http::Http;
use reqwest::Client;
use std::borrow::Cow;
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};

pub type HttpProvider = RootProvider<Http<Client>>;

const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
const ERROR_MAX_LEN: usize = 260;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 1_800;
const RATE_LIMIT_BACKOFF_MS: u64 = 5_000;

/// Node-side failures that repeat identically on every attempt.
const DETERMINISTIC_MARKERS: &[&str] = &[
    "-32601",
    "method not found",
    "-32602",
    "invalid params",
    "-32700",
    "parse error",
    "revert",
    "unknown variant",
    "did not match any variant",
];

pub fn connect_http(url: &str) -> anyhow::Result<HttpProvider> {
    let url = url.trim();
    anyhow::ensure!(!url.is_empty(), "empty RPC url");
    let parsed: reqwest::Url = url
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid RPC url `{url}`: {err}"))?;
    Ok(ProviderBuilder::new().on_http(parsed))
}

fn call_timeout() -> Duration {
    let ms = std::env::var("RPC_CALL_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| (250..=60_000).contains(ms))
        .unwrap_or(DEFAULT_CALL_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Doubling delay starting at `BACKOFF_BASE_MS`, capped at `BACKOFF_CAP_MS`.
fn backoff(attempt: usize) -> Duration {
    let shift = attempt.min(8) as u32;
    Duration::from_millis((BACKOFF_BASE_MS << shift).min(BACKOFF_CAP_MS))
}

fn is_retryable(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    !DETERMINISTIC_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["429", "rate limit", "too many requests", "compute units"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Errors meaning the node does not serve this method at all.
pub fn is_method_unavailable_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["-32601", "method not found", "does not exist", "not supported"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Run `op` up to `retries` times, each attempt bounded by `RPC_CALL_TIMEOUT_MS`.
/// Deterministic failures (reverts, bad params, missing methods) return immediately.
pub async fn run_with_retry<T, Op, Fut>(
    retries: usize,
    context: &str,
    mut op: Op,
) -> anyhow::Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = retries.max(1);
    let per_call = call_timeout();
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let mut delay = backoff(attempt);
        match timeout(per_call, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                last_error = crate::utils::error::compact_error_message(
                    &err.to_string(),
                    ERROR_MAX_LEN,
                );
                if !is_retryable(&last_error) {
                    anyhow::bail!("{context} failed on attempt {attempt}/{attempts}: {last_error}");
                }
                if is_rate_limited(&last_error) {
                    delay = delay.max(Duration::from_millis(RATE_LIMIT_BACKOFF_MS));
                }
            }
            Err(_) => last_error = format!("timed out after {}ms", per_call.as_millis()),
        }
        if attempt < attempts {
            sleep(delay).await;
        }
    }

    anyhow::bail!("{context} failed after {attempts} attempt(s): {last_error}")
}

fn block_tag(block_number: u64) -> String {
    format!("0x{block_number:x}")
}

fn strip_0x(raw: &str) -> &str {
    raw.strip_prefix("0x").unwrap_or(raw)
}

/// Raw request whose result is a hex string (quantities and data).
async fn hex_request(
    provider: &HttpProvider,
    method: &'static str,
    params: serde_json::Value,
    retries: usize,
    context: String,
) -> anyhow::Result<String> {
    run_with_retry(retries, &context, || {
        let provider = provider.clone();
        let params = params.clone();
        async move {
            let raw: String = provider.raw_request(Cow::Borrowed(method), params).await?;
            Ok(raw)
        }
    })
    .await
}

pub struct RobustRpc;

impl RobustRpc {
    pub async fn get_block_number_with_retry(
        provider: &HttpProvider,
        retries: usize,
    ) -> anyhow::Result<u64> {
        run_with_retry(retries, "eth_blockNumber", || {
            let provider = provider.clone();
            async move { Ok(provider.get_block_number().await?) }
        })
        .await
    }

    pub async fn get_chain_id_with_retry(
        provider: &HttpProvider,
        retries: usize,
    ) -> anyhow::Result<u64> {
        run_with_retry(retries, "eth_chainId", || {
            let provider = provider.clone();
            async move { Ok(provider.get_chain_id().await?) }
        })
        .await
    }

    pub async fn get_code_at_block_with_retry(
        provider: &HttpProvider,
        address: Address,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<Bytes> {
        let tag = block_tag(block_number);
        let raw = hex_request(
            provider,
            "eth_getCode",
            serde_json::json!([address, tag]),
            retries,
            format!("eth_getCode({address:#x}, {tag})"),
        )
        .await?;
        Ok(Bytes::from(hex::decode(strip_0x(&raw))?))
    }

    pub async fn get_balance_at_block_with_retry(
        provider: &HttpProvider,
        address: Address,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<U256> {
        let tag = block_tag(block_number);
        let raw = hex_request(
            provider,
            "eth_getBalance",
            serde_json::json!([address, tag]),
            retries,
            format!("eth_getBalance({address:#x}, {tag})"),
        )
        .await?;
        Ok(U256::from_str_radix(strip_0x(&raw), 16)?)
    }

    pub async fn get_storage_at_block_with_retry(
        provider: &HttpProvider,
        address: Address,
        index: U256,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<U256> {
        let tag = block_tag(block_number);
        let raw = hex_request(
            provider,
            "eth_getStorageAt",
            serde_json::json!([address, index, tag]),
            retries,
            format!("eth_getStorageAt({address:#x}, {index}, {tag})"),
        )
        .await?;
        Ok(U256::from_str_radix(strip_0x(&raw), 16)?)
    }

    pub async fn get_transaction_count_at_block_with_retry(
        provider: &HttpProvider,
        address: Address,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<u64> {
        let tag = block_tag(block_number);
        let raw = hex_request(
            provider,
            "eth_getTransactionCount",
            serde_json::json!([address, tag]),
            retries,
            format!("eth_getTransactionCount({address:#x}, {tag})"),
        )
        .await?;
        Ok(u64::from_str_radix(strip_0x(&raw), 16)?)
    }

    pub async fn get_block_hash_with_retry(
        provider: &HttpProvider,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<B256> {
        Self::get_block_header_with_retry(provider, block_number, retries)
            .await?
            .map(|(hash, _)| hash)
            .ok_or_else(|| anyhow::anyhow!("block #{block_number} not found"))
    }

    /// `(hash, timestamp)` of a block, `None` when the node does not know it yet.
    pub async fn get_block_header_with_retry(
        provider: &HttpProvider,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<Option<(B256, u64)>> {
        run_with_retry(
            retries,
            &format!("eth_getBlockByNumber(#{block_number})"),
            || {
                let provider = provider.clone();
                async move {
                    let block = provider
                        .get_block_by_number(block_number.into(), BlockTransactionsKind::Hashes.into())
                        .await?;
                    Ok(block.map(|block| (block.header.hash, block.header.timestamp)))
                }
            },
        )
        .await
    }

    pub async fn get_block_receipts_with_retry(
        provider: &HttpProvider,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<Vec<TransactionReceipt>> {
        run_with_retry(
            retries,
            &format!("eth_getBlockReceipts(#{block_number})"),
            || {
                let provider = provider.clone();
                async move {
                    Ok(provider
                        .get_block_receipts(block_number.into())
                        .await?
                        .unwrap_or_default())
                }
            },
        )
        .await
    }

    /// Parity-style `trace_block`, kept untyped so one odd trace shape does not fail the
    /// whole block.
    pub async fn trace_block_with_retry(
        provider: &HttpProvider,
        block_number: u64,
        retries: usize,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        run_with_retry(retries, &format!("trace_block(#{block_number})"), || {
            let provider = provider.clone();
            async move {
                let raw: serde_json::Value = provider
                    .raw_request(
                        Cow::Borrowed("trace_block"),
                        serde_json::json!([block_tag(block_number)]),
                    )
                    .await?;
                Ok(match raw {
                    serde_json::Value::Array(traces) => traces,
                    _ => Vec::new(),
                })
            }
        })
        .await
    }
}
