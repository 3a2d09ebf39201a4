//! Time-bounded lookup caches and the USD price oracle.

use crate::config::chains::ChainConfig;
use crate::fork_db::trim_cache;
use crate::types::lower_hex;
use alloy::primitives::Address;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

struct Slot<V> {
    value: OnceCell<Option<V>>,
    created_at: Instant,
}

/// Key → value cache with a fixed time-to-live. Concurrent misses on one key share a single
/// in-flight fetch. Absent results are handed to every waiter but not retained.
pub struct TtlCache<K, V> {
    entries: DashMap<K, Arc<Slot<V>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn slot(&self, key: &K) -> Arc<Slot<V>> {
        let now = Instant::now();
        let slot = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| {
                Arc::new(Slot {
                    value: OnceCell::new(),
                    created_at: now,
                })
            });
            if now.duration_since(entry.created_at) >= self.ttl {
                *entry = Arc::new(Slot {
                    value: OnceCell::new(),
                    created_at: now,
                });
            }
            entry.clone()
        };
        trim_cache(&self.entries, self.max_entries);
        slot
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<V>>,
    {
        let slot = self.slot(&key);
        let value = slot.value.get_or_init(fetch).await.clone();
        if value.is_none() {
            self.entries
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
        }
        value
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// USD spot or historical prices. `None` means unknown and is never an error.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn native_price(&self, chain_id: u64, timestamp: Option<u64>) -> Option<f64>;
    async fn erc20_price(&self, chain_id: u64, token: Address, timestamp: Option<u64>)
        -> Option<f64>;
}

const DEFILLAMA_COINS_URL: &str = "https://coins.llama.fi";
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct CoinsResponse {
    #[serde(default)]
    coins: HashMap<String, CoinPrice>,
}

#[derive(Debug, Deserialize)]
struct CoinPrice {
    price: Option<f64>,
}

pub struct DefiLlamaOracle {
    client: reqwest::Client,
    base_url: String,
    cache: TtlCache<String, f64>,
}

fn price_path(coin_key: &str, timestamp: Option<u64>) -> String {
    match timestamp {
        Some(ts) => format!("/prices/historical/{ts}/{coin_key}"),
        None => format!("/prices/current/{coin_key}"),
    }
}

impl DefiLlamaOracle {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self::with_base_url(DEFILLAMA_COINS_URL, ttl, max_entries)
    }

    pub fn with_base_url(base_url: &str, ttl: Duration, max_entries: usize) -> Self {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(
                    "[PRICE] Failed to construct timeout HTTP client: {err}. Falling back to default client."
                );
                reqwest::Client::new()
            }
        };
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: TtlCache::new(ttl, max_entries),
        }
    }

    async fn fetch_price(client: &reqwest::Client, url: &str, coin_key: &str) -> anyhow::Result<Option<f64>> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }
            match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        last_err = Some(anyhow::anyhow!("HTTP {}", status));
                        continue;
                    }
                    match resp.json::<CoinsResponse>().await {
                        Ok(body) => {
                            return Ok(body.coins.get(coin_key).and_then(|coin| coin.price));
                        }
                        Err(e) => {
                            last_err = Some(e.into());
                            continue;
                        }
                    }
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("fetch_price: no attempts made")))
    }

    async fn price(&self, coin_key: String, timestamp: Option<u64>) -> Option<f64> {
        let cache_key = match timestamp {
            Some(ts) => format!("{coin_key}/{ts}"),
            None => coin_key.clone(),
        };
        let url = format!("{}{}", self.base_url, price_path(&coin_key, timestamp));
        let client = self.client.clone();
        self.cache
            .get_or_fetch(cache_key, || async move {
                match Self::fetch_price(&client, &url, &coin_key).await {
                    Ok(Some(price)) => Some(price),
                    Ok(None) => {
                        tracing::info!("[PRICE] Unknown token price {}", coin_key);
                        None
                    }
                    Err(err) => {
                        tracing::warn!("[PRICE] Price lookup failed for {}: {}", coin_key, err);
                        None
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl PriceOracle for DefiLlamaOracle {
    async fn native_price(&self, chain_id: u64, timestamp: Option<u64>) -> Option<f64> {
        let Some(chain) = ChainConfig::get(chain_id) else {
            tracing::warn!("[PRICE] No native price key for chain {}", chain_id);
            return None;
        };
        self.price(chain.native_price_key.to_string(), timestamp)
            .await
    }

    async fn erc20_price(
        &self,
        chain_id: u64,
        token: Address,
        timestamp: Option<u64>,
    ) -> Option<f64> {
        let Some(chain) = ChainConfig::get(chain_id) else {
            tracing::warn!("[PRICE] No price chain slug for chain {}", chain_id);
            return None;
        };
        let key = format!("{}:{}", chain.price_chain_slug, lower_hex(token));
        self.price(key, timestamp).await
    }
}

/// Fixed price table. Used when running against local nodes and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceOracle {
    pub native: Option<f64>,
    pub erc20: HashMap<Address, f64>,
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn native_price(&self, _chain_id: u64, _timestamp: Option<u64>) -> Option<f64> {
        self.native
    }

    async fn erc20_price(
        &self,
        _chain_id: u64,
        token: Address,
        _timestamp: Option<u64>,
    ) -> Option<f64> {
        self.erc20.get(&token).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::{price_path, CoinsResponse, TtlCache};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let cache: Arc<TtlCache<String, f64>> =
            Arc::new(TtlCache::new(Duration::from_secs(60), 16));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("coingecko:ethereum".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Some(2_000.0)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Some(2_000.0));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_absent_values_are_not_retained() {
        let cache: TtlCache<String, f64> = TtlCache::new(Duration::from_secs(60), 16);
        let first = cache
            .get_or_fetch("missing".to_string(), || async { None })
            .await;
        assert_eq!(first, None);
        assert!(cache.is_empty());
        let second = cache
            .get_or_fetch("missing".to_string(), || async { Some(1.5) })
            .await;
        assert_eq!(second, Some(1.5));
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(10), 16);
        assert_eq!(cache.get_or_fetch("k".to_string(), || async { Some(1) }).await, Some(1));
        assert_eq!(cache.get_or_fetch("k".to_string(), || async { Some(2) }).await, Some(1));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.get_or_fetch("k".to_string(), || async { Some(3) }).await, Some(3));
    }

    #[test]
    fn test_price_paths_and_response_shape() {
        assert_eq!(
            price_path("coingecko:ethereum", Some(1_700_000_000)),
            "/prices/historical/1700000000/coingecko:ethereum"
        );
        assert_eq!(price_path("bsc:0xabc", None), "/prices/current/bsc:0xabc");

        let body: CoinsResponse = serde_json::from_str(
            r#"{"coins":{"coingecko:ethereum":{"price":1834.5,"symbol":"ETH","confidence":0.99}}}"#,
        )
        .expect("body");
        assert_eq!(body.coins["coingecko:ethereum"].price, Some(1834.5));
    }
}
