//! Process-wide scan dependencies, built once at startup.

use crate::classifier::TokenMetadataCache;
use crate::config::chains::ChainConfig;
use crate::price_cache::{DefiLlamaOracle, PriceOracle};
use crate::report::AnomalyScore;
use crate::utils::config::{Config, ThresholdConfig};
use crate::utils::rpc::HttpProvider;
use alloy::primitives::U256;
use std::sync::Arc;
use std::time::Duration;

pub struct ScanContext {
    pub provider: HttpProvider,
    pub chain_id: u64,
    /// `None` for networks without static price data; scans still run but value nothing.
    pub chain: Option<ChainConfig>,
    pub oracle: Arc<dyn PriceOracle>,
    pub metadata: TokenMetadataCache,
    pub thresholds: ThresholdConfig,
    /// Value attached to the first pass over every selector.
    pub payable_value: U256,
    /// Prefix of outbound alert ids.
    pub developer_tag: String,
    pub anomaly: AnomalyScore,
}

impl ScanContext {
    pub fn new(config: &Config, provider: HttpProvider, chain_id: u64) -> anyhow::Result<Self> {
        let ttl = Duration::from_secs(config.price_cache_ttl_secs);
        let oracle: Arc<dyn PriceOracle> =
            Arc::new(DefiLlamaOracle::new(ttl, config.price_cache_max_entries));
        Self::with_oracle(config, provider, chain_id, oracle)
    }

    pub fn with_oracle(
        config: &Config,
        provider: HttpProvider,
        chain_id: u64,
        oracle: Arc<dyn PriceOracle>,
    ) -> anyhow::Result<Self> {
        let chain = ChainConfig::get(chain_id);
        if chain.is_none() {
            tracing::warn!(
                "[STARTUP] No static data for chain {}; token values will be unknown",
                chain_id
            );
        }
        let ttl = Duration::from_secs(config.price_cache_ttl_secs);
        Ok(Self {
            provider,
            chain_id,
            chain,
            oracle,
            metadata: TokenMetadataCache::new(ttl, config.price_cache_max_entries),
            thresholds: config.bot.thresholds_for_chain(chain_id)?,
            payable_value: config.bot.payable_probe_value_wei()?,
            developer_tag: config.bot.developer_abbreviation.clone(),
            anomaly: AnomalyScore::new(config.bot.default_anomaly_score_for_chain(chain_id)),
        })
    }

    pub fn native_symbol(&self) -> Option<&str> {
        self.chain.as_ref().map(|chain| chain.native_symbol)
    }
}
