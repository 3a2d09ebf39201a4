use crate::error::{BotError, ConfigError, Result};
use crate::types::{TokenKey, LOW_PRIORITY};
use crate::utils::env_guard::parse_bool_flag;
use alloy::primitives::U256;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_BOT_CONFIG_PATH: &str = "bot-config.json";
/// Two days.
const DEFAULT_CONTRACT_WAITING_SECS: u64 = 2 * 24 * 60 * 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 4_000;
const DEFAULT_PRICE_CACHE_TTL_SECS: u64 = 60 * 60;
const DEFAULT_PRICE_CACHE_MAX_ENTRIES: usize = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct RawTokenThreshold {
    pub name: String,
    pub threshold: f64,
}

/// Operator-facing bot configuration, read from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub developer_abbreviation: String,
    pub payable_function_ether_value: f64,
    pub total_usd_transfer_threshold: f64,
    /// Anomaly score reported before any scan has completed, keyed by chain id.
    #[serde(default)]
    pub default_anomaly_score: HashMap<String, f64>,
    pub aztec_contract_bot_id: String,
    #[serde(rename = "maliciousContractMLBotId")]
    pub malicious_contract_ml_bot_id: String,
    pub tornado_cash_contract_bot_id: String,
    pub flashloan_contract_bot_id: String,
    #[serde(default)]
    pub total_tokens_thresholds_by_chain: HashMap<String, HashMap<String, RawTokenThreshold>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenThreshold {
    pub name: String,
    pub threshold: Decimal,
}

/// Thresholds in effect for one chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub global_usd: Decimal,
    pub per_token: HashMap<TokenKey, TokenThreshold>,
}

impl ThresholdConfig {
    pub fn known_name(&self, token: &TokenKey) -> Option<&str> {
        self.per_token.get(token).map(|t| t.name.as_str())
    }
}

impl BotConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| BotError::BotConfigFile {
            path: path.clone(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Value sent with the payable probe branch, in wei.
    pub fn payable_probe_value_wei(&self) -> Result<U256> {
        let raw = self.payable_function_ether_value.to_string();
        alloy::primitives::utils::parse_ether(&raw).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "payableFunctionEtherValue `{raw}` is not an ether amount: {e}"
            ))
            .into()
        })
    }

    /// Fallback anomaly score for `chain_id`, or mainnet's when the chain has none.
    pub fn default_anomaly_score_for_chain(&self, chain_id: u64) -> f64 {
        self.default_anomaly_score
            .get(&chain_id.to_string())
            .or_else(|| self.default_anomaly_score.get("1"))
            .copied()
            .unwrap_or(0.0)
    }

    /// Resolve thresholds for `chain_id`, normalizing token keys.
    pub fn thresholds_for_chain(&self, chain_id: u64) -> Result<ThresholdConfig> {
        let global_usd = decimal_from_f64("totalUsdTransferThreshold", self.total_usd_transfer_threshold)?;
        let mut per_token = HashMap::new();
        if let Some(records) = self
            .total_tokens_thresholds_by_chain
            .get(&chain_id.to_string())
        {
            for (raw_key, record) in records {
                let key = TokenKey::from_str(raw_key).map_err(ConfigError::InvalidConfig)?;
                let threshold = decimal_from_f64(raw_key, record.threshold)?;
                per_token.insert(
                    key,
                    TokenThreshold {
                        name: record.name.clone(),
                        threshold,
                    },
                );
            }
        }
        Ok(ThresholdConfig {
            global_usd,
            per_token,
        })
    }
}

fn decimal_from_f64(name: &str, value: f64) -> Result<Decimal> {
    Decimal::try_from(value).map_err(|e| {
        ConfigError::InvalidConfig(format!("{name} must be a finite number, got {value}: {e}"))
            .into()
    })
}

pub struct Config {
    pub eth_rpc_url: String,
    pub chain_id: Option<u64>,
    pub bot: BotConfig,
    /// SQLite file backing the scan queue. `None` keeps the queue in memory only.
    pub queue_db_path: Option<PathBuf>,
    pub target_mode: bool,
    pub debug: bool,
    pub contract_waiting_secs: u64,
    pub default_priority: u8,
    pub poll_interval_ms: u64,
    pub price_cache_ttl_secs: u64,
    pub price_cache_max_entries: usize,
    pub alerts_from_stdin: bool,
}

pub(crate) fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        ConfigError::InvalidConfig(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "{name} must use http(s) scheme, got `{other}`"
        ))
        .into()),
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| parse_bool_flag(&v)).unwrap_or(false)
}

fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidConfig(format!("{name} has an invalid value `{raw}`")).into()
        }),
        _ => Ok(None),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let eth_rpc_url = env::var("ETH_RPC_URL")
            .map_err(|_| ConfigError::MissingConfig("ETH_RPC_URL must be set".to_string()))?;
        validate_http_url("ETH_RPC_URL", &eth_rpc_url)?;

        let bot_config_path = env::var("BOT_CONFIG_PATH")
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BOT_CONFIG_PATH));
        let bot = BotConfig::load(&bot_config_path)?;
        // Fail at startup rather than on the first scan.
        bot.payable_probe_value_wei()?;

        let default_priority = env_parsed::<u8>("DEFAULT_PRIORITY")?.unwrap_or(LOW_PRIORITY);

        Ok(Self {
            eth_rpc_url,
            chain_id: env_parsed::<u64>("CHAIN_ID")?,
            bot,
            queue_db_path: env::var("QUEUE_DB_PATH")
                .ok()
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .map(PathBuf::from),
            target_mode: env_flag("TARGET_MODE"),
            debug: env_flag("DEBUG"),
            contract_waiting_secs: env_parsed::<u64>("CONTRACT_WAITING_SECS")?
                .unwrap_or(DEFAULT_CONTRACT_WAITING_SECS),
            default_priority,
            poll_interval_ms: env_parsed::<u64>("POLL_INTERVAL_MS")?
                .filter(|v| *v >= 250)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            price_cache_ttl_secs: env_parsed::<u64>("PRICE_CACHE_TTL_SECS")?
                .unwrap_or(DEFAULT_PRICE_CACHE_TTL_SECS),
            price_cache_max_entries: env_parsed::<usize>("PRICE_CACHE_MAX_ENTRIES")?
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_PRICE_CACHE_MAX_ENTRIES),
            alerts_from_stdin: env_flag("ALERTS_FROM_STDIN"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_http_url, BotConfig};
    use crate::types::TokenKey;
    use alloy::primitives::{address, U256};
    use rust_decimal::Decimal;

    const SAMPLE: &str = r#"{
        "developerAbbreviation": "AK",
        "payableFunctionEtherValue": 10,
        "totalUsdTransferThreshold": 4000,
        "defaultAnomalyScore": { "1": 0.0012, "56": 0.004 },
        "aztecContractBotId": "0xaztec",
        "maliciousContractMLBotId": "0xml",
        "tornadoCashContractBotId": "0xtornado",
        "flashloanContractBotId": "0xflash",
        "totalTokensThresholdsByChain": {
            "1": {
                "0xBC4CA0EdA7647A8aB7C2061c2E118A18a936f13D": { "name": "BAYC", "threshold": 3 }
            }
        }
    }"#;

    #[test]
    fn test_bot_config_parses_and_normalizes_token_keys() {
        let config = BotConfig::from_json(SAMPLE).expect("config");
        assert_eq!(config.developer_abbreviation, "AK");
        assert_eq!(config.malicious_contract_ml_bot_id, "0xml");

        let thresholds = config.thresholds_for_chain(1).expect("thresholds");
        assert_eq!(thresholds.global_usd, Decimal::from(4000));
        let bayc = TokenKey::Contract(address!("bc4ca0eda7647a8ab7c2061c2e118a18a936f13d"));
        let entry = thresholds.per_token.get(&bayc).expect("bayc threshold");
        assert_eq!(entry.name, "BAYC");
        assert_eq!(entry.threshold, Decimal::from(3));

        assert!(config
            .thresholds_for_chain(56)
            .expect("bsc")
            .per_token
            .is_empty());
    }

    #[test]
    fn test_default_anomaly_score_falls_back_to_mainnet() {
        let config = BotConfig::from_json(SAMPLE).expect("config");
        assert_eq!(config.default_anomaly_score_for_chain(56), 0.004);
        assert_eq!(config.default_anomaly_score_for_chain(10), 0.0012);
    }

    #[test]
    fn test_payable_probe_value_is_in_wei() {
        let config = BotConfig::from_json(SAMPLE).expect("config");
        let ten_ether = U256::from(10u64) * U256::from(10u64).pow(U256::from(18u64));
        assert_eq!(config.payable_probe_value_wei().expect("wei"), ten_ether);
    }

    #[test]
    fn test_validate_http_url_rejects_ws_scheme() {
        assert!(validate_http_url("ETH_RPC_URL", "https://rpc.example.org").is_ok());
        assert!(validate_http_url("ETH_RPC_URL", "wss://rpc.example.org").is_err());
        assert!(validate_http_url("ETH_RPC_URL", "not a url").is_err());
    }
}
