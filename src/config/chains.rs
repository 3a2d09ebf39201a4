/// Static per-network data needed for valuation and reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: &'static str,
    /// Symbol used for the native currency in reports.
    pub native_symbol: &'static str,
    /// DefiLlama coin key of the native currency (`coingecko:<id>`).
    pub native_price_key: &'static str,
    /// DefiLlama chain slug used to build ERC20 price keys (`<slug>:<address>`).
    pub price_chain_slug: &'static str,
}

impl ChainConfig {
    pub fn get(chain_id: u64) -> Option<Self> {
        match chain_id {
            1 => Some(Self::mainnet()),
            10 => Some(Self::optimism()),
            56 => Some(Self::bsc()),
            137 => Some(Self::polygon()),
            250 => Some(Self::fantom()),
            8453 => Some(Self::base()),
            42161 => Some(Self::arbitrum()),
            43114 => Some(Self::avalanche()),
            _ => None,
        }
    }

    pub fn mainnet() -> Self {
        Self {
            chain_id: 1,
            name: "Ethereum Mainnet",
            native_symbol: "ETH",
            native_price_key: "coingecko:ethereum",
            price_chain_slug: "ethereum",
        }
    }

    pub fn optimism() -> Self {
        // No native token of its own: value moves in ETH.
        Self {
            chain_id: 10,
            name: "Optimism",
            native_symbol: "ETH",
            native_price_key: "coingecko:ethereum",
            price_chain_slug: "optimism",
        }
    }

    pub fn bsc() -> Self {
        Self {
            chain_id: 56,
            name: "BNB Smart Chain",
            native_symbol: "BNB",
            native_price_key: "coingecko:binancecoin",
            price_chain_slug: "bsc",
        }
    }

    pub fn polygon() -> Self {
        Self {
            chain_id: 137,
            name: "Polygon",
            native_symbol: "MATIC",
            native_price_key: "coingecko:matic-network",
            price_chain_slug: "polygon",
        }
    }

    pub fn fantom() -> Self {
        Self {
            chain_id: 250,
            name: "Fantom",
            native_symbol: "FTM",
            native_price_key: "coingecko:fantom",
            price_chain_slug: "fantom",
        }
    }

    pub fn base() -> Self {
        Self {
            chain_id: 8453,
            name: "Base",
            native_symbol: "ETH",
            native_price_key: "coingecko:ethereum",
            price_chain_slug: "base",
        }
    }

    pub fn arbitrum() -> Self {
        Self {
            chain_id: 42161,
            name: "Arbitrum One",
            native_symbol: "ETH",
            native_price_key: "coingecko:ethereum",
            price_chain_slug: "arbitrum",
        }
    }

    pub fn avalanche() -> Self {
        Self {
            chain_id: 43114,
            name: "Avalanche C-Chain",
            native_symbol: "AVAX",
            native_price_key: "coingecko:avalanche-2",
            price_chain_slug: "avax",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChainConfig;

    #[test]
    fn test_known_chains_resolve_price_keys() {
        let mainnet = ChainConfig::get(1).expect("mainnet");
        assert_eq!(mainnet.native_price_key, "coingecko:ethereum");
        assert_eq!(ChainConfig::get(56).expect("bsc").native_symbol, "BNB");
        assert_eq!(
            ChainConfig::get(42161).expect("arbitrum").native_price_key,
            "coingecko:ethereum"
        );
    }

    #[test]
    fn test_unknown_chain_has_no_config() {
        assert!(ChainConfig::get(999_999).is_none());
    }
}
