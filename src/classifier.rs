//! Turns the effects of a successful candidate call into an exploit report, when the gains
//! of some eligible account cross a configured threshold.

use crate::balance_ledger::{RefundCheck, TotalBalanceChanges};
use crate::fork_simulator::{CallEvaluator, ForkProbe, SuccessfulCall};
use crate::price_cache::{PriceOracle, TtlCache};
use crate::report::{ExploitReport, FindingSeverity, TokenInfo};
use crate::types::{CreatedContract, TokenInterface, TokenKey};
use crate::utils::config::ThresholdConfig;
use crate::valuation::{TokenMarket, ValuationInput};
use alloy::primitives::{Address, Bytes};
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

sol! {
    function decimals() external view returns (uint8);
    function symbol() external view returns (string);
    function name() external view returns (string);
}

pub const NATIVE_DECIMALS: u8 = 18;
const UNKNOWN_TOKEN_NAME: &str = "unknown";

/// Token names and decimals read from token contracts, shared across scans.
pub struct TokenMetadataCache {
    names: TtlCache<Address, String>,
    decimals: TtlCache<Address, u8>,
}

impl TokenMetadataCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            names: TtlCache::new(ttl, max_entries),
            decimals: TtlCache::new(ttl, max_entries),
        }
    }
}

fn read_decimals<P: ForkProbe>(probe: &mut P, token: Address) -> Option<u8> {
    let out = probe.static_call(token, Bytes::from(decimalsCall {}.abi_encode()))?;
    decimalsCall::abi_decode_returns(&out, true)
        .ok()
        .map(|ret| ret._0)
}

fn read_name<P: ForkProbe>(probe: &mut P, token: Address) -> Option<String> {
    let symbol = probe
        .static_call(token, Bytes::from(symbolCall {}.abi_encode()))
        .and_then(|out| symbolCall::abi_decode_returns(&out, true).ok())
        .map(|ret| ret._0)
        .filter(|s| !s.is_empty());
    if symbol.is_some() {
        return symbol;
    }
    probe
        .static_call(token, Bytes::from(nameCall {}.abi_encode()))
        .and_then(|out| nameCall::abi_decode_returns(&out, true).ok())
        .map(|ret| ret._0)
        .filter(|s| !s.is_empty())
}

/// Evaluates successful calls for one created contract.
pub struct ExploitClassifier<'a> {
    pub chain_id: u64,
    /// Report name of the native currency; `None` on networks without static data.
    pub native_symbol: Option<&'a str>,
    pub oracle: &'a dyn PriceOracle,
    pub thresholds: &'a ThresholdConfig,
    pub metadata: &'a TokenMetadataCache,
    pub created: &'a CreatedContract,
}

impl ExploitClassifier<'_> {
    async fn token_decimals<P: ForkProbe + Send>(
        &self,
        probe: &mut P,
        token: TokenKey,
    ) -> Option<u8> {
        match token {
            TokenKey::Native => Some(NATIVE_DECIMALS),
            TokenKey::Contract(address) => {
                self.metadata
                    .decimals
                    .get_or_fetch(address, || {
                        let decimals = read_decimals(probe, address);
                        async move { decimals }
                    })
                    .await
            }
        }
    }

    async fn token_name<P: ForkProbe + Send>(&self, probe: &mut P, token: TokenKey) -> String {
        if let Some(name) = self.thresholds.known_name(&token) {
            return name.to_string();
        }
        match token {
            TokenKey::Native => self
                .native_symbol
                .unwrap_or(UNKNOWN_TOKEN_NAME)
                .to_string(),
            TokenKey::Contract(address) => {
                self.metadata
                    .names
                    .get_or_fetch(address, || {
                        let name = read_name(probe, address);
                        async move { name }
                    })
                    .await
                    .unwrap_or_else(|| UNKNOWN_TOKEN_NAME.to_string())
            }
        }
    }

    async fn token_price(&self, token: TokenKey) -> Option<Decimal> {
        let timestamp = Some(self.created.timestamp);
        let price = match token {
            TokenKey::Native => self.oracle.native_price(self.chain_id, timestamp).await,
            TokenKey::Contract(address) => {
                self.oracle
                    .erc20_price(self.chain_id, address, timestamp)
                    .await
            }
        }?;
        Decimal::try_from(price).ok()
    }

    /// Prices and decimals for every fungible token in `changes`.
    async fn market<P: ForkProbe + Send>(
        &self,
        probe: &mut P,
        changes: &TotalBalanceChanges,
    ) -> TokenMarket {
        let mut market = TokenMarket::default();
        for (token, interface) in &changes.interfaces {
            if !interface.is_fungible() {
                continue;
            }
            if let Some(price) = self.token_price(*token).await {
                market.prices_usd.insert(*token, price);
            }
            if let Some(decimals) = self.token_decimals(probe, *token).await {
                market.decimals.insert(*token, decimals);
            }
        }
        market
    }

    async fn balance_changes<P: ForkProbe + Send>(
        &self,
        probe: &mut P,
        changes: &TotalBalanceChanges,
    ) -> BTreeMap<Address, Vec<TokenInfo>> {
        let mut names: BTreeMap<TokenKey, String> = BTreeMap::new();
        let mut decimals: BTreeMap<TokenKey, Option<u8>> = BTreeMap::new();
        let mut out = BTreeMap::new();
        for (account, tokens) in &changes.by_account {
            let mut infos = Vec::new();
            for (token, value) in tokens {
                if value.is_zero() {
                    continue;
                }
                let interface = changes
                    .interface_of(*token)
                    .unwrap_or(TokenInterface::Erc20);
                if !names.contains_key(token) {
                    let name = self.token_name(probe, *token).await;
                    names.insert(*token, name);
                }
                if !decimals.contains_key(token) {
                    let resolved = if interface.is_fungible() {
                        self.token_decimals(probe, *token).await
                    } else {
                        None
                    };
                    decimals.insert(*token, resolved);
                }
                infos.push(TokenInfo {
                    name: names.get(token).cloned().unwrap_or_default(),
                    interface,
                    address: *token,
                    decimals: decimals.get(token).copied().flatten(),
                    value: *value,
                });
            }
            if infos.is_empty() {
                continue;
            }
            infos.sort_by(|a, b| b.value.cmp(&a.value));
            out.insert(*account, infos);
        }
        out
    }
}

#[async_trait]
impl<'a, P: ForkProbe + Send> CallEvaluator<P> for ExploitClassifier<'a> {
    async fn evaluate(&mut self, probe: &mut P, call: SuccessfulCall) -> Option<ExploitReport> {
        let changes = TotalBalanceChanges::from_call(&call.call);

        match changes.check_refund(call.contract, call.deployer) {
            RefundCheck::NotRefund => {}
            RefundCheck::Refund { all_zero: true } => {
                tracing::debug!(
                    "[SCAN] Call {} of {} moved no value",
                    call.selector,
                    call.contract
                );
                return None;
            }
            RefundCheck::Refund { all_zero: false } => {
                tracing::warn!(
                    "[SCAN] Skip refund function {} of {}",
                    call.selector,
                    call.contract
                );
                return None;
            }
        }

        let market = self.market(probe, &changes).await;
        let input = ValuationInput {
            changes: &changes,
            contract: call.contract,
            deployer: call.deployer,
            thresholds: self.thresholds,
            market: &market,
        };
        let funded = input.highly_funded_account(|account| probe.is_externally_owned(account))?;

        tracing::info!(
            "[SCAN] Threshold crossed by {} via {} of {}",
            funded,
            call.selector,
            call.contract
        );

        let balance_changes = self.balance_changes(probe, &changes).await;
        let mut involved_addresses: BTreeSet<Address> = BTreeSet::from([call.deployer, call.contract]);
        involved_addresses.extend(changes.accounts());
        involved_addresses.extend(call.call.log_emitters());

        Some(ExploitReport {
            selector: call.selector,
            calldata: call.arguments,
            contract_address: call.contract,
            deployer_address: call.deployer,
            funded_address: funded,
            creation_tx_hash: self.created.tx_hash,
            balance_changes,
            involved_addresses,
            severity: FindingSeverity::Critical,
        })
    }
}
