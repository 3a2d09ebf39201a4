//! USD normalization and threshold checks over summed balance deltas.

use crate::balance_ledger::TotalBalanceChanges;
use crate::types::{lower_hex, TokenInterface, TokenKey};
use crate::utils::config::ThresholdConfig;
use alloy::primitives::{address, Address, I256};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

/// Well-known sink addresses. Value sent there is destroyed, not stolen.
pub const BURN_ADDRESSES: [Address; 18] = [
    address!("00000000000000000000045261d4ee77acdb3286"),
    address!("0123456789012345678901234567890123456789"),
    address!("1234567890123456789012345678901234567890"),
    address!("1111111111111111111111111111111111111111"),
    address!("2222222222222222222222222222222222222222"),
    address!("3333333333333333333333333333333333333333"),
    address!("4444444444444444444444444444444444444444"),
    address!("5555555555555555555555555555555555555555"),
    address!("6666666666666666666666666666666666666666"),
    address!("7777777777777777777777777777777777777777"),
    address!("8888888888888888888888888888888888888888"),
    address!("9999999999999999999999999999999999999999"),
    address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
    address!("dead000000000000000042069420694206942069"),
    address!("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"),
    address!("ffffffffffffffffffffffffffffffffffffffff"),
    address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
    address!("000000000000000000000000000000000000dead"),
];

/// Significant digits a `Decimal` mantissa holds without rounding.
const DECIMAL_DIGITS: usize = 28;

pub fn is_burn_address(account: Address) -> bool {
    lower_hex(account).contains("000000000000") || BURN_ADDRESSES.contains(&account)
}

fn saturated(negative: bool) -> Decimal {
    if negative {
        Decimal::MIN
    } else {
        Decimal::MAX
    }
}

/// `value / 10^decimals`, exact up to 28 significant digits. Magnitudes beyond `Decimal`
/// range saturate.
pub fn to_units(value: I256, decimals: u8) -> Decimal {
    let negative = value.is_negative();
    let digits = value.unsigned_abs().to_string();
    let scale = decimals as usize;

    let (int_part, frac_part) = if digits.len() > scale {
        let (int_part, frac_part) = digits.split_at(digits.len() - scale);
        (int_part.to_string(), frac_part.to_string())
    } else {
        ("0".to_string(), format!("{}{}", "0".repeat(scale - digits.len()), digits))
    };

    let significant_int = int_part.trim_start_matches('0');
    if significant_int.len() > DECIMAL_DIGITS {
        return saturated(negative);
    }
    let budget = DECIMAL_DIGITS - significant_int.len();
    let frac = &frac_part[..frac_part.len().min(budget)];
    let text = if frac.is_empty() {
        int_part
    } else {
        format!("{int_part}.{frac}")
    };
    match Decimal::from_str(&text) {
        Ok(units) if negative => -units,
        Ok(units) => units,
        Err(_) => saturated(negative),
    }
}

/// Prices and decimals known for the tokens of one candidate call. Missing entries mean
/// "unknown", which values the token at zero.
#[derive(Debug, Clone, Default)]
pub struct TokenMarket {
    pub prices_usd: HashMap<TokenKey, Decimal>,
    pub decimals: HashMap<TokenKey, u8>,
}

impl TokenMarket {
    pub fn usd_value(&self, token: TokenKey, amount: I256) -> Decimal {
        let (Some(price), Some(decimals)) = (self.prices_usd.get(&token), self.decimals.get(&token))
        else {
            return Decimal::ZERO;
        };
        to_units(amount, *decimals).saturating_mul(*price)
    }
}

pub struct ValuationInput<'a> {
    pub changes: &'a TotalBalanceChanges,
    pub contract: Address,
    pub deployer: Address,
    pub thresholds: &'a ThresholdConfig,
    pub market: &'a TokenMarket,
}

impl ValuationInput<'_> {
    /// Deployer native gain net of the contract's own native outflow.
    fn adjusted(&self, account: Address, token: TokenKey, value: I256) -> I256 {
        if token != TokenKey::Native || account != self.deployer {
            return value;
        }
        let contract_native = self.changes.delta(self.contract, TokenKey::Native);
        if contract_native.is_negative() {
            value.saturating_add(contract_native)
        } else {
            value
        }
    }

    fn crosses(&self, account: Address) -> bool {
        let Some(tokens) = self.changes.by_account.get(&account) else {
            return false;
        };
        let mut received_usd = Decimal::ZERO;
        for (token, value) in tokens {
            let per_token = self.thresholds.per_token.get(token);
            let interface = self.changes.interface_of(*token);
            match interface {
                Some(TokenInterface::Erc721) | Some(TokenInterface::Erc1155) => {
                    if let Some(limit) = per_token {
                        if to_units(*value, 0) > limit.threshold {
                            return true;
                        }
                    }
                }
                Some(TokenInterface::Native) | Some(TokenInterface::Erc20) => {
                    let profit = self.adjusted(account, *token, *value);
                    let usd = self.market.usd_value(*token, profit);
                    if let Some(limit) = per_token {
                        if usd > limit.threshold {
                            return true;
                        }
                    }
                    received_usd = received_usd.saturating_add(usd);
                    if received_usd > self.thresholds.global_usd {
                        return true;
                    }
                }
                None => {}
            }
        }
        false
    }

    /// First eligible account whose gains cross a threshold. `is_eoa` is asked only about
    /// accounts other than the contract and its deployer.
    pub fn highly_funded_account<F>(&self, mut is_eoa: F) -> Option<Address>
    where
        F: FnMut(Address) -> bool,
    {
        for account in self.changes.accounts() {
            if is_burn_address(account) {
                continue;
            }
            if account != self.contract && account != self.deployer && !is_eoa(account) {
                continue;
            }
            if self.crosses(account) {
                return Some(account);
            }
        }
        None
    }
}
