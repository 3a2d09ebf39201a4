//! Per-account token balance deltas derived from one executed call.

use crate::types::{TokenInterface, TokenKey};
use alloy::primitives::{Address, Log, I256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use std::collections::{BTreeMap, BTreeSet};

mod erc20 {
    alloy::sol! {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

mod erc721 {
    alloy::sol! {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }
}

sol! {
    event TransferSingle(address indexed operator, address indexed from, address indexed to, uint256 id, uint256 value);
    event TransferBatch(address indexed operator, address indexed from, address indexed to, uint256[] ids, uint256[] values);
}

/// Token id used for balances that have no per-id breakdown (native, ERC20).
const FUNGIBLE_ID: U256 = U256::ZERO;

/// Effects of one successfully executed call, as seen by the ledger.
#[derive(Debug, Clone, Default)]
pub struct ExecutedCall {
    pub sender: Address,
    pub recipient: Address,
    pub logs: Vec<Log>,
    pub gas_used: u64,
    pub gas_price: U256,
    /// Native balance `(before, after)` for every account the execution touched.
    pub native_balances: BTreeMap<Address, (U256, U256)>,
}

impl ExecutedCall {
    pub fn log_emitters(&self) -> BTreeSet<Address> {
        self.logs.iter().map(|log| log.address).collect()
    }
}

/// Saturating conversion; token amounts beyond `I256::MAX` are clamped.
pub fn to_signed(value: U256) -> I256 {
    I256::try_from(value).unwrap_or(I256::MAX)
}

fn signed_diff(after: U256, before: U256) -> I256 {
    if after >= before {
        to_signed(after - before)
    } else {
        to_signed(before - after).saturating_neg()
    }
}

/// Deltas broken down per token id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceChanges {
    pub by_account: BTreeMap<Address, BTreeMap<TokenKey, BTreeMap<U256, I256>>>,
    pub interfaces: BTreeMap<TokenKey, TokenInterface>,
}

/// Deltas summed across token ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TotalBalanceChanges {
    pub by_account: BTreeMap<Address, BTreeMap<TokenKey, I256>>,
    pub interfaces: BTreeMap<TokenKey, TokenInterface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundCheck {
    NotRefund,
    /// Contract and deployer moved the same tokens by the same magnitudes and nothing else
    /// changed. `all_zero` marks the degenerate case where every magnitude is zero.
    Refund { all_zero: bool },
}

impl BalanceChanges {
    fn entry(&mut self, account: Address, token: TokenKey) -> &mut BTreeMap<U256, I256> {
        self.by_account
            .entry(account)
            .or_default()
            .entry(token)
            .or_default()
    }

    fn add(&mut self, account: Address, token: TokenKey, id: U256, amount: I256) {
        let slot = self.entry(account, token).entry(id).or_insert(I256::ZERO);
        *slot = slot.saturating_add(amount);
    }

    fn move_units(&mut self, token: TokenKey, from: Address, to: Address, id: U256, amount: I256) {
        self.add(from, token, id, amount.saturating_neg());
        self.add(to, token, id, amount);
    }

    fn apply_log(&mut self, log: &Log) {
        let topics = log.data.topics();
        let Some(signature) = topics.first() else {
            return;
        };
        let token = TokenKey::Contract(log.address);

        if *signature == erc20::Transfer::SIGNATURE_HASH {
            match topics.len() {
                3 => {
                    if let Ok(event) = erc20::Transfer::decode_log_data(&log.data, true) {
                        self.interfaces.insert(token, TokenInterface::Erc20);
                        self.move_units(token, event.from, event.to, FUNGIBLE_ID, to_signed(event.value));
                    }
                }
                4 => {
                    if let Ok(event) = erc721::Transfer::decode_log_data(&log.data, true) {
                        self.interfaces.insert(token, TokenInterface::Erc721);
                        // Ownership of one id moves: the previous owner ends at -1, the new one at +1.
                        self.entry(event.from, token)
                            .insert(event.tokenId, I256::MINUS_ONE);
                        self.entry(event.to, token).insert(event.tokenId, I256::ONE);
                    }
                }
                _ => {}
            }
            return;
        }

        if *signature == TransferSingle::SIGNATURE_HASH {
            if let Ok(event) = TransferSingle::decode_log_data(&log.data, true) {
                self.interfaces.insert(token, TokenInterface::Erc1155);
                self.move_units(token, event.from, event.to, event.id, to_signed(event.value));
            }
            return;
        }

        if *signature == TransferBatch::SIGNATURE_HASH {
            if let Ok(event) = TransferBatch::decode_log_data(&log.data, true) {
                self.interfaces.insert(token, TokenInterface::Erc1155);
                for (id, value) in event.ids.iter().zip(event.values.iter()) {
                    self.move_units(token, event.from, event.to, *id, to_signed(*value));
                }
            }
        }
    }

    /// Token transfers from the call's logs plus native movements. Gas paid by the sender
    /// is added back so the sender's native delta reflects value moved, not fees.
    pub fn from_call(call: &ExecutedCall) -> Self {
        let mut changes = Self::default();
        for log in &call.logs {
            changes.apply_log(log);
        }

        changes
            .interfaces
            .insert(TokenKey::Native, TokenInterface::Native);
        let mut accounts: BTreeSet<Address> = changes.by_account.keys().copied().collect();
        accounts.extend(call.native_balances.keys().copied());
        accounts.insert(call.sender);
        accounts.insert(call.recipient);

        let gas_cost = U256::from(call.gas_used).saturating_mul(call.gas_price);
        for account in accounts {
            let Some((before, after)) = call.native_balances.get(&account) else {
                continue;
            };
            let mut diff = signed_diff(*after, *before);
            if account == call.sender {
                diff = diff.saturating_add(to_signed(gas_cost));
            }
            if !diff.is_zero() {
                changes
                    .entry(account, TokenKey::Native)
                    .insert(FUNGIBLE_ID, diff);
            }
        }
        changes
    }

    pub fn totals(&self) -> TotalBalanceChanges {
        let by_account = self
            .by_account
            .iter()
            .map(|(account, tokens)| {
                let summed = tokens
                    .iter()
                    .map(|(token, ids)| {
                        let total = ids
                            .values()
                            .fold(I256::ZERO, |acc, v| acc.saturating_add(*v));
                        (*token, total)
                    })
                    .collect();
                (*account, summed)
            })
            .collect();
        TotalBalanceChanges {
            by_account,
            interfaces: self.interfaces.clone(),
        }
    }
}

impl TotalBalanceChanges {
    pub fn from_call(call: &ExecutedCall) -> Self {
        BalanceChanges::from_call(call).totals()
    }

    pub fn delta(&self, account: Address, token: TokenKey) -> I256 {
        self.by_account
            .get(&account)
            .and_then(|tokens| tokens.get(&token))
            .copied()
            .unwrap_or(I256::ZERO)
    }

    pub fn interface_of(&self, token: TokenKey) -> Option<TokenInterface> {
        self.interfaces.get(&token).copied()
    }

    /// Every account with at least one entry.
    pub fn accounts(&self) -> impl Iterator<Item = Address> + '_ {
        self.by_account.keys().copied()
    }

    pub fn check_refund(&self, contract: Address, deployer: Address) -> RefundCheck {
        if self.by_account.len() != 2 {
            return RefundCheck::NotRefund;
        }
        let (Some(contract_changes), Some(deployer_changes)) =
            (self.by_account.get(&contract), self.by_account.get(&deployer))
        else {
            return RefundCheck::NotRefund;
        };
        if contract_changes.len() != deployer_changes.len() {
            return RefundCheck::NotRefund;
        }
        let mirrored = deployer_changes.iter().all(|(token, value)| {
            contract_changes
                .get(token)
                .is_some_and(|other| other.unsigned_abs() == value.unsigned_abs())
        });
        if !mirrored {
            return RefundCheck::NotRefund;
        }
        RefundCheck::Refund {
            all_zero: deployer_changes.values().all(|v| v.is_zero()),
        }
    }
}
