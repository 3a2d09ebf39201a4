//! Domain records shared by the scheduler, the simulator and the report builder.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scan priorities. Lower is more urgent.
pub const LOW_PRIORITY: u8 = 9;
pub const NORMAL_PRIORITY: u8 = 4;
pub const HIGH_PRIORITY: u8 = 1;

/// A contract observed as created on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedContract {
    pub address: Address,
    /// Sender of the creating transaction, even when the contract was created by a factory.
    pub deployer: Address,
    pub block_number: u64,
    pub timestamp: u64,
    pub tx_hash: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedContract {
    pub contract: CreatedContract,
    pub priority: u8,
}

/// Token standard a balance movement was observed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenInterface {
    #[serde(rename = "native")]
    Native,
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
    #[serde(rename = "ERC1155")]
    Erc1155,
}

impl TokenInterface {
    /// Whether deltas of this standard are valued in USD (fungible) or counted in units (NFT).
    pub fn is_fungible(self) -> bool {
        matches!(self, TokenInterface::Native | TokenInterface::Erc20)
    }
}

/// Identity of a balance: the chain's native currency or a token contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenKey {
    Native,
    Contract(Address),
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKey::Native => f.write_str("native"),
            TokenKey::Contract(address) => write!(f, "{address:#x}"),
        }
    }
}

impl FromStr for TokenKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("native") {
            return Ok(TokenKey::Native);
        }
        Address::from_str(trimmed)
            .map(TokenKey::Contract)
            .map_err(|err| format!("invalid token key `{trimmed}`: {err}"))
    }
}

impl Serialize for TokenKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Lower-case `0x` rendering used in every externally visible address field.
pub fn lower_hex(address: Address) -> String {
    format!("{address:#x}")
}
