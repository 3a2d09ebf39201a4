//! Exploit reports and their outbound finding representation.

use crate::types::{lower_hex, TokenInterface, TokenKey};
use alloy::primitives::{Address, Bytes, Selector, B256, I256};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FindingSeverity {
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FindingType {
    Exploit,
}

fn serialize_signed<S: Serializer>(value: &I256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// One token movement of one account, resolved for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub interface: TokenInterface,
    pub address: TokenKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    #[serde(serialize_with = "serialize_signed")]
    pub value: I256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExploitReport {
    pub selector: Selector,
    /// Argument words only; the full call is `selector ++ calldata`.
    pub calldata: Bytes,
    pub contract_address: Address,
    pub deployer_address: Address,
    pub funded_address: Address,
    pub creation_tx_hash: B256,
    /// Per account, tokens sorted by value, largest first.
    pub balance_changes: BTreeMap<Address, Vec<TokenInfo>>,
    pub involved_addresses: BTreeSet<Address>,
    pub severity: FindingSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityType {
    Address,
    Transaction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub entity_type: EntityType,
    pub entity: String,
    pub label: String,
    pub confidence: f64,
    pub remove: bool,
}

impl Label {
    fn new(entity_type: EntityType, entity: String, label: &str) -> Self {
        Self {
            entity_type,
            entity,
            label: label.to_string(),
            confidence: 0.5,
            remove: false,
        }
    }
}

/// Outbound alert, serialized as one JSON line per finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub alert_id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub finding_type: FindingType,
    pub severity: FindingSeverity,
    pub addresses: Vec<String>,
    pub labels: Vec<Label>,
    pub metadata: BTreeMap<String, String>,
}

/// Share of scanned contracts that produced a finding. Until the first scan completes the
/// configured fallback is reported.
#[derive(Debug)]
pub struct AnomalyScore {
    fallback: f64,
    scanned: AtomicU64,
    flagged: AtomicU64,
}

impl AnomalyScore {
    pub fn new(fallback: f64) -> Self {
        Self {
            fallback,
            scanned: AtomicU64::new(0),
            flagged: AtomicU64::new(0),
        }
    }

    pub fn record_scan(&self, flagged: bool) {
        self.scanned.fetch_add(1, Ordering::Relaxed);
        if flagged {
            self.flagged.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> f64 {
        let scanned = self.scanned.load(Ordering::Relaxed);
        if scanned == 0 {
            return self.fallback;
        }
        let flagged = self.flagged.load(Ordering::Relaxed).min(scanned);
        flagged as f64 / scanned as f64
    }
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `value / 10^decimals` with thousands separators and no trailing fractional zeros.
pub fn format_token_amount(value: I256, decimals: u8) -> String {
    let digits = value.unsigned_abs().to_string();
    let scale = decimals as usize;
    let (int_part, frac_part) = if digits.len() > scale {
        let (i, f) = digits.split_at(digits.len() - scale);
        (i.to_string(), f.to_string())
    } else {
        ("0".to_string(), format!("{}{}", "0".repeat(scale - digits.len()), digits))
    };
    let frac = frac_part.trim_end_matches('0');
    let sign = if value.is_negative() { "-" } else { "" };
    if frac.is_empty() {
        format!("{sign}{}", group_thousands(&int_part))
    } else {
        format!("{sign}{}.{frac}", group_thousands(&int_part))
    }
}

fn format_tokens(tokens: &[TokenInfo]) -> String {
    tokens
        .iter()
        .map(|token| {
            format!(
                "{} {}",
                format_token_amount(token.value, token.decimals.unwrap_or(0)),
                token.name
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl ExploitReport {
    pub fn alert_id(developer_tag: &str) -> String {
        format!("{developer_tag}-ATTACK-SIMULATION-0")
    }

    pub fn description(&self) -> String {
        let sighash = format!("0x{}", hex::encode(self.selector));
        let contract = lower_hex(self.contract_address);
        let mut description =
            format!("Invocation of the function {sighash} of the created contract {contract} ");
        if self.funded_address == self.deployer_address {
            description.push_str(
                "leads to large balance increase in the contract deployer or function invoker account. ",
            );
        } else if self.funded_address == self.contract_address {
            description.push_str("leads to large balance increase in the deployed contract. ");
        } else {
            description.push_str(&format!(
                "leads to large balance increase in account {}. ",
                lower_hex(self.funded_address)
            ));
        }
        let funded_tokens = self
            .balance_changes
            .get(&self.funded_address)
            .map(|tokens| format_tokens(tokens))
            .unwrap_or_default();
        description.push_str(&format!("Tokens transferred: {funded_tokens}"));
        description
    }

    pub fn to_finding(&self, developer_tag: &str, anomaly_score: f64) -> Finding {
        let deployer = lower_hex(self.deployer_address);
        let contract = lower_hex(self.contract_address);
        let funded = lower_hex(self.funded_address);
        let tx_hash = format!("{:#x}", self.creation_tx_hash);

        let mut labels = vec![
            Label::new(EntityType::Address, deployer.clone(), "Attacker"),
            Label::new(EntityType::Address, contract.clone(), "Exploit"),
            Label::new(EntityType::Transaction, tx_hash.clone(), "Exploit"),
        ];
        if self.funded_address != self.deployer_address
            && self.funded_address != self.contract_address
        {
            labels.push(Label::new(EntityType::Address, funded.clone(), "Attacker"));
        }

        let balance_changes: BTreeMap<String, &Vec<TokenInfo>> = self
            .balance_changes
            .iter()
            .map(|(account, tokens)| (lower_hex(*account), tokens))
            .collect();
        let balance_changes_json = serde_json::to_string(&balance_changes).unwrap_or_default();

        let metadata = BTreeMap::from([
            ("sighash".to_string(), format!("0x{}", hex::encode(self.selector))),
            ("calldata".to_string(), format!("0x{}", hex::encode(&self.calldata))),
            ("contractAddress".to_string(), contract),
            ("fundedAddress".to_string(), funded),
            ("deployerAddress".to_string(), deployer),
            ("txHash".to_string(), tx_hash),
            ("anomaly_score".to_string(), anomaly_score.to_string()),
            ("balanceChanges".to_string(), balance_changes_json),
        ]);

        Finding {
            alert_id: Self::alert_id(developer_tag),
            name: "Potential Exploit Function".to_string(),
            description: self.description(),
            finding_type: FindingType::Exploit,
            severity: self.severity,
            addresses: self.involved_addresses.iter().map(|a| lower_hex(*a)).collect(),
            labels,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{format_token_amount, AnomalyScore, ExploitReport, FindingSeverity, TokenInfo};
    use crate::types::{TokenInterface, TokenKey};
    use alloy::primitives::{address, Bytes, Selector, B256, I256, U256};
    use std::collections::{BTreeMap, BTreeSet};

    fn sample(funded_is_deployer: bool) -> ExploitReport {
        let contract = address!("c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0");
        let deployer = address!("d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1");
        let eoa = address!("beefbeefbeefbeefbeefbeefbeefbeefbeefbeef");
        let funded = if funded_is_deployer { deployer } else { eoa };
        let value = I256::try_from(U256::from(2_000_000_000_000_000_000_001u128)).expect("i256");
        let tokens = vec![TokenInfo {
            name: "ETH".to_string(),
            interface: TokenInterface::Native,
            address: TokenKey::Native,
            decimals: Some(18),
            value,
        }];
        ExploitReport {
            selector: Selector::from([0x3c, 0xcf, 0xd6, 0x0b]),
            calldata: Bytes::new(),
            contract_address: contract,
            deployer_address: deployer,
            funded_address: funded,
            creation_tx_hash: B256::repeat_byte(0xab),
            balance_changes: BTreeMap::from([(funded, tokens)]),
            involved_addresses: BTreeSet::from([contract, deployer, funded]),
            severity: FindingSeverity::Critical,
        }
    }

    #[test]
    fn test_format_token_amount_groups_and_trims() {
        let v = I256::try_from(1_234_567_890_000_000_000_000i128).expect("i256");
        assert_eq!(format_token_amount(v, 18), "1,234.56789");
        assert_eq!(format_token_amount(I256::try_from(-5).expect("i256"), 1), "-0.5");
        assert_eq!(format_token_amount(I256::try_from(1_000_000).expect("i256"), 0), "1,000,000");
    }

    #[test]
    fn test_finding_for_foreign_account() {
        let report = sample(false);
        let finding = report.to_finding("AK", 0.25);
        assert_eq!(finding.alert_id, "AK-ATTACK-SIMULATION-0");
        assert!(finding.description.contains(
            "leads to large balance increase in account 0xbeefbeefbeefbeefbeefbeefbeefbeefbeefbeef"
        ));
        assert!(finding
            .description
            .ends_with("Tokens transferred: 2,000.000000000000000001 ETH"));
        assert_eq!(finding.labels.len(), 4);
        assert_eq!(finding.metadata["sighash"], "0x3ccfd60b");
        assert_eq!(finding.metadata["anomaly_score"], "0.25");
        assert_eq!(
            finding.metadata["fundedAddress"],
            "0xbeefbeefbeefbeefbeefbeefbeefbeefbeefbeef"
        );

        let json = serde_json::to_value(&finding).expect("json");
        assert_eq!(json["severity"], "Critical");
        assert_eq!(json["type"], "Exploit");
        assert_eq!(json["labels"][2]["entityType"], "Transaction");
        let changes: serde_json::Value =
            serde_json::from_str(&finding.metadata["balanceChanges"]).expect("changes");
        let entry = &changes["0xbeefbeefbeefbeefbeefbeefbeefbeefbeefbeef"][0];
        assert_eq!(entry["type"], "native");
        assert_eq!(entry["address"], "native");
        assert_eq!(entry["value"], "2000000000000000000001");
    }

    #[test]
    fn test_finding_for_deployer_has_three_labels() {
        let finding = sample(true).to_finding("AK", 0.25);
        assert!(finding
            .description
            .contains("contract deployer or function invoker account"));
        assert_eq!(finding.labels.len(), 3);
    }

    #[test]
    fn test_anomaly_score_tracks_flagged_share() {
        let score = AnomalyScore::new(0.002);
        assert_eq!(score.current(), 0.002);
        score.record_scan(false);
        score.record_scan(false);
        score.record_scan(false);
        assert_eq!(score.current(), 0.0);
        score.record_scan(true);
        assert_eq!(score.current(), 0.25);
    }
}
