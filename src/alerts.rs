//! Correlated alerts from upstream detectors, routed to a scan priority.

use crate::types::{HIGH_PRIORITY, NORMAL_PRIORITY};
use crate::utils::config::BotConfig;
use alloy::primitives::Address;
use chrono::DateTime;
use serde::Deserialize;
use std::str::FromStr;

pub const ACCEPTED_ALERT_IDS: [&str; 5] = [
    "SUSPICIOUS-CONTRACT-CREATION",
    "SUSPICIOUS-FLASHLOAN-CONTRACT-CREATION",
    "FLASHLOAN-CONTRACT-CREATION",
    "SUSPICIOUS-CONTRACT-CREATION-TORNADO-CASH",
    "AK-AZTEC-PROTOCOL-FUNDED-ACCOUNT-DEPLOYMENT",
];

/// Length of a `0x`-prefixed hex address.
const ADDRESS_CHARS: usize = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertSource {
    TornadoCash,
    Aztec,
    MaliciousContractMl,
    Flashloan,
}

impl AlertSource {
    pub fn priority(self) -> u8 {
        match self {
            AlertSource::TornadoCash => NORMAL_PRIORITY,
            AlertSource::Aztec => HIGH_PRIORITY,
            AlertSource::MaliciousContractMl => HIGH_PRIORITY,
            AlertSource::Flashloan => HIGH_PRIORITY,
        }
    }

    /// Pulls the referenced contract out of the alert text.
    pub fn referenced_address(self, body: &AlertBody) -> Option<Address> {
        let raw = match self {
            AlertSource::TornadoCash => head(body.description.as_deref()?),
            AlertSource::Aztec => tail(body.name.as_deref()?),
            AlertSource::MaliciousContractMl => tail(body.description.as_deref()?),
            AlertSource::Flashloan => tail(body.name.as_deref()?),
        }?;
        Address::from_str(&raw.to_ascii_lowercase()).ok()
    }
}

fn head(text: &str) -> Option<&str> {
    text.get(..ADDRESS_CHARS)
}

fn tail(text: &str) -> Option<&str> {
    text.get(text.len().checked_sub(ADDRESS_CHARS)?..)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// RFC 3339 creation time, e.g. `2023-03-01T12:00:00.000Z`.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// One alert event as delivered by the feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub alert_id: Option<String>,
    #[serde(default)]
    pub alert: AlertBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedAlert {
    pub source: AlertSource,
    pub address: Address,
    pub priority: u8,
    pub timestamp: u64,
}

/// Seconds since the epoch for an RFC 3339 timestamp. Pre-epoch instants are rejected.
pub fn parse_timestamp(raw: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .and_then(|t| u64::try_from(t.timestamp()).ok())
}

/// Maps configured upstream bot ids to alert sources.
#[derive(Debug, Clone)]
pub struct AlertRouter {
    routes: Vec<(String, AlertSource)>,
}

impl AlertRouter {
    pub fn new(routes: Vec<(String, AlertSource)>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(bot_id, source)| (bot_id.to_ascii_lowercase(), source))
                .collect(),
        }
    }

    pub fn from_bot_config(config: &BotConfig) -> Self {
        Self::new(vec![
            (config.tornado_cash_contract_bot_id.clone(), AlertSource::TornadoCash),
            (config.aztec_contract_bot_id.clone(), AlertSource::Aztec),
            (
                config.malicious_contract_ml_bot_id.clone(),
                AlertSource::MaliciousContractMl,
            ),
            (config.flashloan_contract_bot_id.clone(), AlertSource::Flashloan),
        ])
    }

    /// `None` for unsubscribed alert ids, unknown bots and unreadable addresses.
    pub fn route(&self, event: &AlertEvent, now: u64) -> Option<CorrelatedAlert> {
        let alert_id = event.alert_id.as_deref()?;
        if !ACCEPTED_ALERT_IDS.contains(&alert_id) {
            return None;
        }
        let bot_id = event.bot_id.as_deref()?.to_ascii_lowercase();
        let source = self
            .routes
            .iter()
            .find(|(id, _)| *id == bot_id)
            .map(|(_, source)| *source)?;
        let address = source.referenced_address(&event.alert)?;
        let timestamp = event
            .alert
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);
        Some(CorrelatedAlert {
            source,
            address,
            priority: source.priority(),
            timestamp,
        })
    }
}

/// Parses one newline-delimited JSON alert event. Blank lines yield `None`.
pub fn parse_alert_line(line: &str) -> anyhow::Result<Option<AlertEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

#[cfg(test)]
mod tests {
    use super::{parse_alert_line, parse_timestamp, AlertRouter, AlertSource};
    use crate::types::{HIGH_PRIORITY, NORMAL_PRIORITY};
    use alloy::primitives::address;

    fn router() -> AlertRouter {
        AlertRouter::new(vec![
            ("0xTORNADO".to_string(), AlertSource::TornadoCash),
            ("0xaztec".to_string(), AlertSource::Aztec),
            ("0xml".to_string(), AlertSource::MaliciousContractMl),
            ("0xflash".to_string(), AlertSource::Flashloan),
        ])
    }

    #[test]
    fn test_tornado_alert_reads_address_prefix() {
        let line = r#"{"botId":"0xtornado","alertId":"SUSPICIOUS-CONTRACT-CREATION-TORNADO-CASH",
            "alert":{"description":"0xAbCdEf0123456789aBcDeF0123456789aBcDeF01 created contract 0x11","createdAt":"2023-03-01T00:00:10.123Z"}}"#
            .replace('\n', "");
        let event = parse_alert_line(&line).expect("parse").expect("event");
        let alert = router().route(&event, 0).expect("routed");
        assert_eq!(alert.source, AlertSource::TornadoCash);
        assert_eq!(alert.priority, NORMAL_PRIORITY);
        assert_eq!(alert.address, address!("abcdef0123456789abcdef0123456789abcdef01"));
        assert_eq!(alert.timestamp, 1_677_628_810);
    }

    #[test]
    fn test_flashloan_alert_reads_address_suffix() {
        let line = r#"{"botId":"0xFLASH","alertId":"FLASHLOAN-CONTRACT-CREATION","alert":{"name":"Flashloan contract 0x00000000000000000000000000000000000000a1"}}"#;
        let event = parse_alert_line(line).expect("parse").expect("event");
        let alert = router().route(&event, 42).expect("routed");
        assert_eq!(alert.priority, HIGH_PRIORITY);
        assert_eq!(alert.address, address!("00000000000000000000000000000000000000a1"));
        assert_eq!(alert.timestamp, 42);
    }

    #[test]
    fn test_unsubscribed_or_unknown_alerts_are_ignored() {
        let unknown_id = r#"{"botId":"0xml","alertId":"SOMETHING-ELSE","alert":{"description":"x 0x00000000000000000000000000000000000000a1"}}"#;
        let event = parse_alert_line(unknown_id).expect("parse").expect("event");
        assert!(router().route(&event, 0).is_none());

        let unknown_bot = r#"{"botId":"0xother","alertId":"SUSPICIOUS-CONTRACT-CREATION","alert":{"description":"x 0x00000000000000000000000000000000000000a1"}}"#;
        let event = parse_alert_line(unknown_bot).expect("parse").expect("event");
        assert!(router().route(&event, 0).is_none());

        let short = r#"{"botId":"0xml","alertId":"SUSPICIOUS-CONTRACT-CREATION","alert":{"description":"short"}}"#;
        let event = parse_alert_line(short).expect("parse").expect("event");
        assert!(router().route(&event, 0).is_none());

        assert!(parse_alert_line("   ").expect("blank").is_none());
        assert!(parse_alert_line("{not json").is_err());
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:00Z"), Some(0));
        assert_eq!(parse_timestamp("2000-03-01T00:00:00.000Z"), Some(951_868_800));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_parse_timestamp_applies_offset() {
        // 12:00 at +02:00 is 10:00 UTC.
        assert_eq!(
            parse_timestamp("2023-03-01T12:00:00+02:00"),
            Some(1_677_664_800)
        );
        assert_eq!(
            parse_timestamp("2023-03-01T10:00:00Z"),
            parse_timestamp("2023-03-01T12:00:00+02:00")
        );
    }

    #[test]
    fn test_parse_timestamp_rejects_impossible_dates() {
        assert_eq!(parse_timestamp("2023-02-31T00:00:00Z"), None);
        assert_eq!(parse_timestamp("2023-03-01T00:00:99Z"), None);
        assert_eq!(parse_timestamp("2023-03-01T24:30:00Z"), None);
        assert_eq!(parse_timestamp("1969-12-31T23:59:59Z"), None);
    }
}
