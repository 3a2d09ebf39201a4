use alloy::primitives::{address, Address, Bytes, B256, U256};
use attack_simulation::classifier::{ExploitClassifier, TokenMetadataCache};
use attack_simulation::fork_simulator::{search_contract, RevmProbe, SearchOutcome};
use attack_simulation::price_cache::StaticPriceOracle;
use attack_simulation::selector_scanner::scan_selectors;
use attack_simulation::types::CreatedContract;
use attack_simulation::utils::config::ThresholdConfig;
use revm::db::EmptyDB;
use revm::primitives::{AccountInfo, Bytecode};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

const SELECTOR: [u8; 4] = [0x3c, 0xcf, 0xd6, 0x0b];
const CONTRACT: Address = address!("c0ffeec0ffeec0ffeec0ffeec0ffeec0ffeec0ff");
const DEPLOYER: Address = address!("d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1d1");
const EOA: Address = address!("beefbeefbeefbeefbeefbeefbeefbeefbeefbeef");

enum Payout {
    To(Address, U256),
    ToCaller(U256),
    /// Sends the attached value straight back to the caller.
    EchoValue,
}

/// Single-function contract: the dispatcher accepts `SELECTOR` and reverts otherwise; the
/// function performs one value-carrying CALL.
fn payout_contract(payout: Payout) -> Bytes {
    // PUSH1 0 CALLDATALOAD PUSH1 0xe0 SHR PUSH4 sel EQ PUSH1 0x13 JUMPI PUSH1 0 DUP1 REVERT
    let mut code = vec![0x60, 0x00, 0x35, 0x60, 0xe0, 0x1c, 0x63];
    code.extend_from_slice(&SELECTOR);
    code.extend_from_slice(&[0x14, 0x60, 0x13, 0x57, 0x60, 0x00, 0x80, 0xfd]);
    // JUMPDEST, then retLength retOffset argsLength argsOffset = 0
    code.push(0x5b);
    assert_eq!(code.len(), 0x14);
    code.extend_from_slice(&[0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x60, 0x00]);
    match payout {
        Payout::To(recipient, amount) => {
            code.push(0x7f);
            code.extend_from_slice(&amount.to_be_bytes::<32>());
            code.push(0x73);
            code.extend_from_slice(recipient.as_slice());
        }
        Payout::ToCaller(amount) => {
            code.push(0x7f);
            code.extend_from_slice(&amount.to_be_bytes::<32>());
            code.push(0x33);
        }
        Payout::EchoValue => code.extend_from_slice(&[0x34, 0x33]),
    }
    // GAS CALL STOP
    code.extend_from_slice(&[0x5a, 0xf1, 0x00]);
    Bytes::from(code)
}

fn ether(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
}

fn probe_with(code: &Bytes, balance: U256) -> RevmProbe<EmptyDB> {
    let mut probe = RevmProbe::new(EmptyDB::default(), 1, 18_000_000, 1_700_000_000);
    let bytecode = Bytecode::new_raw(code.clone());
    probe.db_mut().insert_account_info(
        CONTRACT,
        AccountInfo::new(balance, 1, bytecode.hash_slow(), bytecode),
    );
    probe
}

fn created() -> CreatedContract {
    CreatedContract {
        address: CONTRACT,
        deployer: DEPLOYER,
        block_number: 18_000_000,
        timestamp: 1_700_000_000,
        tx_hash: B256::repeat_byte(0x42),
    }
}

async fn scan(code: Bytes, balance: U256, payable_value: U256) -> SearchOutcome {
    let oracle = StaticPriceOracle {
        native: Some(2.0),
        erc20: HashMap::new(),
    };
    let thresholds = ThresholdConfig {
        global_usd: Decimal::from(4000),
        per_token: HashMap::new(),
    };
    let metadata = TokenMetadataCache::new(Duration::from_secs(60), 64);
    let created = created();
    let mut classifier = ExploitClassifier {
        chain_id: 1,
        native_symbol: Some("ETH"),
        oracle: &oracle,
        thresholds: &thresholds,
        metadata: &metadata,
        created: &created,
    };

    let selectors = scan_selectors(&code);
    assert_eq!(selectors.len(), 1);
    let mut probe = probe_with(&code, balance);
    search_contract(
        &mut probe,
        &mut classifier,
        CONTRACT,
        DEPLOYER,
        &selectors,
        payable_value,
    )
    .await
}

#[tokio::test]
async fn test_payout_at_threshold_is_not_reported() {
    let amount = ether(2_000);
    let outcome = scan(payout_contract(Payout::To(EOA, amount)), amount, U256::ZERO).await;
    assert!(matches!(outcome, SearchOutcome::Exhausted), "got {outcome:?}");
}

#[tokio::test]
async fn test_payout_one_wei_over_threshold_names_recipient() {
    let amount = ether(2_000) + U256::from(1u64);
    let outcome = scan(payout_contract(Payout::To(EOA, amount)), amount, U256::ZERO).await;
    let SearchOutcome::Finding(report) = outcome else {
        panic!("expected a finding, got {outcome:?}");
    };
    assert_eq!(report.funded_address, EOA);
    assert_eq!(report.contract_address, CONTRACT);
    assert_eq!(report.deployer_address, DEPLOYER);
    assert_eq!(report.selector.as_slice(), SELECTOR.as_slice());
    assert!(report.calldata.is_empty());
    assert!(report.involved_addresses.contains(&EOA));

    let tokens = report.balance_changes.get(&EOA).expect("recipient changes");
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].name, "ETH");
    assert_eq!(tokens[0].decimals, Some(18));

    let finding = report.to_finding("AK", 0.1);
    assert_eq!(finding.alert_id, "AK-ATTACK-SIMULATION-0");
    assert_eq!(
        finding.metadata.get("fundedAddress").map(String::as_str),
        Some("0xbeefbeefbeefbeefbeefbeefbeefbeefbeefbeef")
    );
}

#[tokio::test]
async fn test_payout_to_deployer_only_is_a_refund() {
    // Deployer gains far more than the threshold, but the contract is the only counterparty.
    let amount = ether(10_000);
    let outcome = scan(payout_contract(Payout::ToCaller(amount)), amount, U256::ZERO).await;
    assert!(matches!(outcome, SearchOutcome::Exhausted), "got {outcome:?}");
}

#[tokio::test]
async fn test_value_echoed_back_to_deployer_is_not_reported() {
    let outcome = scan(payout_contract(Payout::EchoValue), U256::ZERO, ether(10)).await;
    assert!(matches!(outcome, SearchOutcome::Exhausted), "got {outcome:?}");
}
