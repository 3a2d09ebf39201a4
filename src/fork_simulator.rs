//! Candidate-call execution against a private fork, and the per-selector signature search.
//!
//! The probe is synchronous (revm drives the database directly); the search loop is async
//! because evaluating a successful call may consult remote price sources.

use crate::balance_ledger::ExecutedCall;
use crate::calldata_search::{encode_call, ProbeCorpus, MAX_ARITY};
use crate::report::ExploitReport;
use alloy::primitives::{Address, Bytes, Selector, U256};
use alloy::sol_types::{Revert, SolError};
use async_trait::async_trait;
use revm::db::CacheDB;
use revm::interpreter::Interpreter;
use revm::primitives::{AccountInfo, EVMError, ExecutionResult, ResultAndState, TransactTo};
use revm::{Database, DatabaseCommit, DatabaseRef, Evm, EvmContext, Inspector};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Gas allowance for every probe transaction.
pub const PROBE_GAS_LIMIT: u64 = 30_000_000;
const STATIC_CALL_GAS_LIMIT: u64 = 1_000_000;

/// Balance granted to the deployer before probing, in ether.
const DEPLOYER_FUNDING_ETHER: u64 = 1_000_000;

/// Records the program counter of the last executed instruction.
#[derive(Debug, Default)]
pub struct RevertTracer {
    pub last_pc: Option<usize>,
}

impl<DB: Database> Inspector<DB> for RevertTracer {
    fn step(&mut self, interp: &mut Interpreter, _context: &mut EvmContext<DB>) {
        self.last_pc = Some(interp.program_counter());
    }
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Executed {
        call: ExecutedCall,
        output: Bytes,
    },
    Reverted {
        /// `None` when execution never reached the bytecode.
        program_counter: Option<usize>,
        output: Bytes,
        reason: Option<String>,
    },
    /// The fork itself failed (state fetch, transaction validation).
    EnvironmentFailure(String),
}

/// Fork state a candidate call can be executed against.
pub trait ForkProbe {
    fn fund_account(&mut self, account: Address, amount: U256) -> anyhow::Result<()>;

    /// Executes and commits one transaction. Reverted transactions are committed too.
    fn call(&mut self, from: Address, to: Address, calldata: Bytes, value: U256) -> ProbeOutcome;

    /// `true` for accounts without code, including accounts never seen on chain.
    fn is_externally_owned(&mut self, account: Address) -> bool;

    /// Read-only call; `None` unless execution succeeded.
    fn static_call(&mut self, to: Address, calldata: Bytes) -> Option<Bytes>;
}

/// `Error(string)` payload, when the revert data carries one.
pub fn decode_revert_reason(output: &[u8]) -> Option<String> {
    Revert::abi_decode(output, true).ok().map(|revert| revert.reason)
}

pub struct RevmProbe<DB: DatabaseRef> {
    db: CacheDB<DB>,
    chain_id: u64,
    block_number: u64,
    timestamp: u64,
}

impl<DB> RevmProbe<DB>
where
    DB: DatabaseRef,
    DB::Error: Display,
{
    pub fn new(db: DB, chain_id: u64, block_number: u64, timestamp: u64) -> Self {
        Self {
            db: CacheDB::new(db),
            chain_id,
            block_number,
            timestamp,
        }
    }

    pub fn db_mut(&mut self) -> &mut CacheDB<DB> {
        &mut self.db
    }

    fn transact(
        &mut self,
        from: Address,
        to: Address,
        calldata: Bytes,
        value: U256,
        gas_limit: u64,
        tracer: &mut RevertTracer,
    ) -> Result<ResultAndState, EVMError<DB::Error>> {
        let (chain_id, number, timestamp) = (self.chain_id, self.block_number, self.timestamp);
        let mut evm = Evm::builder()
            .with_db(&mut self.db)
            .with_external_context(tracer)
            .append_handler_register(revm::inspector_handle_register)
            .modify_cfg_env(|cfg| {
                cfg.chain_id = chain_id;
            })
            .modify_block_env(|block| {
                block.number = U256::from(number);
                block.timestamp = U256::from(timestamp);
                block.basefee = U256::ZERO;
            })
            .modify_tx_env(|tx| {
                tx.caller = from;
                tx.transact_to = TransactTo::Call(to);
                tx.data = calldata;
                tx.value = value;
                tx.gas_limit = gas_limit;
                tx.gas_price = U256::ZERO;
            })
            .build();
        evm.transact()
    }

    /// Pre-execution balance from the cache, before the state diff is committed.
    fn balance_before(&mut self, account: Address) -> U256 {
        match self.db.basic(account) {
            Ok(Some(info)) => info.balance,
            Ok(None) => U256::ZERO,
            Err(err) => {
                tracing::debug!("[SCAN] Balance lookup failed for {}: {}", account, err);
                U256::ZERO
            }
        }
    }
}

impl<DB> ForkProbe for RevmProbe<DB>
where
    DB: DatabaseRef,
    DB::Error: Display,
{
    fn fund_account(&mut self, account: Address, amount: U256) -> anyhow::Result<()> {
        let mut info: AccountInfo = self
            .db
            .basic(account)
            .map_err(|err| anyhow::anyhow!("account {account} unavailable: {err}"))?
            .unwrap_or_default();
        info.balance = info.balance.saturating_add(amount);
        self.db.insert_account_info(account, info);
        Ok(())
    }

    fn call(&mut self, from: Address, to: Address, calldata: Bytes, value: U256) -> ProbeOutcome {
        let mut tracer = RevertTracer::default();
        let result = self.transact(from, to, calldata, value, PROBE_GAS_LIMIT, &mut tracer);
        let ResultAndState { result, state } = match result {
            Ok(out) => out,
            Err(err) => return ProbeOutcome::EnvironmentFailure(format!("{err}")),
        };

        let mut native_balances = BTreeMap::new();
        for (account, touched) in state.iter() {
            if !touched.is_touched() {
                continue;
            }
            let before = self.balance_before(*account);
            native_balances.insert(*account, (before, touched.info.balance));
        }
        self.db.commit(state);

        match result {
            ExecutionResult::Success {
                gas_used,
                logs,
                output,
                ..
            } => ProbeOutcome::Executed {
                call: ExecutedCall {
                    sender: from,
                    recipient: to,
                    logs,
                    gas_used,
                    gas_price: U256::ZERO,
                    native_balances,
                },
                output: output.into_data(),
            },
            ExecutionResult::Revert { output, .. } => ProbeOutcome::Reverted {
                program_counter: tracer.last_pc,
                reason: decode_revert_reason(&output),
                output,
            },
            ExecutionResult::Halt { reason, .. } => {
                tracing::trace!("[SCAN] Call to {} halted: {:?}", to, reason);
                ProbeOutcome::Reverted {
                    program_counter: tracer.last_pc,
                    output: Bytes::new(),
                    reason: None,
                }
            }
        }
    }

    fn is_externally_owned(&mut self, account: Address) -> bool {
        match self.db.basic(account) {
            Ok(Some(info)) => info.is_empty_code_hash(),
            Ok(None) => true,
            Err(err) => {
                tracing::debug!("[SCAN] Code lookup failed for {}: {}", account, err);
                false
            }
        }
    }

    fn static_call(&mut self, to: Address, calldata: Bytes) -> Option<Bytes> {
        let mut tracer = RevertTracer::default();
        let out = self
            .transact(Address::ZERO, to, calldata, U256::ZERO, STATIC_CALL_GAS_LIMIT, &mut tracer)
            .ok()?;
        match out.result {
            ExecutionResult::Success { output, .. } => Some(output.into_data()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Keep probing candidates at the current arity.
    Continue,
    /// The selector rejects this arity; move to the next one.
    NextArity,
}

/// Per-selector search progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSearchState {
    pub arity: usize,
    pub signature_found: bool,
    pub last_program_counter: Option<usize>,
}

impl SignatureSearchState {
    pub fn begin_arity(&mut self, arity: usize) {
        self.arity = arity;
        self.last_program_counter = None;
    }

    pub fn on_success(&mut self) {
        self.signature_found = true;
    }

    /// `informative` is set when the revert carried a reason or return data.
    pub fn on_revert(&mut self, program_counter: usize, informative: bool) -> Transition {
        if informative {
            self.signature_found = true;
            return Transition::Continue;
        }
        if self.signature_found {
            return Transition::Continue;
        }
        if self.last_program_counter == Some(program_counter) {
            return Transition::NextArity;
        }
        self.last_program_counter = Some(program_counter);
        Transition::Continue
    }
}

/// A candidate call that executed without reverting.
#[derive(Debug, Clone)]
pub struct SuccessfulCall {
    pub contract: Address,
    pub deployer: Address,
    pub selector: Selector,
    pub arguments: Bytes,
    pub value: U256,
    pub call: ExecutedCall,
}

/// Judges the effects of a successful call. `Some` ends the scan of the contract.
#[async_trait]
pub trait CallEvaluator<P: ForkProbe + Send>: Send {
    async fn evaluate(&mut self, probe: &mut P, call: SuccessfulCall) -> Option<ExploitReport>;
}

#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Finding(Box<ExploitReport>),
    Exhausted,
    Aborted(String),
}

pub fn deployer_funding() -> U256 {
    U256::from(DEPLOYER_FUNDING_ETHER) * U256::from(10u64).pow(U256::from(18u64))
}

/// Probes every selector of `contract` with deployer-sent calls: first carrying
/// `payable_value`, then with zero value.
pub async fn search_contract<P, E>(
    probe: &mut P,
    evaluator: &mut E,
    contract: Address,
    deployer: Address,
    selectors: &[Selector],
    payable_value: U256,
) -> SearchOutcome
where
    P: ForkProbe + Send,
    E: CallEvaluator<P>,
{
    if let Err(err) = probe.fund_account(deployer, deployer_funding()) {
        tracing::warn!("[SCAN] Failed to fund deployer {}: {}", deployer, err);
    }

    let corpus = ProbeCorpus::for_deployer(deployer);
    let values: Vec<U256> = if payable_value.is_zero() {
        vec![U256::ZERO]
    } else {
        vec![payable_value, U256::ZERO]
    };

    for value in values {
        tracing::debug!("[SCAN] Transaction value {}", value);
        for selector in selectors {
            let mut state = SignatureSearchState::default();
            'arity: for arity in 0..=MAX_ARITY {
                state.begin_arity(arity);
                for arguments in corpus.candidates(arity) {
                    let calldata = encode_call(*selector, &arguments);
                    match probe.call(deployer, contract, calldata, value) {
                        ProbeOutcome::Executed { call, .. } => {
                            if !state.signature_found {
                                tracing::debug!(
                                    "[SCAN] Signature found by successful call {} {}",
                                    contract,
                                    selector
                                );
                            }
                            state.on_success();
                            let successful = SuccessfulCall {
                                contract,
                                deployer,
                                selector: *selector,
                                arguments,
                                value,
                                call,
                            };
                            if let Some(report) = evaluator.evaluate(probe, successful).await {
                                return SearchOutcome::Finding(Box::new(report));
                            }
                        }
                        ProbeOutcome::Reverted {
                            program_counter: Some(pc),
                            output,
                            reason,
                        } => {
                            let informative = reason.is_some() || !output.is_empty();
                            if state.on_revert(pc, informative) == Transition::NextArity {
                                continue 'arity;
                            }
                        }
                        ProbeOutcome::Reverted {
                            program_counter: None,
                            ..
                        } => {
                            return SearchOutcome::Aborted(format!(
                                "call to {contract} reverted before execution"
                            ));
                        }
                        ProbeOutcome::EnvironmentFailure(err) => {
                            return SearchOutcome::Aborted(err);
                        }
                    }
                }
                if state.signature_found {
                    break;
                }
            }
        }
    }
    SearchOutcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::{decode_revert_reason, SignatureSearchState, Transition};
    use alloy::sol_types::{Revert, SolError};

    #[test]
    fn test_same_pc_twice_moves_to_next_arity() {
        let mut state = SignatureSearchState::default();
        state.begin_arity(2);
        assert_eq!(state.on_revert(0x2c, false), Transition::Continue);
        assert_eq!(state.on_revert(0x2c, false), Transition::NextArity);
        assert!(!state.signature_found);

        state.begin_arity(3);
        assert_eq!(state.last_program_counter, None);
        assert_eq!(state.on_revert(0x2c, false), Transition::Continue);
    }

    #[test]
    fn test_changing_pc_keeps_arity() {
        let mut state = SignatureSearchState::default();
        state.begin_arity(1);
        assert_eq!(state.on_revert(10, false), Transition::Continue);
        assert_eq!(state.on_revert(12, false), Transition::Continue);
        assert_eq!(state.on_revert(10, false), Transition::Continue);
        assert_eq!(state.last_program_counter, Some(10));
    }

    #[test]
    fn test_informative_revert_locks_signature() {
        let mut state = SignatureSearchState::default();
        state.begin_arity(1);
        assert_eq!(state.on_revert(7, true), Transition::Continue);
        assert!(state.signature_found);
        assert_eq!(state.on_revert(7, false), Transition::Continue);
        assert_eq!(state.on_revert(7, false), Transition::Continue);
    }

    #[test]
    fn test_decode_revert_reason() {
        let encoded = Revert {
            reason: "Ownable: caller is not the owner".to_string(),
        }
        .abi_encode();
        assert_eq!(
            decode_revert_reason(&encoded).as_deref(),
            Some("Ownable: caller is not the owner")
        );
        assert_eq!(decode_revert_reason(&[]), None);
        assert_eq!(decode_revert_reason(&[0xde, 0xad, 0xbe, 0xef]), None);
    }
}
