//! Lazily hydrated, block-pinned view of remote chain state for `revm`.
//!
//! Every read goes to the node at the pinned block the first time and is then served from
//! bounded in-process caches. Writes never reach this layer: the simulator wraps it in a
//! `CacheDB` so each scan owns a private, disposable fork.

use crate::utils::rpc::{HttpProvider, RobustRpc};
use dashmap::DashMap;
use revm::primitives::{AccountInfo, Address, Bytecode, B256, U256};
use revm::DatabaseRef;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

const MAX_BLOCK_HASHES: usize = 2048;
const MAX_STORAGE_SLOTS: usize = 200_000;
const MAX_ACCOUNTS: usize = 100_000;
const DEFAULT_BRIDGE_TIMEOUT_MS: u64 = 20_000;
const RPC_RETRIES: usize = 5;
/// BLOCKHASH only sees this many ancestors of the executing block.
const BLOCKHASH_WINDOW: u64 = 256;

/// Drop arbitrary entries once a cache grows past `max`.
pub(crate) fn trim_cache<K, V>(cache: &DashMap<K, V>, max: usize)
where
    K: Eq + Hash + Clone,
{
    let excess = cache.len().saturating_sub(max);
    if excess == 0 {
        return;
    }
    let victims: Vec<K> = cache
        .iter()
        .take(excess)
        .map(|entry| entry.key().clone())
        .collect();
    for key in victims {
        cache.remove(&key);
    }
}

fn bridge_timeout() -> Duration {
    let ms = std::env::var("FORKDB_BRIDGE_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| *v >= 200)
        .unwrap_or(DEFAULT_BRIDGE_TIMEOUT_MS);
    Duration::from_millis(ms)
}

#[derive(Default)]
struct ForkCaches {
    accounts: DashMap<Address, Option<AccountInfo>>,
    code: DashMap<B256, Bytecode>,
    storage: DashMap<(Address, U256), U256>,
    block_hashes: DashMap<u64, B256>,
}

#[derive(Clone)]
pub struct ForkDB {
    provider: HttpProvider,
    block_number: u64,
    /// Runtime owned by the fork when it was built outside of one.
    owned_runtime: Option<Arc<tokio::runtime::Runtime>>,
    caches: Arc<ForkCaches>,
}

impl ForkDB {
    /// Fork pinned at `block_number`. All reads observe state as of the end of that block.
    ///
    /// Inside a runtime, reads block the calling thread through `block_in_place`, so the
    /// runtime must be multi-threaded. Scans drive the fork from the blocking pool
    /// (`pipeline::run_blocking`), never from an async worker.
    pub fn with_block_number(provider: HttpProvider, block_number: u64) -> anyhow::Result<Self> {
        let owned_runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if handle.runtime_flavor() != tokio::runtime::RuntimeFlavor::MultiThread {
                    anyhow::bail!("ForkDB needs a multi-thread tokio runtime");
                }
                None
            }
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| anyhow::anyhow!("failed to start runtime for ForkDB: {err}"))?;
                Some(Arc::new(runtime))
            }
        };
        Ok(Self {
            provider,
            block_number,
            owned_runtime,
            caches: Arc::new(ForkCaches::default()),
        })
    }

    /// Runs an RPC future to completion from synchronous `revm` callbacks.
    fn bridge<T, Fut>(&self, fut: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let timeout = bridge_timeout();
        let bounded = async move {
            tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| anyhow::anyhow!("fork read timed out after {}ms", timeout.as_millis()))?
        };
        match &self.owned_runtime {
            Some(runtime) => runtime.block_on(bounded),
            None => {
                let handle = tokio::runtime::Handle::current();
                tokio::task::block_in_place(|| handle.block_on(bounded))
            }
        }
    }

    fn fetch_account(&self, address: Address) -> anyhow::Result<Option<AccountInfo>> {
        let provider = &self.provider;
        let block = self.block_number;
        let (balance, code, nonce) = self.bridge(async move {
            tokio::try_join!(
                RobustRpc::get_balance_at_block_with_retry(provider, address, block, RPC_RETRIES),
                RobustRpc::get_code_at_block_with_retry(provider, address, block, RPC_RETRIES),
                RobustRpc::get_transaction_count_at_block_with_retry(
                    provider,
                    address,
                    block,
                    RPC_RETRIES
                ),
            )
        })?;
        if nonce == 0 && balance.is_zero() && code.is_empty() {
            return Ok(None);
        }
        let bytecode = Bytecode::new_raw(code);
        let code_hash = bytecode.hash_slow();
        self.caches.code.insert(code_hash, bytecode.clone());
        Ok(Some(AccountInfo::new(balance, nonce, code_hash, bytecode)))
    }
}

impl DatabaseRef for ForkDB {
    type Error = anyhow::Error;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        if let Some(hit) = self.caches.accounts.get(&address) {
            return Ok(hit.value().clone());
        }
        let info = self.fetch_account(address)?;
        self.caches.accounts.insert(address, info.clone());
        trim_cache(&self.caches.accounts, MAX_ACCOUNTS);
        Ok(info)
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        self.caches
            .code
            .get(&code_hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("missing bytecode for code hash {}", code_hash))
    }

    fn storage_ref(&self, address: Address, index: U256) -> Result<U256, Self::Error> {
        if let Some(hit) = self.caches.storage.get(&(address, index)) {
            return Ok(*hit);
        }
        let provider = &self.provider;
        let block = self.block_number;
        let value = self.bridge(RobustRpc::get_storage_at_block_with_retry(
            provider,
            address,
            index,
            block,
            RPC_RETRIES,
        ))?;
        self.caches.storage.insert((address, index), value);
        trim_cache(&self.caches.storage, MAX_STORAGE_SLOTS);
        Ok(value)
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        let executing = self.block_number.saturating_add(1);
        if number >= executing || executing - number > BLOCKHASH_WINDOW {
            return Ok(B256::ZERO);
        }
        if let Some(hit) = self.caches.block_hashes.get(&number) {
            return Ok(*hit);
        }
        let hash = self.bridge(RobustRpc::get_block_hash_with_retry(
            &self.provider,
            number,
            RPC_RETRIES,
        ))?;
        self.caches.block_hashes.insert(number, hash);
        trim_cache(&self.caches.block_hashes, MAX_BLOCK_HASHES);
        Ok(hash)
    }
}
