//! Durable priority queue of contracts awaiting a scan.
//!
//! Ordering is `(priority, sequence)`: lower priority numbers first, FIFO within one
//! priority. Every queue mutation is mirrored to a [`QueueStore`] so unfinished work
//! survives a restart. Store writes run on the blocking pool after the state lock is
//! released, so slow storage never stalls readers of the queue.

use crate::alerts::CorrelatedAlert;
use crate::storage::queue_db::QueueStore;
use crate::types::CreatedContract;
use alloy::primitives::Address;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub default_priority: u8,
    /// Pending items older than this many seconds are dropped.
    pub waiting_secs: u64,
    /// Only alert-named contracts are scanned.
    pub target_mode: bool,
}

/// An alerted address not yet seen as created (or, in target mode, not yet promoted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SuspiciousContract {
    priority: u8,
    timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEffect {
    Reprioritized { from: u8, to: u8 },
    /// Already queued at an equal or more urgent priority.
    Unchanged,
    /// Remembered until the contract shows up.
    Suspicious,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backlog {
    pub queued: usize,
    pub scanning_block: Option<u64>,
}

#[derive(Default)]
struct SchedulerState {
    queue: BTreeMap<(u8, u64), CreatedContract>,
    queued: HashMap<Address, (u8, u64)>,
    /// Created contracts held back in target mode.
    detected: HashMap<Address, CreatedContract>,
    suspicious: HashMap<Address, SuspiciousContract>,
    in_flight: Option<CreatedContract>,
    next_seq: u64,
    closed: bool,
}

impl SchedulerState {
    fn push(&mut self, contract: CreatedContract, priority: u8) {
        if let Some(key) = self.queued.remove(&contract.address) {
            self.queue.remove(&key);
        }
        self.next_seq += 1;
        let key = (priority, self.next_seq);
        self.queued.insert(contract.address, key);
        self.queue.insert(key, contract);
    }

    fn remove(&mut self, address: Address) -> Option<(u8, CreatedContract)> {
        let key = self.queued.remove(&address)?;
        self.queue.remove(&key).map(|contract| (key.0, contract))
    }

    fn pop_next(&mut self) -> Option<CreatedContract> {
        let (_, contract) = self.queue.pop_first()?;
        self.queued.remove(&contract.address);
        Some(contract)
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }
}

/// A durable write recorded under the state lock and applied after it is released.
#[derive(Debug, Clone)]
enum StoreOp {
    Add(CreatedContract, u8),
    UpdatePriority(Address, u8),
    Delete(Address),
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    /// Held across a whole mutation, storage included, so writes land in mutation order.
    /// Always taken before `state`.
    writes: Mutex<()>,
    notify: Notify,
    idle: Notify,
    store: Arc<dyn QueueStore>,
    config: SchedulerConfig,
}

/// Collects the first storage failure of a multi-step operation while letting the
/// in-memory side run to completion.
#[derive(Default)]
struct StoreErrors {
    first: Option<anyhow::Error>,
}

impl StoreErrors {
    fn record(&mut self, op: &str, address: Address, result: anyhow::Result<()>) {
        if let Err(err) = result {
            tracing::warn!("[QUEUE] Storage {} failed for {}: {:#}", op, address, err);
            if self.first.is_none() {
                self.first = Some(err);
            }
        }
    }

    fn finish(self) -> anyhow::Result<()> {
        match self.first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct ScanScheduler {
    inner: Arc<SchedulerInner>,
}

impl ScanScheduler {
    pub fn new(store: Arc<dyn QueueStore>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                writes: Mutex::new(()),
                notify: Notify::new(),
                idle: Notify::new(),
                store,
                config,
            }),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.inner.config
    }

    async fn persist(&self, ops: Vec<StoreOp>) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || {
            let mut errors = StoreErrors::default();
            for op in ops {
                match op {
                    StoreOp::Add(contract, priority) => {
                        errors.record("add", contract.address, store.add(&contract, priority))
                    }
                    StoreOp::UpdatePriority(address, priority) => errors.record(
                        "update_priority",
                        address,
                        store.update_priority(address, priority),
                    ),
                    StoreOp::Delete(address) => {
                        errors.record("delete", address, store.delete(address))
                    }
                }
            }
            errors.finish()
        })
        .await
        .map_err(|err| anyhow::anyhow!("queue storage task failed: {err}"))?
    }

    /// Re-enqueues every stored item at its stored priority. Returns how many were loaded.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let store = self.inner.store.clone();
        let items = tokio::task::spawn_blocking(move || store.list_all())
            .await
            .map_err(|err| anyhow::anyhow!("queue storage task failed: {err}"))??;
        let count = items.len();
        let mut state = self.inner.state.lock().await;
        for item in items {
            state.push(item.contract, item.priority);
        }
        drop(state);
        if count > 0 {
            tracing::info!("[QUEUE] Loaded {} contracts from local database", count);
            self.inner.notify.notify_one();
        }
        Ok(count)
    }

    /// Intake for one block: records the created contracts, promotes alerted ones and
    /// drops pending items that waited too long.
    pub async fn on_block(
        &self,
        block_timestamp: u64,
        created: &[CreatedContract],
    ) -> anyhow::Result<()> {
        let config = self.inner.config;
        let mut ops = Vec::new();
        let _writes = self.inner.writes.lock().await;
        let mut state = self.inner.state.lock().await;

        for contract in created {
            ops.push(StoreOp::Add(contract.clone(), config.default_priority));
            state.detected.insert(contract.address, contract.clone());
        }

        if config.target_mode {
            let promotable: Vec<Address> = state
                .suspicious
                .keys()
                .filter(|address| state.detected.contains_key(*address))
                .copied()
                .collect();
            for address in promotable {
                let (Some(contract), Some(suspicious)) =
                    (state.detected.remove(&address), state.suspicious.remove(&address))
                else {
                    continue;
                };
                tracing::info!("[QUEUE] Pushed suspicious contract: {}", address);
                ops.push(StoreOp::UpdatePriority(address, suspicious.priority));
                state.push(contract, suspicious.priority);
            }
        } else {
            for contract in created {
                let priority = state
                    .suspicious
                    .remove(&contract.address)
                    .map(|s| s.priority)
                    .unwrap_or(config.default_priority);
                state.detected.remove(&contract.address);
                if priority != config.default_priority {
                    ops.push(StoreOp::UpdatePriority(contract.address, priority));
                }
                state.push(contract.clone(), priority);
            }
        }

        let expired = |timestamp: u64| block_timestamp.saturating_sub(timestamp) > config.waiting_secs;

        let stale_detected: Vec<Address> = state
            .detected
            .values()
            .filter(|c| expired(c.timestamp))
            .map(|c| c.address)
            .collect();
        for address in stale_detected {
            state.detected.remove(&address);
            ops.push(StoreOp::Delete(address));
        }

        let stale_queued: Vec<Address> = state
            .queue
            .values()
            .filter(|c| expired(c.timestamp))
            .map(|c| c.address)
            .collect();
        for address in stale_queued {
            state.remove(address);
            tracing::debug!("[QUEUE] Dropped outdated contract {}", address);
            ops.push(StoreOp::Delete(address));
        }

        state.suspicious.retain(|_, s| !expired(s.timestamp));

        let has_work = !state.queue.is_empty();
        let idle = state.is_idle();
        drop(state);
        if has_work {
            self.inner.notify.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
        self.persist(ops).await
    }

    pub async fn on_alert(&self, alert: &CorrelatedAlert) -> anyhow::Result<AlertEffect> {
        let _writes = self.inner.writes.lock().await;
        let mut state = self.inner.state.lock().await;

        if let Some(&(current, _)) = state.queued.get(&alert.address) {
            if current <= alert.priority {
                return Ok(AlertEffect::Unchanged);
            }
            if let Some((_, contract)) = state.remove(alert.address) {
                state.push(contract, alert.priority);
            }
            drop(state);
            if !self.inner.config.target_mode {
                tracing::info!(
                    "[ALERT] Changed scan priority of {} due to {:?} alert",
                    alert.address,
                    alert.source
                );
            }
            self.persist(vec![StoreOp::UpdatePriority(alert.address, alert.priority)])
                .await?;
            return Ok(AlertEffect::Reprioritized {
                from: current,
                to: alert.priority,
            });
        }

        if let Some(contract) = state.detected.remove(&alert.address) {
            tracing::info!("[QUEUE] Pushed suspicious contract: {}", alert.address);
            state.push(contract, alert.priority);
            drop(state);
            self.inner.notify.notify_one();
            self.persist(vec![StoreOp::UpdatePriority(alert.address, alert.priority)])
                .await?;
            return Ok(AlertEffect::Reprioritized {
                from: self.inner.config.default_priority,
                to: alert.priority,
            });
        }

        let entry = state
            .suspicious
            .entry(alert.address)
            .or_insert(SuspiciousContract {
                priority: alert.priority,
                timestamp: alert.timestamp,
            });
        entry.priority = entry.priority.min(alert.priority);
        entry.timestamp = entry.timestamp.max(alert.timestamp);
        Ok(AlertEffect::Suspicious)
    }

    /// Waits for the most urgent item. `None` once the scheduler is closed; unfinished
    /// items stay in durable storage.
    pub async fn next(&self) -> Option<CreatedContract> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(contract) = state.pop_next() {
                    state.in_flight = Some(contract.clone());
                    return Some(contract);
                }
            }
            notified.await;
        }
    }

    /// Marks the in-flight scan finished and removes it from durable storage.
    pub async fn complete(&self, address: Address) -> anyhow::Result<()> {
        let _writes = self.inner.writes.lock().await;
        let mut state = self.inner.state.lock().await;
        if state
            .in_flight
            .as_ref()
            .is_some_and(|c| c.address == address)
        {
            state.in_flight = None;
        }
        let idle = state.is_idle();
        drop(state);
        let result = self.persist(vec![StoreOp::Delete(address)]).await;
        if idle {
            self.inner.idle.notify_waiters();
        }
        result
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn backlog(&self) -> Backlog {
        let state = self.inner.state.lock().await;
        Backlog {
            queued: state.queue.len(),
            scanning_block: state.in_flight.as_ref().map(|c| c.block_number),
        }
    }

    /// Priority of a queued address.
    pub async fn priority_of(&self, address: Address) -> Option<u8> {
        let state = self.inner.state.lock().await;
        state.queued.get(&address).map(|(priority, _)| *priority)
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.idle.notify_waiters();
    }

    /// Resolves once nothing is queued or in flight, or the scheduler is closed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock().await;
                if state.closed || state.is_idle() {
                    return;
                }
            }
            notified.await;
        }
    }
}
