//! Attack simulation library surface.
//!
//! Freshly created contracts are queued by [`scheduler`], probed on a private fork by
//! [`fork_simulator`] and judged by [`classifier`]. The binary wires these to the chain
//! head and to the upstream alert feed.

pub mod alerts;
pub mod balance_ledger;
pub mod calldata_search;
pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod fork_db;
pub mod fork_simulator;
pub mod pipeline;
pub mod price_cache;
pub mod report;
pub mod scanner;
pub mod scheduler;
pub mod selector_scanner;
pub mod storage;
pub mod types;
pub mod utils;
pub mod valuation;
