//! Balance Core
//!
//! Optimistic-concurrency balance mutation engine: signed deltas applied to a
//! shared account balance under unbounded concurrent load, without ever
//! holding an exclusive lock on the account.
//!
//! # Architecture
//!
//! - **Store**: keyed storage with one atomic conditional write
//! - **Idempotency Resolver**: prior results per request token
//! - **Atomic Update Executor**: one compare-and-swap attempt plus audit insert
//! - **Conflict Retry Coordinator**: backoff and jitter over lost races
//! - **Balance Service**: façade for external callers
//!
//! # Invariants
//!
//! - Non-negativity: balance ≥ 0 at all times
//! - Conservation: Σ(balance_after − balance_before) == current − initial
//! - Versions: per account, committed versions step by exactly 1
//! - Idempotence: at most one audit record per idempotency key

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod metrics;
pub mod retry;
pub mod service;
pub mod storage;
pub mod types;

// Re-exports
pub use config::{Config, RetryConfig, StorageBackend};
pub use error::{Error, Result};
pub use service::BalanceService;
pub use storage::{MemoryStore, RocksStore, Store};
pub use types::{
    Account, AccountId, ApplyOutcome, IdempotencyKey, TransactionRecord, TransactionType,
};
