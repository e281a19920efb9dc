//! Account/transaction store
//!
//! The engine only needs three things from its storage collaborator:
//!
//! - keyed reads of accounts and audit records
//! - one atomic conditional write that bumps the account version, applies the
//!   delta and appends the audit record, or touches nothing
//! - a uniqueness constraint on idempotency keys
//!
//! Two backends implement [`Store`]: [`MemoryStore`] and [`RocksStore`].
//! Both run the constraint checks in [`schema`] before anything is written.

pub mod memory;
pub mod rocks;
pub mod schema;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::{
    config::{StorageBackend, StorageConfig},
    error::Error,
    types::{Account, AccountId, IdempotencyKey, TransactionRecord, TransactionType},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Compare-and-swap request for one account row.
///
/// Equivalent to
/// `UPDATE accounts SET balance = balance + delta, version = version + 1
///  WHERE account_id = ? AND version = expected_version AND balance + delta >= 0`
/// followed by the audit insert, in one storage transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalUpdate {
    /// Row to update
    pub account_id: AccountId,

    /// Version the caller read
    pub expected_version: u64,

    /// Signed delta
    pub delta: Decimal,

    /// Mutation kind for the audit record
    pub transaction_type: TransactionType,

    /// Unique token stored with the audit record
    pub idempotency_key: Option<IdempotencyKey>,
}

impl ConditionalUpdate {
    /// The WHERE clause. An overflowing sum never matches.
    pub fn matches(&self, account: &Account) -> bool {
        account.account_id == self.account_id
            && account.version == self.expected_version
            && account
                .balance
                .checked_add(self.delta)
                .map_or(false, |after| after >= Decimal::ZERO)
    }

    /// Build the updated row and its audit record
    pub fn apply(
        &self,
        account: &Account,
        transaction_id: u64,
        now: DateTime<Utc>,
    ) -> Result<(Account, TransactionRecord)> {
        let balance_after = account.balance.checked_add(self.delta).ok_or_else(|| {
            Error::ConstraintViolation(format!(
                "accounts.balance overflow on {}: {} + {}",
                account.account_id, account.balance, self.delta
            ))
        })?;
        let version = account.version + 1;

        let updated = Account {
            balance: balance_after,
            version,
            updated_at: now,
            ..account.clone()
        };

        let record = TransactionRecord {
            id: transaction_id,
            account_id: account.account_id.clone(),
            amount: self.delta,
            transaction_type: self.transaction_type,
            balance_before: account.balance,
            balance_after,
            version,
            idempotency_key: self.idempotency_key.clone(),
            created_at: now,
        };

        Ok((updated, record))
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Exactly one row changed; the committed audit record
    Applied(TransactionRecord),

    /// Zero rows changed (stale version, overdraft, or lost commit race)
    NotApplied,

    /// The idempotency key already belongs to a committed record
    DuplicateIdempotencyKey,
}

/// Storage collaborator
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new account row; fails if the id is taken
    async fn insert_account(&self, account: Account) -> Result<Account>;

    /// Read one account without locking it
    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>>;

    /// All accounts, ordered by id
    async fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Record previously committed under this key
    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransactionRecord>>;

    /// The atomic compare-and-swap plus audit insert
    async fn conditional_update(&self, update: ConditionalUpdate) -> Result<UpdateOutcome>;

    /// Audit records of one account, newest first
    async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>>;
}

/// Open the backend named by the configuration
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Rocksdb => Ok(Arc::new(RocksStore::open(config)?)),
    }
}
