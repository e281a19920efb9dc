//! Atomic update executor
//!
//! One physical attempt at a balance mutation:
//!
//! 1. Replay: a committed record under the idempotency key is returned as-is.
//! 2. Read `(version, balance)` without locking.
//! 3. One conditional write: delta, version bump and audit insert commit
//!    together or not at all.
//! 4. Zero rows touched: overdraft is terminal, anything else is a version
//!    conflict for the retry coordinator.
//!
//! There is no separate validate-then-write step. The overdraft check lives
//! in the WHERE clause of the write itself.

use crate::{
    error::{Error, Result},
    idempotency::IdempotencyResolver,
    storage::{ConditionalUpdate, Store, UpdateOutcome},
    types::{BalanceMutation, CommitReceipt},
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// How an attempt produced its receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// This attempt committed the mutation
    Committed(CommitReceipt),

    /// An earlier commit under the same idempotency key was found
    Replayed(CommitReceipt),
}

impl Execution {
    /// The receipt either way
    pub fn receipt(&self) -> CommitReceipt {
        match self {
            Execution::Committed(receipt) | Execution::Replayed(receipt) => *receipt,
        }
    }

    /// Whether the delta was applied by this attempt
    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }
}

/// Performs single conditional mutations against the store
#[derive(Clone)]
pub struct AtomicUpdateExecutor {
    store: Arc<dyn Store>,
    resolver: IdempotencyResolver,
}

impl AtomicUpdateExecutor {
    /// Executor over a store
    pub fn new(store: Arc<dyn Store>) -> Self {
        let resolver = IdempotencyResolver::new(store.clone());
        Self { store, resolver }
    }

    /// Run one attempt
    pub async fn execute(&self, mutation: &BalanceMutation) -> Result<Execution> {
        if let Some(key) = &mutation.idempotency_key {
            if let Some(receipt) = self.resolver.lookup(key).await? {
                return Ok(Execution::Replayed(receipt));
            }
        }

        let account = self
            .store
            .get_account(&mutation.account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(mutation.account_id.clone()))?;

        let balance_after = account.balance.checked_add(mutation.delta).ok_or_else(|| {
            Error::InvalidAmount(format!(
                "{} on {} overflows balance {}",
                mutation.delta, mutation.account_id, account.balance
            ))
        })?;

        let update = ConditionalUpdate {
            account_id: mutation.account_id.clone(),
            expected_version: account.version,
            delta: mutation.delta,
            transaction_type: mutation.transaction_type,
            idempotency_key: mutation.idempotency_key.clone(),
        };

        match self.store.conditional_update(update).await? {
            UpdateOutcome::Applied(record) => Ok(Execution::Committed(CommitReceipt::from(&record))),
            UpdateOutcome::NotApplied => {
                if balance_after < Decimal::ZERO {
                    Err(Error::InsufficientFunds {
                        account_id: mutation.account_id.clone(),
                        balance: account.balance,
                        delta: mutation.delta,
                    })
                } else {
                    Err(Error::VersionConflict {
                        account_id: mutation.account_id.clone(),
                        expected_version: account.version,
                    })
                }
            }
            UpdateOutcome::DuplicateIdempotencyKey => {
                let key = mutation
                    .idempotency_key
                    .as_ref()
                    .ok_or_else(|| Error::Storage("Duplicate reported without a key".to_string()))?;
                match self.resolver.resolve_duplicate(key).await? {
                    Some(receipt) => Ok(Execution::Replayed(receipt)),
                    None => Err(Error::VersionConflict {
                        account_id: mutation.account_id.clone(),
                        expected_version: account.version,
                    }),
                }
            }
        }
    }
}

impl std::fmt::Debug for AtomicUpdateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicUpdateExecutor").finish_non_exhaustive()
    }
}
