//! Idempotency resolver
//!
//! Maps a request token to the result of the one mutation committed under it.
//! The store's uniqueness constraint decides races between callers that
//! submit the same unseen key; the loser re-reads the winner's record here.

use crate::{
    error::Result,
    storage::Store,
    types::{CommitReceipt, IdempotencyKey},
};
use std::sync::Arc;

/// Looks up prior results for request tokens
#[derive(Clone)]
pub struct IdempotencyResolver {
    store: Arc<dyn Store>,
}

impl IdempotencyResolver {
    /// Resolver over a store
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Caller's key, or a freshly minted one when none was supplied
    pub fn ensure_key(&self, key: Option<IdempotencyKey>) -> IdempotencyKey {
        key.unwrap_or_else(IdempotencyKey::generate)
    }

    /// Result previously committed under `key`
    pub async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<CommitReceipt>> {
        let record = self.store.find_by_idempotency_key(key).await?;
        if let Some(record) = &record {
            tracing::debug!(
                idempotency_key = %key,
                transaction_id = record.id,
                "Idempotency key hit"
            );
        }
        Ok(record.as_ref().map(CommitReceipt::from))
    }

    /// Re-read after losing a uniqueness race.
    ///
    /// `None` means the winner's record is not visible yet; the caller treats
    /// that as a transient conflict and tries again.
    pub async fn resolve_duplicate(&self, key: &IdempotencyKey) -> Result<Option<CommitReceipt>> {
        tracing::debug!(idempotency_key = %key, "Lost idempotency race, re-reading winner");
        self.lookup(key).await
    }
}

impl std::fmt::Debug for IdempotencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyResolver").finish_non_exhaustive()
    }
}
