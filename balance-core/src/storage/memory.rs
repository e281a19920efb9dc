//! In-memory store
//!
//! Tables live behind one `RwLock`. The write guard is held only for the
//! duration of a single statement, the way a database latches a page, so a
//! conditional update is atomic without any lock surviving across attempts.

use super::{schema, ConditionalUpdate, Store, UpdateOutcome};
use crate::{
    error::{Error, Result},
    types::{Account, AccountId, IdempotencyKey, TransactionRecord},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<u64, TransactionRecord>,
    by_account: HashMap<AccountId, Vec<u64>>,
    idempotency: HashMap<IdempotencyKey, u64>,
    last_transaction_id: u64,
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    round_trip: Option<Duration>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate network latency before every statement.
    ///
    /// Widens the window between an attempt's read and its write so races
    /// show up even on a single-threaded runtime.
    pub fn with_round_trip(mut self, delay: Duration) -> Self {
        self.round_trip = Some(delay);
        self
    }

    async fn round_trip(&self) {
        if let Some(delay) = self.round_trip {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_account(&self, account: Account) -> Result<Account> {
        self.round_trip().await;
        schema::check_account(&account)?;

        let mut tables = self.tables.write();
        if tables.accounts.contains_key(&account.account_id) {
            return Err(Error::AccountAlreadyExists(account.account_id));
        }
        tables
            .accounts
            .insert(account.account_id.clone(), account.clone());

        Ok(account)
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.round_trip().await;
        Ok(self.tables.read().accounts.get(account_id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.round_trip().await;
        Ok(self.tables.read().accounts.values().cloned().collect())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransactionRecord>> {
        self.round_trip().await;
        let tables = self.tables.read();
        Ok(tables
            .idempotency
            .get(key)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn conditional_update(&self, update: ConditionalUpdate) -> Result<UpdateOutcome> {
        self.round_trip().await;

        let mut tables = self.tables.write();

        if let Some(key) = &update.idempotency_key {
            if tables.idempotency.contains_key(key) {
                return Ok(UpdateOutcome::DuplicateIdempotencyKey);
            }
        }

        let current = match tables.accounts.get(&update.account_id) {
            Some(account) if update.matches(account) => account.clone(),
            _ => return Ok(UpdateOutcome::NotApplied),
        };

        let transaction_id = tables.last_transaction_id + 1;
        let (account, record) = update.apply(&current, transaction_id, Utc::now())?;
        schema::check_account(&account)?;
        schema::check_transaction(&record)?;

        tables.last_transaction_id = transaction_id;
        tables.accounts.insert(account.account_id.clone(), account);
        tables
            .by_account
            .entry(record.account_id.clone())
            .or_default()
            .push(transaction_id);
        if let Some(key) = &record.idempotency_key {
            tables.idempotency.insert(key.clone(), transaction_id);
        }
        tables.transactions.insert(transaction_id, record.clone());

        tracing::debug!(
            transaction_id,
            account_id = %record.account_id,
            version = record.version,
            "Conditional update committed"
        );

        Ok(UpdateOutcome::Applied(record))
    }

    async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        self.round_trip().await;
        let tables = self.tables.read();
        let ids = match tables.by_account.get(account_id) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };

        Ok(ids
            .iter()
            .rev()
            .filter_map(|id| tables.transactions.get(id))
            .cloned()
            .collect())
    }
}
