//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use balance_core::{
    storage::{ConditionalUpdate, UpdateOutcome},
    Account, AccountId, BalanceService, IdempotencyKey, MemoryStore, Result, RetryConfig,
    RocksStore, Store, TransactionRecord,
};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Short backoffs so contention tests finish quickly
pub fn test_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 500,
        base_backoff_ms: 1,
        max_backoff_ms: 50,
        jitter_ms: 5,
    }
}

/// Memory store with a small simulated round trip to widen race windows
pub fn memory_service() -> Arc<BalanceService> {
    let store = MemoryStore::new().with_round_trip(Duration::from_millis(1));
    Arc::new(BalanceService::new(Arc::new(store), test_retry_config()))
}

/// RocksDB-backed service; keep the TempDir alive for the test's duration
pub fn rocks_service() -> (Arc<BalanceService>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = balance_core::Config::default();
    config.storage.data_dir = temp_dir.path().to_path_buf();
    let store = RocksStore::open(&config.storage).unwrap();
    (
        Arc::new(BalanceService::new(Arc::new(store), test_retry_config())),
        temp_dir,
    )
}

/// Check conservation, non-negativity and version steps for one account
pub async fn assert_ledger_consistent(
    service: &BalanceService,
    account_id: &AccountId,
    initial: Decimal,
) {
    let balance = service.read_balance(account_id).await.unwrap();
    let history = service.list_transactions(account_id).await.unwrap();

    let net: Decimal = history
        .iter()
        .map(|record| record.balance_after - record.balance_before)
        .sum();
    assert_eq!(net, balance - initial, "conservation");

    for record in &history {
        assert!(record.balance_after >= Decimal::ZERO, "negative balance observed");
        assert_eq!(record.balance_after, record.balance_before + record.amount);
    }

    // Newest first: versions count down to 2 without gaps
    let versions: Vec<u64> = history.iter().map(|record| record.version).collect();
    let expected: Vec<u64> = (2..2 + history.len() as u64).rev().collect();
    assert_eq!(versions, expected, "version sequence");

    let account = service.get_account(account_id).await.unwrap();
    assert_eq!(account.version, 1 + history.len() as u64);
}

/// Counts calls on the way to a real store
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub account_reads: AtomicU32,
    pub updates: AtomicU32,
}

impl CountingStore {
    pub fn account_reads(&self) -> u32 {
        self.account_reads.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn insert_account(&self, account: Account) -> Result<Account> {
        self.inner.insert_account(account).await
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.account_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_account(account_id).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.inner.list_accounts().await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransactionRecord>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn conditional_update(&self, update: ConditionalUpdate) -> Result<UpdateOutcome> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.conditional_update(update).await
    }

    async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        self.inner.list_transactions(account_id).await
    }
}

/// Commits a competing deposit of `race_amount` right before each of the
/// first `races` conditional updates, so those updates see a stale version
pub struct RacingStore {
    pub inner: MemoryStore,
    pub races: AtomicU32,
    pub race_amount: Decimal,
}

impl RacingStore {
    pub fn new(races: u32, race_amount: Decimal) -> Self {
        Self {
            inner: MemoryStore::new(),
            races: AtomicU32::new(races),
            race_amount,
        }
    }
}

#[async_trait]
impl Store for RacingStore {
    async fn insert_account(&self, account: Account) -> Result<Account> {
        self.inner.insert_account(account).await
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.inner.get_account(account_id).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.inner.list_accounts().await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransactionRecord>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn conditional_update(&self, update: ConditionalUpdate) -> Result<UpdateOutcome> {
        let should_race = self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_race {
            let current = self
                .inner
                .get_account(&update.account_id)
                .await?
                .expect("racing against a missing account");
            let competitor = ConditionalUpdate {
                account_id: update.account_id.clone(),
                expected_version: current.version,
                delta: self.race_amount,
                transaction_type: balance_core::TransactionType::Deposit,
                idempotency_key: None,
            };
            self.inner.conditional_update(competitor).await?;
        }
        self.inner.conditional_update(update).await
    }

    async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        self.inner.list_transactions(account_id).await
    }
}

/// Every conditional update loses
#[derive(Default)]
pub struct AlwaysStaleStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl Store for AlwaysStaleStore {
    async fn insert_account(&self, account: Account) -> Result<Account> {
        self.inner.insert_account(account).await
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        self.inner.get_account(account_id).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.inner.list_accounts().await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransactionRecord>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn conditional_update(&self, _update: ConditionalUpdate) -> Result<UpdateOutcome> {
        Ok(UpdateOutcome::NotApplied)
    }

    async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        self.inner.list_transactions(account_id).await
    }
}
