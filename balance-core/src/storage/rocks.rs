//! Durable store on RocksDB optimistic transactions
//!
//! A conditional update runs as one optimistic transaction: the account row
//! and the idempotency key are read with `get_for_update`, the WHERE clause is
//! evaluated, and the row, audit record and indices are written together.
//! RocksDB validates at commit time that no tracked key changed since it was
//! read, so a concurrent writer turns the commit into `Busy` and nothing is
//! written. That commit-time check is the compare-and-swap; no lock is held
//! between an attempt's read and its write.
//!
//! RocksDB calls block, so every statement runs on the blocking pool.

use super::{schema, ConditionalUpdate, Store, UpdateOutcome};
use crate::{
    config::StorageConfig,
    error::{Error, Result},
    types::{Account, AccountId, IdempotencyKey, TransactionRecord},
};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, ErrorKind, IteratorMode, OptimisticTransactionDB,
    Options,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Inner {
    db: OptimisticTransactionDB,
    last_transaction_id: AtomicU64,
}

/// Storage wrapper for RocksDB
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.inner.db.path())
            .finish()
    }
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = schema::COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db: OptimisticTransactionDB =
            OptimisticTransactionDB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let store = Self {
            inner: Arc::new(Inner {
                db,
                last_transaction_id: AtomicU64::new(0),
            }),
        };
        store.migrate()?;
        let last_id = store.inner.load_last_transaction_id()?;
        store.inner.last_transaction_id.store(last_id, Ordering::SeqCst);

        tracing::info!(
            "Opened RocksDB at {:?} (schema v{}, last transaction id {})",
            path,
            schema::SCHEMA_VERSION,
            last_id
        );

        Ok(store)
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Audit log is write-once, compress hard
            schema::CF_TRANSACTIONS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            schema::CF_IDEMPOTENCY | schema::CF_ACCOUNTS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    /// Stamp a fresh database, refuse a foreign layout
    fn migrate(&self) -> Result<()> {
        let db = &self.inner.db;
        let cf = self.inner.cf_handle(schema::CF_META)?;
        match db.get_cf(cf, schema::META_SCHEMA_VERSION)? {
            None => {
                db.put_cf(cf, schema::META_SCHEMA_VERSION, schema::SCHEMA_VERSION.to_be_bytes())?;
                tracing::info!(version = schema::SCHEMA_VERSION, "Initialized schema");
                Ok(())
            }
            Some(raw) => {
                let found = <[u8; 4]>::try_from(raw.as_slice())
                    .map(u32::from_be_bytes)
                    .map_err(|_| Error::Storage("Corrupt schema version".to_string()))?;
                if found != schema::SCHEMA_VERSION {
                    return Err(Error::Config(format!(
                        "Database schema v{} is not supported (expected v{})",
                        found,
                        schema::SCHEMA_VERSION
                    )));
                }
                Ok(())
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl Inner {
    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn load_last_transaction_id(&self) -> Result<u64> {
        let cf = self.cf_handle(schema::CF_TRANSACTIONS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                schema::decode_transaction_id(&key)
            }
            None => Ok(0),
        }
    }

    fn get_transaction(&self, id: u64) -> Result<Option<TransactionRecord>> {
        let cf = self.cf_handle(schema::CF_TRANSACTIONS)?;
        match self.db.get_cf(cf, schema::transaction_key(id))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn insert_account(&self, account: &Account) -> Result<()> {
        schema::check_account(account)?;
        let cf = self.cf_handle(schema::CF_ACCOUNTS)?;
        let key = account.account_id.as_str().as_bytes();

        let txn = self.db.transaction();
        if txn.get_for_update_cf(cf, key, true)?.is_some() {
            txn.rollback()?;
            return Err(Error::AccountAlreadyExists(account.account_id.clone()));
        }
        txn.put_cf(cf, key, bincode::serialize(account)?)?;

        match txn.commit() {
            Ok(()) => Ok(()),
            // A concurrent create of the same id won
            Err(e) if is_write_conflict(&e) => {
                Err(Error::AccountAlreadyExists(account.account_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn conditional_update(&self, update: &ConditionalUpdate) -> Result<UpdateOutcome> {
        let cf_accounts = self.cf_handle(schema::CF_ACCOUNTS)?;
        let cf_transactions = self.cf_handle(schema::CF_TRANSACTIONS)?;
        let cf_index = self.cf_handle(schema::CF_ACCOUNT_TRANSACTIONS)?;
        let cf_idempotency = self.cf_handle(schema::CF_IDEMPOTENCY)?;

        let account_key = update.account_id.as_str().as_bytes();
        let txn = self.db.transaction();

        // 1. Uniqueness of the idempotency key
        if let Some(key) = &update.idempotency_key {
            if txn
                .get_for_update_cf(cf_idempotency, key.as_str().as_bytes(), true)?
                .is_some()
            {
                txn.rollback()?;
                return Ok(UpdateOutcome::DuplicateIdempotencyKey);
            }
        }

        // 2. WHERE account_id = ? AND version = ? AND balance + delta >= 0
        let current: Account = match txn.get_for_update_cf(cf_accounts, account_key, true)? {
            Some(value) => bincode::deserialize(&value)?,
            None => {
                txn.rollback()?;
                return Ok(UpdateOutcome::NotApplied);
            }
        };
        if !update.matches(&current) {
            txn.rollback()?;
            return Ok(UpdateOutcome::NotApplied);
        }

        // 3. SET balance = balance + delta, version = version + 1; INSERT audit record
        let transaction_id = self.last_transaction_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (account, record) = update.apply(&current, transaction_id, Utc::now())?;
        schema::check_account(&account)?;
        schema::check_transaction(&record)?;

        txn.put_cf(cf_accounts, account_key, bincode::serialize(&account)?)?;
        txn.put_cf(
            cf_transactions,
            schema::transaction_key(transaction_id),
            bincode::serialize(&record)?,
        )?;
        txn.put_cf(
            cf_index,
            schema::account_index_key(&record.account_id, record.version),
            schema::transaction_key(transaction_id),
        )?;
        if let Some(key) = &record.idempotency_key {
            txn.put_cf(
                cf_idempotency,
                key.as_str().as_bytes(),
                schema::transaction_key(transaction_id),
            )?;
        }

        // 4. Commit-time validation of every key read above
        match txn.commit() {
            Ok(()) => {
                tracing::debug!(
                    transaction_id,
                    account_id = %record.account_id,
                    version = record.version,
                    "Conditional update committed"
                );
                Ok(UpdateOutcome::Applied(record))
            }
            Err(e) if is_write_conflict(&e) => Ok(UpdateOutcome::NotApplied),
            Err(e) => Err(e.into()),
        }
    }

    fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        let cf_index = self.cf_handle(schema::CF_ACCOUNT_TRANSACTIONS)?;
        let prefix = schema::account_index_prefix(account_id);

        let mut records = Vec::new();
        for item in self.db.prefix_iterator_cf(cf_index, &prefix) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = schema::decode_transaction_id(&value)?;
            let record = self.get_transaction(id)?.ok_or_else(|| {
                Error::Storage(format!("Index points at missing transaction {}", id))
            })?;
            records.push(record);
        }

        // Index is ordered by version ascending
        records.reverse();
        Ok(records)
    }
}

/// Commit lost to a concurrent writer of a tracked key
fn is_write_conflict(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

#[async_trait]
impl Store for RocksStore {
    async fn insert_account(&self, account: Account) -> Result<Account> {
        self.blocking(move |inner| {
            inner.insert_account(&account)?;
            Ok(account)
        })
        .await
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let account_id = account_id.clone();
        self.blocking(move |inner| {
            let cf = inner.cf_handle(schema::CF_ACCOUNTS)?;
            match inner.db.get_cf(cf, account_id.as_str().as_bytes())? {
                Some(value) => Ok(Some(bincode::deserialize(&value)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.blocking(|inner| {
            let cf = inner.cf_handle(schema::CF_ACCOUNTS)?;
            let mut accounts = Vec::new();
            for item in inner.db.iterator_cf(cf, IteratorMode::Start) {
                let (_, value) = item?;
                accounts.push(bincode::deserialize(&value)?);
            }
            Ok(accounts)
        })
        .await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<TransactionRecord>> {
        let key = key.clone();
        self.blocking(move |inner| {
            let cf = inner.cf_handle(schema::CF_IDEMPOTENCY)?;
            match inner.db.get_cf(cf, key.as_str().as_bytes())? {
                Some(value) => inner.get_transaction(schema::decode_transaction_id(&value)?),
                None => Ok(None),
            }
        })
        .await
    }

    async fn conditional_update(&self, update: ConditionalUpdate) -> Result<UpdateOutcome> {
        self.blocking(move |inner| inner.conditional_update(&update))
            .await
    }

    async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        let account_id = account_id.clone();
        self.blocking(move |inner| inner.list_transactions(&account_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionType;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn test_config() -> (StorageConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        (config, temp_dir)
    }

    fn deposit(expected_version: u64, key: Option<&str>) -> ConditionalUpdate {
        ConditionalUpdate {
            account_id: AccountId::new("A"),
            expected_version,
            delta: dec!(25),
            transaction_type: TransactionType::Deposit,
            idempotency_key: key.map(|k| IdempotencyKey::parse(k).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_overflowing_delta_touches_nothing() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();
        store
            .insert_account(Account::new(AccountId::new("A"), dec!(1)))
            .await
            .unwrap();

        let update = ConditionalUpdate {
            delta: rust_decimal::Decimal::MAX,
            ..deposit(1, Some("K"))
        };
        assert_eq!(
            store.conditional_update(update).await.unwrap(),
            UpdateOutcome::NotApplied
        );

        let account = store.get_account(&AccountId::new("A")).await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(1));
        assert_eq!(account.version, 1);
    }

    #[tokio::test]
    async fn test_storage_open() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();
        for name in schema::COLUMN_FAMILIES {
            assert!(store.inner.db.cf_handle(name).is_some());
        }
    }

    #[tokio::test]
    async fn test_conditional_update_roundtrip() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();
        store
            .insert_account(Account::new(AccountId::new("A"), dec!(100)))
            .await
            .unwrap();

        let outcome = store.conditional_update(deposit(1, Some("K"))).await.unwrap();
        let record = match outcome {
            UpdateOutcome::Applied(record) => record,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(record.id, 1);
        assert_eq!(record.balance_after, dec!(125));
        assert_eq!(record.version, 2);

        assert_eq!(
            store.conditional_update(deposit(1, None)).await.unwrap(),
            UpdateOutcome::NotApplied
        );
        assert_eq!(
            store.conditional_update(deposit(2, Some("K"))).await.unwrap(),
            UpdateOutcome::DuplicateIdempotencyKey
        );

        let replay = store
            .find_by_idempotency_key(&IdempotencyKey::parse("K").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replay, record);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let (config, _temp) = test_config();
        {
            let store = RocksStore::open(&config).unwrap();
            store
                .insert_account(Account::new(AccountId::new("A"), dec!(0)))
                .await
                .unwrap();
            store.conditional_update(deposit(1, None)).await.unwrap();
            store.conditional_update(deposit(2, None)).await.unwrap();
        }

        let store = RocksStore::open(&config).unwrap();
        let account = store.get_account(&AccountId::new("A")).await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(50));
        assert_eq!(account.version, 3);

        // Ids keep increasing after a restart
        match store.conditional_update(deposit(3, None)).await.unwrap() {
            UpdateOutcome::Applied(record) => assert_eq!(record.id, 3),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let versions: Vec<u64> = store
            .list_transactions(&AccountId::new("A"))
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let (config, _temp) = test_config();
        let store = RocksStore::open(&config).unwrap();
        store
            .insert_account(Account::new(AccountId::new("A"), dec!(0)))
            .await
            .unwrap();
        let result = store
            .insert_account(Account::new(AccountId::new("A"), dec!(0)))
            .await;
        assert!(matches!(result, Err(Error::AccountAlreadyExists(_))));
    }
}
