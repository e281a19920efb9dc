//! Persisted layout and storage-layer constraints
//!
//! # Column Families
//!
//! - `accounts` - Account rows (key: account_id)
//! - `transactions` - Append-only audit records (key: id, big-endian u64)
//! - `account_transactions` - Per-account index (key: len || account_id || version)
//! - `idempotency` - Unique idempotency keys (key: idempotency_key, value: transaction id)
//! - `meta` - Schema version
//!
//! The checks below mirror the SQL layout
//!
//! ```sql
//! CREATE TABLE accounts (
//!     account_id  VARCHAR(50) PRIMARY KEY,
//!     balance     DECIMAL(18, 2) NOT NULL CHECK (balance >= 0),
//!     version     INTEGER NOT NULL,
//!     created_at  TIMESTAMPTZ NOT NULL,
//!     updated_at  TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE transactions (
//!     id              BIGSERIAL PRIMARY KEY,
//!     account_id      VARCHAR(50) NOT NULL REFERENCES accounts (account_id),
//!     amount          DECIMAL(18, 2) NOT NULL,
//!     type            transaction_type NOT NULL,
//!     balance_before  DECIMAL(18, 2) NOT NULL,
//!     balance_after   DECIMAL(18, 2) NOT NULL,
//!     version         INTEGER NOT NULL,
//!     idempotency_key VARCHAR(50) NULL UNIQUE,
//!     created_at      TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! and are enforced by every backend, independent of what the executor
//! already validated.

use crate::{
    error::{Error, Result},
    types::{Account, AccountId, TransactionRecord, MAX_IDEMPOTENCY_KEY_LEN},
};
use rust_decimal::Decimal;

/// Bump when the on-disk layout changes
pub const SCHEMA_VERSION: u32 = 1;

/// Account rows
pub const CF_ACCOUNTS: &str = "accounts";
/// Audit records
pub const CF_TRANSACTIONS: &str = "transactions";
/// Per-account audit index
pub const CF_ACCOUNT_TRANSACTIONS: &str = "account_transactions";
/// Unique idempotency keys
pub const CF_IDEMPOTENCY: &str = "idempotency";
/// Schema metadata
pub const CF_META: &str = "meta";

/// Every column family the store opens
pub const COLUMN_FAMILIES: [&str; 5] = [
    CF_ACCOUNTS,
    CF_TRANSACTIONS,
    CF_ACCOUNT_TRANSACTIONS,
    CF_IDEMPOTENCY,
    CF_META,
];

/// Key of the schema version in `meta`
pub const META_SCHEMA_VERSION: &[u8] = b"schema_version";

/// Longest account id the layout accepts
pub const MAX_ACCOUNT_ID_LEN: usize = 50;

/// Fractional digits of a `DECIMAL(18, 2)` column
pub const MONEY_SCALE: u32 = 2;

/// Exclusive bound on the magnitude of a `DECIMAL(18, 2)` value (10^16)
pub const MONEY_LIMIT: i64 = 10_000_000_000_000_000;

/// Whether `value` is representable in a `DECIMAL(18, 2)` column
pub fn fits_money_column(value: Decimal) -> bool {
    value.round_dp(MONEY_SCALE) == value && value.abs() < Decimal::from(MONEY_LIMIT)
}

fn check_money(column: &str, value: Decimal) -> Result<()> {
    if !fits_money_column(value) {
        return Err(Error::ConstraintViolation(format!(
            "{} out of DECIMAL(18, 2) range: {}",
            column, value
        )));
    }
    Ok(())
}

/// `CHECK (balance >= 0)` plus column sanity for account rows
pub fn check_account(account: &Account) -> Result<()> {
    let id_len = account.account_id.as_str().chars().count();
    if id_len == 0 || id_len > MAX_ACCOUNT_ID_LEN {
        return Err(Error::ConstraintViolation(format!(
            "accounts.account_id length {} out of range",
            id_len
        )));
    }
    if account.balance < Decimal::ZERO {
        return Err(Error::ConstraintViolation(format!(
            "accounts.balance >= 0 violated for {}: {}",
            account.account_id, account.balance
        )));
    }
    check_money("accounts.balance", account.balance)?;
    if account.version == 0 {
        return Err(Error::ConstraintViolation(format!(
            "accounts.version must start at 1 for {}",
            account.account_id
        )));
    }
    Ok(())
}

/// Column sanity for audit records
pub fn check_transaction(record: &TransactionRecord) -> Result<()> {
    check_money("transactions.amount", record.amount)?;
    check_money("transactions.balance_before", record.balance_before)?;
    check_money("transactions.balance_after", record.balance_after)?;
    if record.balance_before + record.amount != record.balance_after {
        return Err(Error::ConstraintViolation(format!(
            "transactions.balance_after mismatch on {}: {} + {} != {}",
            record.account_id, record.balance_before, record.amount, record.balance_after
        )));
    }
    if record.balance_after < Decimal::ZERO {
        return Err(Error::ConstraintViolation(format!(
            "transactions.balance_after negative on {}",
            record.account_id
        )));
    }
    if let Some(key) = &record.idempotency_key {
        if key.as_str().chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(Error::ConstraintViolation(
                "transactions.idempotency_key too long".to_string(),
            ));
        }
    }
    Ok(())
}

/// Key in `transactions`
pub fn transaction_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Prefix shared by every index entry of one account
pub fn account_index_prefix(account_id: &AccountId) -> Vec<u8> {
    let id = account_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(2 + id.len() + 8);
    key.extend_from_slice(&(id.len() as u16).to_be_bytes());
    key.extend_from_slice(id);
    key
}

/// Key in `account_transactions`; sorts by version within an account
pub fn account_index_key(account_id: &AccountId, version: u64) -> Vec<u8> {
    let mut key = account_index_prefix(account_id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Decode a transaction id stored as an index value
pub fn decode_transaction_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Corrupt transaction id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}
