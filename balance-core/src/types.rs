//! Core types for the balance engine
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Cheap cloning across retry attempts

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest idempotency key accepted from callers
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 50;

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Opaque caller token that makes a mutation safe to resubmit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate a caller-supplied key (non-empty, at most 50 chars)
    pub fn parse(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.is_empty() || key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(crate::Error::InvalidIdempotencyKey(key));
        }
        Ok(Self(key))
    }

    /// Mint a fresh key. Uncorrelated calls get no deduplication.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of balance mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TransactionType {
    /// Funds added to the account
    Deposit = 1,
    /// Funds removed from the account
    Withdraw = 2,
}

impl TransactionType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdraw => "withdraw",
        }
    }

    /// Turn an amount into the signed delta for this type.
    ///
    /// The type alone decides the sign: a withdraw is always negative.
    pub fn signed_delta(&self, amount: Decimal) -> Decimal {
        match self {
            TransactionType::Deposit => amount.abs(),
            TransactionType::Withdraw => -amount.abs(),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deposit" => Ok(TransactionType::Deposit),
            "withdraw" => Ok(TransactionType::Withdraw),
            other => Err(crate::Error::Other(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

/// Account row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Primary key
    pub account_id: AccountId,

    /// Current balance, never negative
    pub balance: Decimal,

    /// Optimistic-lock token, 1 on creation and +1 per committed mutation
    pub version: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account at version 1
    pub fn new(account_id: AccountId, balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            balance,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable audit record of one committed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Auto-increment id
    pub id: u64,

    /// Account the mutation was applied to
    pub account_id: AccountId,

    /// Signed amount (negative for withdrawals)
    pub amount: Decimal,

    /// Mutation kind
    pub transaction_type: TransactionType,

    /// Balance observed by the winning attempt
    pub balance_before: Decimal,

    /// `balance_before + amount`
    pub balance_after: Decimal,

    /// Account version after this mutation
    pub version: u64,

    /// Caller token, unique across all records when present
    pub idempotency_key: Option<IdempotencyKey>,

    /// Commit timestamp
    pub created_at: DateTime<Utc>,
}

/// One logical mutation request as seen by the executor
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceMutation {
    /// Target account
    pub account_id: AccountId,

    /// Signed delta
    pub delta: Decimal,

    /// Mutation kind
    pub transaction_type: TransactionType,

    /// Deduplication token
    pub idempotency_key: Option<IdempotencyKey>,
}

/// What a committed (or replayed) mutation produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Audit record id
    pub transaction_id: u64,

    /// Balance right after the mutation
    pub balance_after: Decimal,

    /// Account version right after the mutation
    pub version: u64,
}

impl From<&TransactionRecord> for CommitReceipt {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            transaction_id: record.id,
            balance_after: record.balance_after,
            version: record.version,
        }
    }
}

/// Result handed back to callers of `apply_delta`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Audit record id
    pub transaction_id: u64,

    /// Balance right after the mutation
    pub balance_after: Decimal,

    /// Account version right after the mutation
    pub version: u64,

    /// More than one physical attempt was needed
    pub was_retried: bool,
}

impl ApplyOutcome {
    /// Attach the retry flag to a receipt
    pub fn from_receipt(receipt: CommitReceipt, was_retried: bool) -> Self {
        Self {
            transaction_id: receipt.transaction_id,
            balance_after: receipt.balance_after,
            version: receipt.version,
            was_retried,
        }
    }
}
