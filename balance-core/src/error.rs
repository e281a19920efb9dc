//! Error types for the balance engine

use crate::types::AccountId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for balance operations
pub type Result<T> = std::result::Result<T, Error>;

/// Balance engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Account does not exist
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Mutation would drive the balance below zero
    #[error("Insufficient funds in account {account_id}: balance {balance}, delta {delta}")]
    InsufficientFunds {
        /// Target account
        account_id: AccountId,
        /// Balance the attempt observed
        balance: Decimal,
        /// Signed delta that was rejected
        delta: Decimal,
    },

    /// A concurrent writer advanced the version first
    #[error("Version conflict on account {account_id}: expected version {expected_version}")]
    VersionConflict {
        /// Target account
        account_id: AccountId,
        /// Version the attempt read
        expected_version: u64,
    },

    /// Every permitted attempt lost its race
    #[error("Account under contention, retry later (gave up after {attempts} attempts)")]
    ExhaustedRetries {
        /// Physical attempts made
        attempts: u32,
    },

    /// Account id already taken
    #[error("Account already exists: {0}")]
    AccountAlreadyExists(AccountId),

    /// Amount failed validation
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Idempotency key failed validation
    #[error("Invalid idempotency key: {0:?}")]
    InvalidIdempotencyKey(String),

    /// Storage-layer CHECK/UNIQUE constraint rejected a write
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking storage task panicked or was cancelled
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the retry coordinator may run the operation again.
    ///
    /// Terminal business outcomes, caller mistakes, constraint violations
    /// and panicked storage tasks are never retried; everything else raised
    /// mid-attempt is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::AccountNotFound(_)
            | Error::InsufficientFunds { .. }
            | Error::AccountAlreadyExists(_)
            | Error::InvalidAmount(_)
            | Error::InvalidIdempotencyKey(_)
            | Error::ConstraintViolation(_) => false,
            Error::Join(e) => !e.is_panic(),
            _ => true,
        }
    }

    /// Stable machine-readable reason code for the surrounding service layer
    pub fn reason(&self) -> &'static str {
        match self {
            Error::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Error::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::ExhaustedRetries { .. } => "CONTENTION_RETRY_LATER",
            Error::AccountAlreadyExists(_) => "ACCOUNT_ALREADY_EXISTS",
            Error::InvalidAmount(_) => "INVALID_AMOUNT",
            Error::InvalidIdempotencyKey(_) => "INVALID_IDEMPOTENCY_KEY",
            Error::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Join(_) => "STORAGE_FAILURE",
            Error::Config(_) => "CONFIGURATION_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        assert!(!Error::AccountNotFound(AccountId::new("x")).is_retryable());
        assert!(!Error::InsufficientFunds {
            account_id: AccountId::new("x"),
            balance: dec!(1),
            delta: dec!(-2),
        }
        .is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::VersionConflict {
            account_id: AccountId::new("x"),
            expected_version: 4,
        }
        .is_retryable());
        assert!(Error::Storage("busy".to_string()).is_retryable());
    }

    #[test]
    fn test_constraint_violation_is_terminal() {
        let err = Error::ConstraintViolation("accounts.balance overflow".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "CONSTRAINT_VIOLATION");
    }

    #[tokio::test]
    async fn test_panicked_task_is_terminal() {
        let join_err = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        assert!(!Error::from(join_err).is_retryable());
    }

    #[test]
    fn test_exhaustion_is_distinguishable() {
        let err = Error::ExhaustedRetries { attempts: 500 };
        assert_eq!(err.reason(), "CONTENTION_RETRY_LATER");
        assert!(err.to_string().contains("retry later"));
    }
}
