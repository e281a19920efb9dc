//! Balance service façade
//!
//! Orchestrates idempotency resolver → conflict retry coordinator → atomic
//! update executor for external callers.
//!
//! # Example
//!
//! ```no_run
//! use balance_core::{BalanceService, Config, TransactionType};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> balance_core::Result<()> {
//!     let service = BalanceService::open(&Config::default())?;
//!     let account = service.create_account(None, Decimal::new(500, 0)).await?;
//!
//!     let outcome = service
//!         .apply_delta(&account.account_id, Decimal::new(5, 0), TransactionType::Withdraw, None)
//!         .await?;
//!     assert_eq!(outcome.balance_after, Decimal::new(495, 0));
//!
//!     Ok(())
//! }
//! ```

use crate::{
    config::{Config, RetryConfig},
    error::{Error, Result},
    executor::AtomicUpdateExecutor,
    idempotency::IdempotencyResolver,
    metrics::Metrics,
    retry::{ConflictRetryCoordinator, RetryListener},
    storage::{open_store, schema, Store},
    types::{
        Account, AccountId, ApplyOutcome, BalanceMutation, IdempotencyKey, TransactionRecord,
        TransactionType,
    },
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for account creation, reads and balance mutations
pub struct BalanceService {
    store: Arc<dyn Store>,
    resolver: IdempotencyResolver,
    executor: AtomicUpdateExecutor,
    retry: ConflictRetryCoordinator,
    metrics: Metrics,
}

impl BalanceService {
    /// Service over an existing store
    pub fn new(store: Arc<dyn Store>, retry: RetryConfig) -> Self {
        Self {
            resolver: IdempotencyResolver::new(store.clone()),
            executor: AtomicUpdateExecutor::new(store.clone()),
            retry: ConflictRetryCoordinator::new(retry),
            metrics: Metrics::default(),
            store,
        }
    }

    /// Open the configured store and build the service on it
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.storage)?;
        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            max_attempts = config.retry.max_attempts,
            "Balance service ready"
        );
        Ok(Self::new(store, config.retry.clone()))
    }

    /// Replace the metrics collector
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Create an account at version 1. A missing id is minted.
    pub async fn create_account(
        &self,
        account_id: Option<AccountId>,
        initial_balance: Decimal,
    ) -> Result<Account> {
        if initial_balance < Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "initial balance must not be negative: {}",
                initial_balance
            )));
        }
        check_money_column(initial_balance)?;

        let account_id = account_id.unwrap_or_else(AccountId::generate);
        let account = self
            .store
            .insert_account(Account::new(account_id, initial_balance))
            .await?;

        tracing::info!(
            account_id = %account.account_id,
            balance = %account.balance,
            "Account created"
        );
        Ok(account)
    }

    /// Full account row
    pub async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(account_id.clone()))
    }

    /// Current balance
    pub async fn read_balance(&self, account_id: &AccountId) -> Result<Decimal> {
        Ok(self.get_account(account_id).await?.balance)
    }

    /// All accounts
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_accounts().await
    }

    /// Audit trail of one account, newest first
    pub async fn list_transactions(&self, account_id: &AccountId) -> Result<Vec<TransactionRecord>> {
        self.get_account(account_id).await?;
        self.store.list_transactions(account_id).await
    }

    /// Deposit into or withdraw from an account.
    ///
    /// `amount` must be positive; `transaction_type` decides the sign. The
    /// same idempotency key always yields the result of the first commit.
    pub async fn apply_delta(
        &self,
        account_id: &AccountId,
        amount: Decimal,
        transaction_type: TransactionType,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<ApplyOutcome> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(format!(
                "amount must be positive: {}",
                amount
            )));
        }
        check_money_column(amount)?;

        let key = self.resolver.ensure_key(idempotency_key);
        if let Some(receipt) = self.resolver.lookup(&key).await? {
            self.metrics.record_replay();
            return Ok(ApplyOutcome::from_receipt(receipt, false));
        }

        let mutation = BalanceMutation {
            account_id: account_id.clone(),
            delta: transaction_type.signed_delta(amount),
            transaction_type,
            idempotency_key: Some(key),
        };

        let listener = MetricsListener {
            metrics: &self.metrics,
        };
        let executor = &self.executor;
        let mutation_ref = &mutation;
        let result = self
            .retry
            .execute("apply_delta", &listener, move |_| async move {
                executor.execute(mutation_ref).await
            })
            .await;

        let attempted = match result {
            Ok(attempted) => attempted,
            Err(e) => {
                if let Error::InsufficientFunds { .. } = e {
                    self.metrics.record_insufficient_funds();
                }
                tracing::debug!(
                    account_id = %account_id,
                    reason = e.reason(),
                    "Balance update rejected"
                );
                return Err(e);
            }
        };

        let execution = attempted.value;
        if execution.is_replay() {
            self.metrics.record_replay();
        } else {
            self.metrics.record_commit(attempted.attempts);
        }

        let receipt = execution.receipt();
        tracing::debug!(
            account_id = %account_id,
            transaction_id = receipt.transaction_id,
            version = receipt.version,
            attempts = attempted.attempts,
            "Balance updated"
        );

        Ok(ApplyOutcome::from_receipt(receipt, attempted.was_retried()))
    }
}

/// Amounts must fit `DECIMAL(18, 2)`: two fractional digits, below 10^16
fn check_money_column(amount: Decimal) -> Result<()> {
    if !schema::fits_money_column(amount) {
        return Err(Error::InvalidAmount(format!(
            "{} does not fit DECIMAL(18, 2)",
            amount
        )));
    }
    Ok(())
}

impl std::fmt::Debug for BalanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceService")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

struct MetricsListener<'a> {
    metrics: &'a Metrics,
}

impl RetryListener for MetricsListener<'_> {
    fn on_retry(&self, _attempt: u32, _delay: Duration, cause: &Error) {
        if let Error::VersionConflict { .. } = cause {
            self.metrics.record_conflict();
        }
    }

    fn on_exhausted(&self, _attempts: u32) {
        self.metrics.record_conflict();
        self.metrics.record_exhausted();
    }
}
