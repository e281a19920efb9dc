//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the engine.
//!
//! # Metrics
//!
//! - `balance_mutations_total` - Mutations committed
//! - `balance_idempotent_replays_total` - Requests answered from a prior commit
//! - `balance_version_conflicts_total` - Attempts that lost a version race
//! - `balance_insufficient_funds_total` - Withdrawals rejected for overdraft
//! - `balance_exhausted_retries_total` - Operations that ran out of attempts
//! - `balance_attempts_per_operation` - Histogram of physical attempts

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Mutations committed
    pub mutations_total: IntCounter,

    /// Idempotent replays
    pub replays_total: IntCounter,

    /// Lost version races
    pub conflicts_total: IntCounter,

    /// Overdraft rejections
    pub insufficient_funds_total: IntCounter,

    /// Exhausted retry budgets
    pub exhausted_total: IntCounter,

    /// Attempts per successful operation
    pub attempts: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let mutations_total =
            IntCounter::new("balance_mutations_total", "Mutations committed")?;
        registry.register(Box::new(mutations_total.clone()))?;

        let replays_total = IntCounter::new(
            "balance_idempotent_replays_total",
            "Requests answered from a prior commit",
        )?;
        registry.register(Box::new(replays_total.clone()))?;

        let conflicts_total = IntCounter::new(
            "balance_version_conflicts_total",
            "Attempts that lost a version race",
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let insufficient_funds_total = IntCounter::new(
            "balance_insufficient_funds_total",
            "Withdrawals rejected for overdraft",
        )?;
        registry.register(Box::new(insufficient_funds_total.clone()))?;

        let exhausted_total = IntCounter::new(
            "balance_exhausted_retries_total",
            "Operations that ran out of attempts",
        )?;
        registry.register(Box::new(exhausted_total.clone()))?;

        let attempts = Histogram::with_opts(
            HistogramOpts::new(
                "balance_attempts_per_operation",
                "Physical attempts per successful operation",
            )
            .buckets(vec![1.0, 2.0, 3.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
        )?;
        registry.register(Box::new(attempts.clone()))?;

        Ok(Self {
            mutations_total,
            replays_total,
            conflicts_total,
            insufficient_funds_total,
            exhausted_total,
            attempts,
            registry,
        })
    }

    /// Record a committed mutation and how many attempts it took
    pub fn record_commit(&self, attempts: u32) {
        self.mutations_total.inc();
        self.attempts.observe(attempts as f64);
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Record a lost version race
    pub fn record_conflict(&self) {
        self.conflicts_total.inc();
    }

    /// Record an overdraft rejection
    pub fn record_insufficient_funds(&self) {
        self.insufficient_funds_total.inc();
    }

    /// Record an exhausted retry budget
    pub fn record_exhausted(&self) {
        self.exhausted_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("mutations_total", &self.mutations_total.get())
            .field("conflicts_total", &self.conflicts_total.get())
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
