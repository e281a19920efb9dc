//! Conflict retry coordinator - capped exponential backoff with jitter
//!
//! Wraps any fallible async operation. Errors are classified through
//! [`Error::is_retryable`]: terminal errors propagate on first occurrence,
//! everything else is retried until `max_attempts` physical attempts have
//! been made, after which [`Error::ExhaustedRetries`] replaces the cause.
//!
//! ```text
//! Idle -> Attempting -> Success
//!                    -> NonRetryableFailure
//!                    -> ExhaustedRetries
//!                    -> RetryableFailure -> sleep(delay) -> Attempting
//! ```

use crate::{
    config::RetryConfig,
    error::{Error, Result},
};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Hooks invoked while the coordinator works
pub trait RetryListener: Send + Sync {
    /// A retryable failure happened; `attempt` is the 1-based number of the
    /// attempt about to run after `delay`
    fn on_retry(&self, _attempt: u32, _delay: Duration, _cause: &Error) {}

    /// The last permitted attempt failed
    fn on_exhausted(&self, _attempts: u32) {}
}

impl RetryListener for () {}

/// Value produced by a successful attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// Operation result
    pub value: T,

    /// Physical attempts made, including the successful one
    pub attempts: u32,
}

impl<T> Attempted<T> {
    /// More than one physical attempt occurred
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }
}

/// Retries operations that lose optimistic races
#[derive(Debug, Clone)]
pub struct ConflictRetryCoordinator {
    config: RetryConfig,
}

impl ConflictRetryCoordinator {
    /// Coordinator with explicit settings
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Coordinator with the default 500-attempt budget
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Active settings
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// `min(base * 2^attempt, max)` for 0-indexed `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let exponential = self.config.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(exponential.min(self.config.max_backoff_ms))
    }

    /// Backoff plus `uniform(0, jitter)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.config.jitter_ms == 0 {
            Duration::ZERO
        } else {
            let micros = rand::thread_rng().gen_range(0..=self.config.jitter_ms * 1000);
            Duration::from_micros(micros)
        };
        self.backoff(attempt) + jitter
    }

    /// Run `operation` until it succeeds, fails terminally, or the attempt
    /// budget runs out. The closure receives the 0-indexed attempt number.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        listener: &dyn RetryListener,
        mut operation: F,
    ) -> Result<Attempted<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 0..max_attempts {
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            "Operation {} succeeded on attempt {}/{}",
                            operation_name,
                            attempt + 1,
                            max_attempts
                        );
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!("Non-retryable error for {}: {}", operation_name, error);
                return Err(error);
            }

            if attempt + 1 == max_attempts {
                error!(
                    "Max attempts ({}) exceeded for {}, last error: {}",
                    max_attempts, operation_name, error
                );
                listener.on_exhausted(max_attempts);
                return Err(Error::ExhaustedRetries {
                    attempts: max_attempts,
                });
            }

            let delay = self.delay_for(attempt);
            warn!(
                "Retry attempt {}/{} for {} after {:?}: {}",
                attempt + 2,
                max_attempts,
                operation_name,
                delay,
                error
            );
            listener.on_retry(attempt + 2, delay, &error);
            tokio::time::sleep(delay).await;
        }

        Err(Error::ExhaustedRetries {
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccountId;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
            jitter_ms: 0,
        }
    }

    fn conflict() -> Error {
        Error::VersionConflict {
            account_id: AccountId::new("A"),
            expected_version: 1,
        }
    }

    #[derive(Default)]
    struct Recorder {
        retries: Mutex<Vec<u32>>,
        exhausted: Mutex<Option<u32>>,
    }

    impl RetryListener for Recorder {
        fn on_retry(&self, attempt: u32, _delay: Duration, _cause: &Error) {
            self.retries.lock().push(attempt);
        }

        fn on_exhausted(&self, attempts: u32) {
            *self.exhausted.lock() = Some(attempts);
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let coordinator = ConflictRetryCoordinator::new(RetryConfig {
            max_attempts: 10,
            base_backoff_ms: 5,
            max_backoff_ms: 1000,
            jitter_ms: 0,
        });

        assert_eq!(coordinator.backoff(0).as_millis(), 5);
        assert_eq!(coordinator.backoff(1).as_millis(), 10);
        assert_eq!(coordinator.backoff(2).as_millis(), 20);
        assert_eq!(coordinator.delay_for(3).as_millis(), 40);
    }

    #[test]
    fn test_max_delay_cap() {
        let coordinator = ConflictRetryCoordinator::with_defaults();
        assert_eq!(coordinator.backoff(8).as_millis(), 1000);
        assert_eq!(coordinator.backoff(200).as_millis(), 1000);
    }

    #[test]
    fn test_jitter_bounded() {
        let coordinator = ConflictRetryCoordinator::with_defaults();
        for _ in 0..100 {
            let delay = coordinator.delay_for(0);
            assert!(delay >= Duration::from_millis(5));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn test_first_success_single_attempt() {
        let coordinator = ConflictRetryCoordinator::new(fast_config(5));
        let calls = &AtomicU32::new(0);

        let result = coordinator
            .execute("op", &(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>("done")
            })
            .await
            .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 1);
        assert!(!result.was_retried());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_after_conflict() {
        let coordinator = ConflictRetryCoordinator::new(fast_config(5));
        let recorder = Recorder::default();

        let result = coordinator
            .execute("op", &recorder, |attempt| async move {
                if attempt < 2 {
                    Err(conflict())
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 2);
        assert_eq!(result.attempts, 3);
        assert!(result.was_retried());
        assert_eq!(*recorder.retries.lock(), vec![2, 3]);
        assert!(recorder.exhausted.lock().is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_replaces_cause() {
        let coordinator = ConflictRetryCoordinator::new(fast_config(3));
        let recorder = Recorder::default();
        let calls = &AtomicU32::new(0);

        let result: Result<Attempted<()>> = coordinator
            .execute("op", &recorder, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            })
            .await;

        assert!(matches!(result, Err(Error::ExhaustedRetries { attempts: 3 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*recorder.exhausted.lock(), Some(3));
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let coordinator = ConflictRetryCoordinator::new(fast_config(5));
        let calls = &AtomicU32::new(0);

        let result: Result<Attempted<()>> = coordinator
            .execute("op", &(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::AccountNotFound(AccountId::new("missing")))
            })
            .await;

        assert!(matches!(result, Err(Error::AccountNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_infrastructure_errors_retried() {
        let coordinator = ConflictRetryCoordinator::new(fast_config(4));

        let result = coordinator
            .execute("op", &(), |attempt| async move {
                if attempt == 0 {
                    Err(Error::Storage("connection reset".to_string()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
    }
}
