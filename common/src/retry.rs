// Retry strategy for version-control transport operations
// Only transient failures (transport, timeout) are retried; the retry budget is
// configured per worker and capped at one by settings validation.

use crate::errors::VcsError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Default number of retries granted to a transient failure
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 1;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt
    /// Returns None if max retries exceeded
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Get the maximum number of retries
    fn max_retries(&self) -> u32;

    /// Check if more retries are allowed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }
}

/// Exponential backoff retry strategy with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            max_retries: DEFAULT_TRANSIENT_RETRIES,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new exponential backoff strategy with custom values
    pub fn with_config(
        base_delay_ms: u64,
        max_delay_ms: u64,
        jitter_factor: f64,
        max_retries: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            max_retries,
        }
    }

    /// base * 3^attempt, capped at max_delay
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let factor = 3_u64.saturating_pow(attempt);
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    fn add_jitter_ms(&self, base_delay_ms: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let base = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base)))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Fixed delay retry strategy (for testing or simple cases)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }

    /// No waiting between attempts, one transient retry
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, DEFAULT_TRANSIENT_RETRIES)
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Run a backend operation under a per-attempt timeout, retrying transient
/// failures as the strategy allows. Returns the final result and the number of
/// attempts made.
pub async fn retry_transient<T, F, Fut>(
    strategy: &dyn RetryStrategy,
    attempt_timeout: Duration,
    operation: &str,
    mut f: F,
) -> (Result<T, VcsError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VcsError>>,
{
    let mut retries = 0u32;
    loop {
        let attempts = retries + 1;
        let result = match tokio::time::timeout(attempt_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(VcsError::Timeout(attempt_timeout.as_secs())),
        };

        let err = match result {
            Ok(value) => return (Ok(value), attempts),
            Err(err) => err,
        };

        if !err.is_transient() {
            return (Err(err), attempts);
        }

        match strategy.next_delay(retries) {
            Some(delay) => {
                warn!(
                    operation = operation,
                    attempt = attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            None => {
                info!(operation = operation, attempts = attempts, "Retry budget exhausted");
                return (Err(err), attempts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_sequence() {
        let strategy = ExponentialBackoff::with_config(1000, 20_000, 0.0, 5);
        assert_eq!(strategy.calculate_base_delay(0), 1000);
        assert_eq!(strategy.calculate_base_delay(1), 3000);
        assert_eq!(strategy.calculate_base_delay(2), 9000);
        assert_eq!(strategy.calculate_base_delay(3), 20_000);
    }

    #[test]
    fn test_default_allows_single_retry() {
        let strategy = ExponentialBackoff::new();
        assert_eq!(strategy.max_retries(), 1);
        assert!(strategy.next_delay(0).is_some());
        assert!(strategy.next_delay(1).is_none());
        assert!(strategy.should_retry(0));
        assert!(!strategy.should_retry(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let strategy = ExponentialBackoff::with_config(1000, 20_000, 0.5, 1);
        for _ in 0..20 {
            let delay = strategy.next_delay(0).unwrap().as_millis();
            assert!((1000..=1500).contains(&delay));
        }
    }

    #[test]
    fn test_jitter_factor_clamping() {
        let strategy = ExponentialBackoff::with_config(5, 10, -0.5, 1);
        assert_eq!(strategy.jitter_factor, 0.0);
        let strategy = ExponentialBackoff::with_config(5, 10, 1.5, 1);
        assert_eq!(strategy.jitter_factor, 1.0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = retry_transient(
            &FixedDelay::immediate(),
            Duration::from_secs(5),
            "fetch",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(VcsError::Transport("connection reset".into()))
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recovers_on_retry() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = retry_transient(
            &FixedDelay::immediate(),
            Duration::from_secs(5),
            "fetch",
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VcsError::Timeout(1))
                } else {
                    Ok(42)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = retry_transient(
            &FixedDelay::immediate(),
            Duration::from_secs(5),
            "fetch",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(VcsError::Authentication("denied".into()))
            },
        )
        .await;

        assert!(matches!(result, Err(VcsError::Authentication(_))));
        assert_eq!(attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_transient() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, attempts) = retry_transient(
            &FixedDelay::immediate(),
            Duration::from_millis(20),
            "fetch",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, VcsError>(())
            },
        )
        .await;

        assert_eq!(result, Err(VcsError::Timeout(0)));
        assert_eq!(attempts, 2);
    }
}
