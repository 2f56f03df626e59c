//! Retry with exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// `max_attempts` tries; after failed attempt `k` wait `base_delay * 2^(k-1)`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    debug!(
                        "Attempt {}/{} failed ({}), retrying in {}ms",
                        attempt,
                        self.max_attempts,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[derive(Debug)]
    enum FakeError {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Retryable for FakeError {
        fn is_retryable(&self) -> bool {
            matches!(self, FakeError::Transient)
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_succeeds_on_last_attempt_after_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(20));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<u32, FakeError> = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(FakeError::Transient)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), FakeError> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Fatal) }
            })
            .await;

        assert!(matches!(result, Err(FakeError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), FakeError> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::Transient) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
