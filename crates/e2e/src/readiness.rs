//! Fixed-interval readiness polling shared by the process supervisors

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// A bounded poll: check every `interval` until `timeout` has elapsed
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub interval: Duration,
    pub timeout: Duration,
}

/// The predicate never became ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimeout {
    pub attempts: usize,
    pub elapsed: Duration,
}

impl Readiness {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Run `check` until it yields `Some`, at least once and never past the timeout
    pub async fn wait_for<T, F, Fut>(&self, mut check: F) -> Result<T, PollTimeout>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let start = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            if let Some(value) = check().await {
                return Ok(value);
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(PollTimeout { attempts, elapsed });
            }
            sleep(self.interval.min(self.timeout - elapsed)).await;
        }
    }
}
