//! Bounded exponential backoff shared by the transport and the pending queue.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;

/// Retry budget and backoff curve.
///
/// `max_attempts` counts every try including the first. The transport layer
/// retries a single call up to that many times; the queue layer uses it as the
/// dead-letter ceiling for a pending operation across push cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    /// Short in-call retries for a remote statement.
    pub fn transport(max_attempts: u32) -> Self {
        Self::new(max_attempts)
    }

    /// Cross-cycle ceiling for queued operations.
    pub fn queue(max_attempts: u32) -> Self {
        Self::new(max_attempts)
            .with_initial_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(600))
    }

    /// Single try, no backoff.
    pub fn none() -> Self {
        Self::new(1)
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (0-based). Deterministic, no jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = base.min(self.max_delay.as_millis() as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = capped.max(0.0) as u64;
        Duration::from_millis(millis)
    }

    /// Whether `attempts` failed tries use up the budget.
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Runs `operation`, retrying transient errors until the budget is spent.
    /// Any other error is returned immediately.
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Remote call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => return Err(error),
                Err(error) => {
                    attempt += 1;
                    if self.is_exhausted(attempt) {
                        warn!(attempts = attempt, "Giving up on remote call: {error}");
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt - 1);
                    warn!(attempt, ?delay, "Remote call failed: {error}. Retrying");
                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(10));
    }

    #[test]
    fn exhaustion_counts_every_try() {
        let policy = RetryPolicy::queue(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(RetryPolicy::new(0).is_exhausted(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = fast(3)
            .run(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::RemoteUnavailable("connection refused".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast(5)
            .run(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::validation("unknown table"))
                }
            })
            .await;

        assert!(result.unwrap_err().is_validation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn budget_bounds_transient_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = fast(2)
            .run(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::RemoteUnavailable("timeout".into()))
                }
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
