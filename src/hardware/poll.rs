//! Bounded polling.
//!
//! Every wait in the core (motion completion, cylinder settling) goes through
//! [`RetryPolicy::poll_until`], which gives up with [`GuiderError::Timeout`] once the attempt
//! budget is spent.

use crate::error::{GuiderError, GuiderResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

/// Interval and attempt budget for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// Maximum number of checks
    pub max_attempts: u32,
    /// Sleep before the first check as well as between checks
    pub delay_first: bool,
}

impl RetryPolicy {
    /// Check immediately, then every `interval`, at most `max_attempts` times.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            delay_first: false,
        }
    }

    /// Wait one interval before every check, including the first.
    pub fn with_delay_first(mut self) -> Self {
        self.delay_first = true;
        self
    }

    /// Run `check` until it yields `Some`, an error, or the budget runs out.
    ///
    /// Errors from `check` are returned immediately and are never retried.
    pub async fn poll_until<T, F, Fut>(&self, operation: &str, mut check: F) -> GuiderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GuiderResult<Option<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            if self.delay_first || attempt > 1 {
                sleep(self.interval).await;
            }
            if let Some(value) = check().await? {
                trace!(operation, attempt, "poll converged");
                return Ok(value);
            }
        }
        Err(GuiderError::timeout(operation, self.max_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn returns_first_converged_value() -> anyhow::Result<()> {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(Duration::ZERO, 10);

        let value = policy
            .poll_until("count", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Ok((n == 3).then_some(n * 10)) }
            })
            .await?;

        assert_eq!(value, 30);
        assert_eq!(calls.get(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_budget_is_timeout() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(Duration::ZERO, 4);

        let err = policy
            .poll_until("never", || {
                calls.set(calls.get() + 1);
                async { Ok::<Option<()>, GuiderError>(None) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.get(), 4);
        match err {
            GuiderError::Timeout { operation, attempts } => {
                assert_eq!(operation, "never");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_errors_are_not_retried() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(Duration::ZERO, 4);

        let err = policy
            .poll_until("fails", || {
                calls.set(calls.get() + 1);
                async { Err::<Option<()>, _>(GuiderError::NotHomed) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(matches!(err, GuiderError::NotHomed));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_first_waits_before_every_check() -> anyhow::Result<()> {
        let policy = RetryPolicy::new(Duration::from_millis(100), 5).with_delay_first();
        let start = tokio::time::Instant::now();
        let calls = Cell::new(0u32);

        policy
            .poll_until("settle", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { Ok((n == 2).then_some(())) }
            })
            .await?;

        assert_eq!(start.elapsed(), Duration::from_millis(200));
        Ok(())
    }
}
