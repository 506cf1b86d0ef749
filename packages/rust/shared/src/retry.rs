//! Retry with backoff for fallible async calls.
//!
//! The same [`RetryPolicy`] wraps search page requests and page fetches.
//! Whether an error is worth another attempt is decided by a classifier passed
//! at the call site, not by the error's type.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{BackoffMode, RetryConfig};
use crate::error::Disposition;

/// Attempt budget and delay curve for one logical call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base_secs: f64,
    mode: BackoffMode,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_secs: f64, mode: BackoffMode) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base_secs,
            mode,
            max_delay: Duration::from_millis(RetryConfig::default().max_delay_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base_secs, config.backoff)
            .with_max_delay(Duration::from_millis(config.max_delay_ms))
    }

    /// Retries without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0.0, BackoffMode::Exponential)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = match self.mode {
            BackoffMode::Literal => self.backoff_base_secs * self.backoff_base_secs.powi(exponent),
            BackoffMode::Exponential => self.backoff_base_secs * 2f64.powi(exponent),
        };

        // Out-of-range or non-finite delays saturate at the cap.
        Duration::try_from_secs_f64(secs.max(0.0))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned to the caller.
    ///
    /// `op` receives the 1-indexed attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> Disposition,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if classify(&err) == Disposition::Fail {
                        debug!(label, attempt, error = %err, "non-retryable failure");
                        return Err(err);
                    }
                    if attempt >= self.max_attempts {
                        warn!(label, attempts = attempt, error = %err, "all attempts failed");
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::HarvestError;

    #[test]
    fn literal_backoff_shrinks_below_unit_base() {
        let policy = RetryPolicy::new(3, 0.5, BackoffMode::Literal);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for(3), Duration::from_millis(125));
    }

    #[test]
    fn exponential_backoff_grows() {
        let policy = RetryPolicy::new(4, 0.5, BackoffMode::Exponential);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(10, 2.0, BackoffMode::Exponential)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(8), Duration::from_secs(5));
    }

    #[test]
    fn huge_delays_saturate_at_the_cap() {
        let policy = RetryPolicy::new(30, 10.0, BackoffMode::Literal);
        assert_eq!(policy.delay_for(21), policy.max_delay);
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);

        let policy = RetryPolicy::new(200, 2.0, BackoffMode::Exponential)
            .with_max_delay(Duration::from_secs(30));
        assert_eq!(policy.delay_for(100), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2000), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: Result<&str, HarvestError> = policy
            .run(
                "flaky",
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(HarvestError::Timeout("slow".into()))
                        } else {
                            Ok("done")
                        }
                    }
                },
                HarvestError::disposition,
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);

        let result: Result<(), HarvestError> = policy
            .run(
                "quota",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(HarvestError::Provider("quota exceeded".into())) }
                },
                HarvestError::disposition,
            )
            .await;

        assert!(matches!(result, Err(HarvestError::Provider(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: Result<(), HarvestError> = policy
            .run(
                "down",
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(HarvestError::Network(format!("reset #{attempt}"))) }
                },
                HarvestError::disposition,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "network error: reset #3");
    }
}
