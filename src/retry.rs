//! Retry and backoff for outbound code host calls.
//!
//! [`RetryingFetcher::retry`] runs an operation up to `max_attempts` times.
//! Failures are classified through [`Retryable`]: 403, 429 and 5xx responses
//! are retried, everything else (401, 404, errors without a status) is
//! returned immediately. A retryable failure waits until the rate-limit reset
//! instant when the host reported one, otherwise `base_delay * 2^(attempt-1)`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryConfig;

/// Classification hooks for errors passed through [`RetryingFetcher`].
pub trait Retryable {
    /// HTTP-like status code carried by the error, if any.
    fn status(&self) -> Option<u16>;

    /// Epoch seconds at which the host's rate limit resets, if reported.
    fn rate_limit_reset(&self) -> Option<i64> {
        None
    }

    fn is_retryable(&self) -> bool {
        self.status().is_some_and(is_retryable_status)
    }
}

/// 403 is treated as a soft rate limit and retried like 429.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 403 | 429) || (500..600).contains(&status)
}

/// Stateless retry policy shared by every code host adapter.
#[derive(Debug, Clone, Copy)]
pub struct RetryingFetcher {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryingFetcher {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(3000))
    }
}

impl RetryingFetcher {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    /// The last error is returned unchanged.
    pub async fn retry<T, E, F, Fut>(&self, identifier: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;

                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }

                    let wait = self.wait_for(attempt, err.rate_limit_reset());
                    warn!(
                        identifier,
                        attempt,
                        max_attempts = self.max_attempts,
                        status = err.status(),
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Code host request failed; backing off before retry"
                    );
                    counter!("code_host_retry_attempts_total").increment(1);
                    histogram!("code_host_retry_wait_ms").record(wait.as_secs_f64() * 1_000.0);

                    sleep(wait).await;
                }
            }
        }
    }

    fn wait_for(&self, attempt: u32, reset_epoch_secs: Option<i64>) -> Duration {
        match reset_epoch_secs {
            Some(reset) => {
                let now_ms = Utc::now().timestamp_millis();
                let wait_ms = reset.saturating_mul(1000).saturating_sub(now_ms).max(0);
                Duration::from_millis(wait_ms as u64)
            }
            None => self.backoff(attempt),
        }
    }

    /// Exponential backoff for the given 1-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}
