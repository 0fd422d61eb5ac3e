//! Retry with exponential backoff for store calls and whole cycles.
//!
//! Only failures whose [`RetryClass`] is in the policy's retryable set are
//! retried; anything else is surfaced on the first attempt.

use crate::config::{Config, MAX_RETRY_BACKOFF};
use crate::error::{RetryClass, Retryable};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Upper bound on any single sleep between attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub attempts: u32,
    /// Sleep before the second attempt.
    pub delay: Duration,
    /// Multiplier applied to the sleep after every retry.
    pub backoff: f64,
    pub retryable: Vec<RetryClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 2.0,
            retryable: RetryClass::ALL.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let backoff = if config.retry_backoff.is_finite() {
            config.retry_backoff.clamp(1.0, MAX_RETRY_BACKOFF)
        } else {
            Self::default().backoff
        };
        Self {
            attempts: config.retry_attempts.max(1),
            delay: config.retry_delay(),
            backoff,
            retryable: config.retry_on.clone(),
        }
    }

    /// Sleep applied after the given failed attempt (1-indexed), capped at
    /// [`MAX_RETRY_DELAY`].
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let secs = self.delay.as_secs_f64() * self.backoff.powi(exp);
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }

    fn retries(&self, class: Option<RetryClass>) -> bool {
        class.is_some_and(|class| self.retryable.contains(&class))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are used up. At most `attempts - 1` sleeps happen.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                let class = err.retry_class();
                if !policy.retries(class) {
                    tracing::error!(
                        operation = operation_name,
                        error = %err,
                        "non-retryable error; not retrying"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    attempts,
                    class = ?class,
                    error = %err,
                    "operation failed"
                );
                if attempt >= attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempts,
                        "all retry attempts failed"
                    );
                    return Err(err);
                }

                tokio::time::sleep(policy.delay_after(attempt)).await;
                attempt += 1;
            }
        }
    }
}
