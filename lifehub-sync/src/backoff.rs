//! Bounded exponential backoff
//!
//! A freshly-announced generation asset may not be readable the instant
//! its job completes; the gap is eventual consistency, not an error. This
//! module models the retry budget as a first-class policy (max attempts,
//! capped exponential delay) instead of leaving it to callers' loops.

use lifehub_common::config::BackoffConfig;
use lifehub_common::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap on the per-attempt delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay to sleep after the given failed attempt (1-based)
    ///
    /// Doubles per attempt, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay.saturating_mul(factor as u32);
        delay.min(self.max_delay)
    }
}

/// Retry an async operation until it succeeds or the budget is exhausted
///
/// Transient failures within the budget are logged at debug and retried;
/// exhaustion surfaces the final error wrapped as `RetryExhausted`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation = what, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::warn!(
                    operation = what,
                    attempts = attempt,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(Error::RetryExhausted(format!(
                    "{} failed after {} attempts: {}",
                    what, attempt, err
                )));
            }
        }
    }
}
