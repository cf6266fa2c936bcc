//! Shared retry-with-backoff helper used by both segment and key fetching (§4.5).
//!
//! Implements exponential backoff with jitter and a hard delay cap.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Backoff parameters for a retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt, capped.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds jitter in `[-0.2, 0.2] * delay` (§4.5's backoff formula).
    pub jitter: bool,
}

impl RetryPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let capped_ms = capped.as_millis() as f64;
        let jitter_frac = rand::rng().random_range(-0.2..0.2);
        let jittered_ms = (capped_ms * (1.0 + jitter_frac)).max(0.0);
        Duration::from_millis(jittered_ms as u64).min(self.max_delay)
    }
}

/// Outcome of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    Success(T),
    /// Failed with a retryable error (network, 5xx/429, validation, transient decrypt).
    Retry(EngineError),
    /// Failed with a permanent error (4xx other than 408/429, parse error, ...).
    Fail(EngineError),
}

/// Run `operation` until it succeeds, exhausts `policy.max_retries`, or the
/// token is cancelled. `operation` receives the 0-indexed attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    for attempt in 0..=policy.max_retries {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    unreachable!("loop covers 0..=max_retries and the last Retry branch returns")
}
