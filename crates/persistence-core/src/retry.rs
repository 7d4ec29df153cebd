//! Retry policy with randomized exponential backoff
//!
//! Every attempt runs the full backend call, including error translation, so
//! the policy only ever sees normalized errors. Non-retryable errors are
//! returned after the first attempt; when attempts run out, the last error is
//! returned as-is.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{Error, Result};

/// Maximum number of attempts, including the first one
pub const MAX_ATTEMPTS: u32 = 8;

/// Multiplier applied to the exponential backoff window
pub const BACKOFF_MULTIPLIER: Duration = Duration::from_millis(800);

/// Upper bound for a single backoff wait
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Bounded retry with randomized exponential backoff
///
/// The wait after attempt `n` is drawn uniformly from
/// `[0, min(max_delay, multiplier * 2^(n-1))]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    multiplier: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            multiplier: BACKOFF_MULTIPLIER,
            max_delay: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` is clamped to at least one attempt
    pub fn new(max_attempts: u32, multiplier: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            multiplier,
            max_delay,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the backoff window after the given (1-based) attempt
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let window = self.multiplier.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(window.min(self.max_delay.as_secs_f64()))
    }

    /// Draw the jittered wait after the given (1-based) attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_secs_f64();
        if ceiling <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::rng().random_range(0.0..=ceiling))
    }

    /// Run `f`, retrying transient errors (see [`Error::is_retryable`])
    pub async fn run<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(operation, Error::is_retryable, f).await
    }

    /// Run `f`, retrying errors accepted by `retryable`
    pub async fn run_if<T, F, Fut, P>(&self, operation: &str, retryable: P, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        %operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
