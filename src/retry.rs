//! Bounded exponential backoff for the handshake calls.
//!
//! Only `initialize` and `session/new` go through [`with_retry`]. Prompt
//! submission is not idempotent and is never retried.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::Result;

/// Attempt budget and delay bounds for a retried call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub min_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt number `attempt` (1-based).
    ///
    /// Doubles from `min_delay` and is clamped into `[min_delay, max_delay]`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.min_delay.saturating_mul(1_u32 << shift);
        delay.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted.
///
/// Every failure, including timeouts, is retried. The error of the last
/// attempt is returned on exhaustion.
///
/// # Errors
///
/// Returns the final attempt's error once all attempts have failed.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "retry: succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(label, attempt, delay = ?delay, error = %err, "retry: attempt failed; retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(label, attempt, error = %err, "retry: attempts exhausted");
                return Err(err);
            }
        }
    }
}
