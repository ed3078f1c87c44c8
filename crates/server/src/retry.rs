//! Retry policy for outbound provider calls.
//!
//! An operation reports one of three outcomes per attempt. Retryable
//! failures back off for `multiplier * attempt`, where the multiplier is the
//! base delay unless the failure carried its own retry-after hint.
//! Exhausted or permanent failures come back as `Ok(None)` so the caller can
//! mark the target unenrichable without failing anything larger.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP statuses worth another attempt. Every other 4xx/5xx is permanent.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Outcome of a single attempt.
#[derive(Debug, PartialEq)]
pub enum Attempt<T> {
    Success(T),
    Retryable { retry_after: Option<Duration> },
    Permanent,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on any single backoff, retry-after hints included.
    pub max_delay: Duration,
}

pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before attempt `attempt + 1`, given the failure of `attempt`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(self.base_delay)
            .checked_mul(attempt)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or runs out of
    /// attempts. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Option<T>, Cancelled>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                outcome = op(attempt) => outcome,
            };
            let retry_after = match outcome {
                Attempt::Success(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return Ok(Some(value));
                }
                Attempt::Permanent => {
                    debug!("{} failed permanently on attempt {}", label, attempt);
                    return Ok(None);
                }
                Attempt::Retryable { retry_after } => retry_after,
            };
            if attempt == self.max_attempts {
                break;
            }
            let delay = self.delay_for(attempt, retry_after);
            warn!(
                "{} failed on attempt {}/{}; retrying in {:?}",
                label, attempt, self.max_attempts, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        warn!("{} gave up after {} attempts", label, self.max_attempts);
        Ok(None)
    }
}
