//! Retry policy and executor for storage operations.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CoordError;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempt budget (the first try included). Zero behaves as one.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Growth factor per attempt.
    pub exponential_base: f64,

    /// Fraction (0.0..=1.0) of each delay that may be randomly shaved off.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
            exponential_base: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (0-based).
    ///
    /// delay = min(max_delay, base_delay * exponential_base^attempt)
    ///
    /// Example with base_delay=20ms, exponential_base=2.0:
    /// - attempt 0: 20ms
    /// - attempt 1: 40ms
    /// - attempt 2: 80ms
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - jitter * rand::random::<f64>()
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    fn budget(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Runs an operation until it succeeds, fails non-transiently, or the
/// attempt budget is spent.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `what` names the operation in logs.
    pub async fn execute<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, CoordError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        let budget = self.policy.budget();
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= budget {
                        warn!(operation = what, attempts = attempt, error = %err, "retries exhausted");
                        return Err(CoordError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }
                    let delay = self.policy.next_delay(attempt - 1);
                    debug!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
