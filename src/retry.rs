use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::OperatorError;

/// Retry settings carried explicitly on every task node.
///
/// A node gets `max_retries + 1` attempts in total. The wait before attempt
/// `n + 1` is `backoff * multiplier^(n - 1)`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(300),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// `max_retries` retries with a constant wait between attempts.
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            multiplier: 1.0,
            max_backoff: backoff.max(Duration::from_secs(3600)),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier > 0.0 { self.multiplier } else { 1.0 };
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff.as_secs_f64() * multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Result of driving an operation through its retry policy.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, OperatorError>,
    pub attempts: u32,
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            policy,
            attempt_timeout,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. Each attempt is bounded by the attempt
    /// timeout; an expired attempt counts as a failed one.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: CancellationToken,
        task_name: &str,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OperatorError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0;

        loop {
            if ctx.is_cancelled() {
                return RetryOutcome {
                    result: Err(OperatorError::Cancelled),
                    attempts,
                };
            }

            attempts += 1;
            let result = tokio::select! {
                _ = ctx.cancelled() => Err(OperatorError::Cancelled),
                res = timeout(self.attempt_timeout, operation(attempts)) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(OperatorError::Timeout(self.attempt_timeout)),
                },
            };

            let err = match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempts >= max_attempts {
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }

            let wait_time = self.policy.backoff_for(attempts);
            warn!(
                task = task_name,
                attempt = attempts,
                max_attempts,
                error = %err,
                ?wait_time,
                "attempt failed, retrying"
            );

            tokio::select! {
                _ = ctx.cancelled() => {
                    return RetryOutcome {
                        result: Err(OperatorError::Cancelled),
                        attempts,
                    };
                }
                _ = sleep(wait_time) => {
                    debug!(task = task_name, next_attempt = attempts + 1, "backoff elapsed");
                }
            }
        }
    }
}
