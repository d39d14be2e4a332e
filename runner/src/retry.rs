//! Bounded exponential-backoff retry around one unit of work.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::classifier::classify;
use crate::core::retry_policy::RetryPolicy;
use crate::error::RunnerError;

/// Retries failed attempts according to a [`RetryPolicy`].
///
/// Retryability comes from [`classify`]; a non-retryable failure ends the
/// loop at once and is returned unchanged.
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

    /// Run `op` up to `max_retries + 1` times.
    ///
    /// `op` receives the 1-based attempt number. Backoff sleeps happen only
    /// between attempts and end early with [`RunnerError::Cancelled`] when
    /// `token` fires. Exhaustion yields [`RunnerError::MaxRetriesExceeded`]
    /// wrapping the last failure.
    pub async fn execute<T, F, Fut>(
        &self,
        token: &CancellationToken,
        mut op: F,
    ) -> Result<T, RunnerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RunnerError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                let delay = self.policy.calculate_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(RunnerError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let classified = classify(&err);
            if !classified.retryable() {
                debug!(attempt, code = %classified.code(), "failure is not retryable");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, code = %classified.code(), err = %err, "retries exhausted");
                return Err(RunnerError::MaxRetriesExceeded {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            warn!(attempt, max_attempts, code = %classified.code(), err = %err, "attempt failed; retrying");
            attempt += 1;
        }
    }
}
