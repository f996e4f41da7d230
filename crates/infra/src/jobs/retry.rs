//! Bounded retries with exponential backoff.

use std::future::Future;

use tracing::{error, warn};

use super::types::{JobError, RetryPolicy};

/// Runs one unit of work until it succeeds, fails fatally or runs out of
/// attempts.
///
/// The task is invoked once per attempt, so it must be safe to repeat.
#[derive(Debug, Clone, Default)]
pub struct RetryRunner {
    policy: RetryPolicy,
}

impl RetryRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `task`.
    ///
    /// - success is returned as-is
    /// - an [`JobError::Internal`] failure stops at once and is reported as
    ///   [`JobError::ExhaustedRetries`]
    /// - any other non-retryable error propagates immediately, unchanged
    /// - a retryable error waits `delay_for_attempt(n)` and tries again;
    ///   after the last attempt it becomes [`JobError::ExhaustedRetries`]
    pub async fn run<T, F, Fut>(&self, mut task: F) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match task().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                error!(attempt, error = %err, "job failed (not retryable)");
                return Err(match err {
                    JobError::Internal(_) => JobError::ExhaustedRetries {
                        attempts: attempt,
                        last: Box::new(err),
                    },
                    other => other,
                });
            }

            if !self.policy.should_retry(attempt) {
                error!(attempts = attempt, error = %err, "job failed, retries exhausted");
                return Err(JobError::ExhaustedRetries {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "job attempt failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
