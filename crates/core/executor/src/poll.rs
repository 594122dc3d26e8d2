//! Polling of remote operations until they finish.

use std::{future::Future, time::Duration};

use backon::{BackoffBuilder as _, ExponentialBuilder};
use tokio::time::Instant;

use crate::{error::ServiceError, retry::RetryPolicy};

/// Backing-off interval between status checks of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before the second check.
    pub min_interval: Duration,
    /// Upper bound of the delay between checks.
    pub max_interval: Duration,
    /// Overall deadline. `None` waits until the operation finishes.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            timeout: None,
        }
    }
}

impl PollPolicy {
    fn intervals(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.min_interval)
            .with_max_delay(self.max_interval)
            .without_max_times()
            .build()
    }

    /// Calls `check` until it returns `Some`.
    ///
    /// Each check runs under `retry`, so transient failures of a single check do not end the
    /// wait.
    pub async fn poll<T, F, Fut>(
        &self,
        context: &str,
        retry: &RetryPolicy,
        mut check: F,
    ) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, ServiceError>>,
    {
        let started = Instant::now();
        let mut intervals = self.intervals();
        let mut checks = 0usize;
        loop {
            checks += 1;
            if let Some(done) = retry.run(context, &mut check).await? {
                tracing::debug!(call = %context, checks, "operation finished");
                return Ok(done);
            }
            let delay = intervals.next().unwrap_or(self.max_interval);
            if let Some(timeout) = self.timeout
                && started.elapsed() + delay > timeout
            {
                return Err(PollError::Timeout {
                    context: context.to_string(),
                    timeout,
                });
            }
            tracing::trace!(
                call = %context,
                checks,
                delay_ms = delay.as_millis() as u64,
                "operation pending"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Errors returned by [`PollPolicy::poll`].
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The operation did not finish before the deadline.
    #[error("{context} did not finish within {:.1}s", .timeout.as_secs_f32())]
    Timeout { context: String, timeout: Duration },

    /// A status check failed permanently or ran out of retries.
    #[error(transparent)]
    Service(#[from] ServiceError),
}
