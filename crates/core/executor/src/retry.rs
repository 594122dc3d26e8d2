//! Retry policy for service calls.

use std::{future::Future, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use monitoring::logging;

use crate::error::ServiceError;

/// Bounded exponential backoff applied to transient failures, plus a per-call timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included. Must be at least 1.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound of the backoff delay.
    pub max_delay: Duration,
    /// Timeout of a single attempt. An attempt that times out is a transient failure.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            call_timeout,
            ..Default::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_jitter()
    }

    /// Runs `call` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Each attempt is bounded by [`call_timeout`](Self::call_timeout). `context` describes the
    /// call in logs and timeout errors.
    pub async fn run<T, F, Fut>(&self, context: &str, mut call: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let timeout = self.call_timeout;
        (|| {
            let attempt = call();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::timeout(context, timeout)),
                }
            }
        })
        .retry(self.backoff())
        .when(ServiceError::is_transient)
        .notify(|err, dur| {
            tracing::warn!(
                call = %context,
                error = %err, error_source = logging::error_source(err),
                "Transient error. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn run_retries_transient_errors_until_success() {
        //* Given
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = fast_policy(5);

        //* When
        let result = policy
            .run("flaky call", || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(ServiceError::transient("flaky call", "503 Slow Down"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        //* Then
        assert_eq!(result.expect("call should succeed"), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        //* Given
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = fast_policy(4);

        //* When
        let result: Result<(), _> = policy
            .run("always throttled", || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::transient("always throttled", "429"))
                }
            })
            .await;

        //* Then
        assert!(result.expect_err("call should fail").is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn run_does_not_retry_permanent_errors() {
        //* Given
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = fast_policy(5);

        //* When
        let result: Result<(), _> = policy
            .run("denied", || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::permanent("denied", "Access Denied"))
                }
            })
            .await;

        //* Then
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_slow_attempts_as_transient() {
        //* Given
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(50),
            ..fast_policy(2)
        };

        //* When
        let result: Result<(), _> = policy
            .run("slow call", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        //* Then
        let err = result.expect_err("call should time out");
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
    }
}
