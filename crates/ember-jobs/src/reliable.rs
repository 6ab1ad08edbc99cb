use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use ember_core::errors::JobServiceError;
use ember_core::ids::JobId;
use ember_core::jobs::{JobRequest, JobService, JobSnapshot};

/// Retry behavior for job service calls.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Extra attempts after the first one, for retryable errors only.
    pub max_retries: u32,
    /// Pause before each retry.
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Wraps a JobService and retries transient failures.
///
/// - Only errors classified retryable (network, timeout, 408/429/5xx) are
///   retried; fatal and malformed responses surface immediately.
/// - A cancel that the service answers with `Ok(false)` is returned as-is;
///   deciding whether to re-issue a rejected cancellation is the caller's job.
pub struct RetryingJobService<S: JobService> {
    inner: S,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<S: JobService> RetryingJobService<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: S) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, JobServiceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, JobServiceError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    self.total_retries.fetch_add(1, Ordering::Relaxed);

                    warn!(
                        operation,
                        service = self.inner.name(),
                        attempt,
                        max_retries = self.config.max_retries,
                        error_kind = e.error_kind(),
                        error = %e,
                        "retrying job service call"
                    );

                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl<S: JobService> JobService for RetryingJobService<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobId, JobServiceError> {
        self.with_retry("submit", || self.inner.submit(request)).await
    }

    async fn status(&self, job_id: &JobId) -> Result<JobSnapshot, JobServiceError> {
        self.with_retry("status", || self.inner.status(job_id)).await
    }

    async fn cancel(&self, job_id: &JobId) -> Result<bool, JobServiceError> {
        self.with_retry("cancel", || self.inner.cancel(job_id)).await
    }
}
