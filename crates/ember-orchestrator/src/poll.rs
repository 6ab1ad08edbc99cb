//! Readiness polling for a single job.

use std::sync::Arc;
use std::time::Duration;

use ember_core::errors::JobServiceError;
use ember_core::ids::JobId;
use ember_core::jobs::{ConnectionInfo, JobService, JobStatus};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::probe::probe_endpoint;

/// How a readiness wait ended.
#[derive(Debug)]
pub(crate) enum PollOutcome {
    Ready(ConnectionInfo),
    /// The job reached a terminal status without becoming ready.
    Terminal(JobStatus),
    TimedOut,
    /// The caller's token fired.
    Aborted,
    /// The session's own token fired (the session was ended).
    Ended,
    StatusFailed(JobServiceError),
}

pub(crate) struct Poller<'a> {
    pub jobs: &'a Arc<dyn JobService>,
    pub job_id: &'a JobId,
    pub interval: Duration,
    pub probe_timeout: Option<Duration>,
}

impl Poller<'_> {
    /// Check status immediately, then every `interval`, until the job is
    /// ready or terminal, the deadline (if any) passes, or either token fires.
    ///
    /// Retryable status errors are logged and polling continues. Every await
    /// (including the status call itself) races the deadline and both tokens.
    pub async fn run(
        &self,
        deadline: Option<Instant>,
        caller: &CancellationToken,
        session: &CancellationToken,
    ) -> PollOutcome {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let checked = tokio::select! {
                biased;
                () = caller.cancelled() => return PollOutcome::Aborted,
                () = session.cancelled() => return PollOutcome::Ended,
                () = deadline_passed(deadline) => return PollOutcome::TimedOut,
                checked = self.check_once() => checked,
            };

            match checked {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!(job_id = %self.job_id, attempt, error = %e, "status check failed, will retry");
                }
                Err(e) => return PollOutcome::StatusFailed(e),
            }

            tokio::select! {
                biased;
                () = caller.cancelled() => return PollOutcome::Aborted,
                () = session.cancelled() => return PollOutcome::Ended,
                () = deadline_passed(deadline) => return PollOutcome::TimedOut,
                () = time::sleep(self.interval) => {}
            }
        }
    }

    /// One status observation. `Ok(None)` means keep waiting.
    async fn check_once(&self) -> Result<Option<PollOutcome>, JobServiceError> {
        let snapshot = self.jobs.status(self.job_id).await?;
        debug!(job_id = %self.job_id, status = %snapshot.status, "job status");

        if snapshot.status.is_terminal() {
            return Ok(Some(PollOutcome::Terminal(snapshot.status)));
        }

        let Some(connection) = snapshot.ready_connection() else {
            return Ok(None);
        };

        if let Some(timeout) = self.probe_timeout {
            if !probe_endpoint(connection, timeout).await {
                debug!(job_id = %self.job_id, endpoint = %connection.endpoint(), "endpoint not accepting connections yet");
                return Ok(None);
            }
        }

        Ok(Some(PollOutcome::Ready(connection.clone())))
    }
}

async fn deadline_passed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::jobs::JobSnapshot;
    use ember_jobs::ScriptedJobService;

    fn poller<'a>(jobs: &'a Arc<dyn JobService>, job_id: &'a JobId) -> Poller<'a> {
        Poller {
            jobs,
            job_id,
            interval: Duration::from_secs(1),
            probe_timeout: None,
        }
    }

    fn deadline(secs: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn ready_with_empty_host_keeps_polling() {
        let mock = Arc::new(ScriptedJobService::new());
        let job = JobId::from_raw("j1");
        mock.script_status(
            &job,
            vec![
                Ok(JobSnapshot::ready(ConnectionInfo::new("", 0))),
                Ok(JobSnapshot::ready(ConnectionInfo::new("10.0.0.5", 8998))),
            ],
        );
        let jobs: Arc<dyn JobService> = mock.clone();

        let outcome = poller(&jobs, &job)
            .run(deadline(10), &CancellationToken::new(), &CancellationToken::new())
            .await;

        match outcome {
            PollOutcome::Ready(conn) => assert_eq!(conn.endpoint(), "10.0.0.5:8998"),
            other => panic!("expected ready, got {other:?}"),
        }
        assert_eq!(mock.status_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_do_not_end_the_wait() {
        let mock = Arc::new(ScriptedJobService::new());
        let job = JobId::from_raw("j1");
        mock.script_status(
            &job,
            vec![
                Err(JobServiceError::RateLimited),
                Ok(JobSnapshot::with_status(JobStatus::Failed)),
            ],
        );
        let jobs: Arc<dyn JobService> = mock.clone();

        let outcome = poller(&jobs, &job)
            .run(deadline(10), &CancellationToken::new(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, PollOutcome::Terminal(JobStatus::Failed)));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_status_error_ends_the_wait() {
        let mock = Arc::new(ScriptedJobService::new());
        let job = JobId::from_raw("j1");
        mock.script_status(
            &job,
            vec![Err(JobServiceError::AuthenticationFailed("bad key".into()))],
        );
        let jobs: Arc<dyn JobService> = mock.clone();

        let outcome = poller(&jobs, &job)
            .run(deadline(10), &CancellationToken::new(), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            PollOutcome::StatusFailed(JobServiceError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_token_aborts_before_any_check() {
        let mock = Arc::new(ScriptedJobService::new());
        let jobs: Arc<dyn JobService> = mock.clone();
        let job = JobId::from_raw("j1");
        let caller = CancellationToken::new();
        caller.cancel();

        let outcome = poller(&jobs, &job)
            .run(deadline(10), &caller, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, PollOutcome::Aborted));
        assert_eq!(mock.status_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_deadline_waits_until_ready() {
        let mock = Arc::new(ScriptedJobService::new());
        let job = JobId::from_raw("j1");
        let mut statuses: Vec<_> = (0..600).map(|_| Ok(JobSnapshot::queued())).collect();
        statuses.push(Ok(JobSnapshot::ready(ConnectionInfo::new("x", 1))));
        mock.script_status(&job, statuses);
        let jobs: Arc<dyn JobService> = mock.clone();

        let outcome = poller(&jobs, &job)
            .run(None, &CancellationToken::new(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, PollOutcome::Ready(_)));
        assert_eq!(mock.status_count(), 601);
    }

    #[tokio::test(start_paused = true)]
    async fn session_token_ends_wait() {
        let mock = Arc::new(ScriptedJobService::new());
        let jobs: Arc<dyn JobService> = mock.clone();
        let job = JobId::from_raw("j1");
        let session = CancellationToken::new();

        let ender = session.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(2500)).await;
            ender.cancel();
        });

        let outcome = poller(&jobs, &job)
            .run(deadline(60), &CancellationToken::new(), &session)
            .await;
        assert!(matches!(outcome, PollOutcome::Ended));
        assert_eq!(mock.status_count(), 3);
    }
}
