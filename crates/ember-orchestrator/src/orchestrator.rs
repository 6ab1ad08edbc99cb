//! Session orchestrator: one ephemeral worker job per voice session.
//!
//! `SessionOrchestrator` submits a worker job when a session starts, polls the
//! job until the worker publishes a usable endpoint, optionally pre-warms a
//! worker ahead of a scheduled session, and cancels the job when the session
//! ends so billing stops.
//!
//! Operations on the same session id are serialized by a per-session async
//! mutex. The mutex is never held while waiting between status polls, so an
//! `end_session` can always interrupt a readiness wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use ember_core::ids::{JobId, SessionId};
use ember_core::jobs::{ConnectionInfo, JobRequest, JobService};
use ember_core::session::{Session, SessionState};
use ember_store::SessionStore;

use crate::config::OrchestratorConfig;
use crate::error::{CancellationError, OrchestratorError, Result};
use crate::poll::{PollOutcome, Poller};
use crate::prewarm::{fire_time, PendingPrewarm, PrewarmInfo, PrewarmTimers};

/// Cancellation is attempted once more after a rejection or failure.
const CANCEL_ATTEMPTS: u32 = 2;

struct TrackedSession {
    session: Session,
    /// Fired by `end_session` to stop in-flight readiness waits.
    poll_cancel: CancellationToken,
}

/// Lifecycle manager for per-session workers. Cheap to clone.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: Arc<dyn JobService>,
    store: Arc<dyn SessionStore>,
    config: OrchestratorConfig,
    sessions: DashMap<SessionId, TrackedSession>,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    prewarms: PrewarmTimers,
    prewarm_generation: AtomicU64,
}

/// Held for the duration of a state-changing operation on one session.
struct SessionLock<'a> {
    locks: &'a DashMap<SessionId, Arc<Mutex<()>>>,
    session_id: SessionId,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        // One reference in the map, one in our guard. More means a waiter.
        let _ = self
            .locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

impl SessionOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobService>,
        store: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs,
                store,
                config,
                sessions: DashMap::new(),
                locks: DashMap::new(),
                prewarms: PrewarmTimers::default(),
                prewarm_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Submit a worker job for a new session and return it in `starting`
    /// state without waiting for readiness.
    pub async fn start_session(
        &self,
        session_id: SessionId,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Session> {
        self.start_session_with(JobRequest::new(session_id), scheduled_time)
            .await
    }

    /// Like [`start_session`](Self::start_session) with voice/text prompts
    /// forwarded to the worker.
    #[instrument(skip_all, fields(session_id = %request.session_id))]
    pub async fn start_session_with(
        &self,
        request: JobRequest,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Session> {
        validate(&request.session_id)?;
        let session_id = request.session_id.clone();
        let _lock = self.lock(&session_id).await;

        let session = self.start_locked(request, scheduled_time).await?;
        if self.inner.prewarms.cancel(&session_id) {
            debug!("started eagerly, pending pre-warm dropped");
        }
        Ok(session)
    }

    async fn start_locked(
        &self,
        request: JobRequest,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Session> {
        let session_id = request.session_id.clone();
        if self.inner.sessions.contains_key(&session_id) {
            return Err(OrchestratorError::SessionAlreadyActive(session_id));
        }
        if let Some(job_id) = self.inner.store.get(&session_id).await? {
            debug!(%job_id, "store already maps session to a job");
            return Err(OrchestratorError::SessionAlreadyActive(session_id));
        }

        let mut session = Session::new(session_id.clone(), scheduled_time);
        let job_id = match self.inner.jobs.submit(&request).await {
            Ok(job_id) => job_id,
            Err(source) => {
                warn!(error = %source, kind = source.error_kind(), "job submission failed");
                return Err(OrchestratorError::Submission { session_id, source });
            }
        };

        match self.inner.store.put_new(&session_id, &job_id).await {
            Ok(true) => {}
            Ok(false) => {
                // another process claimed the session while we were submitting
                warn!(%job_id, "session claimed elsewhere during submit, cancelling own job");
                self.discard_unrecorded_job(&job_id).await;
                return Err(OrchestratorError::SessionAlreadyActive(session_id));
            }
            Err(e) => {
                error!(%job_id, error = %e, "failed to record job, cancelling it");
                self.discard_unrecorded_job(&job_id).await;
                return Err(e.into());
            }
        }

        let started = session.mark_starting(job_id.clone());
        debug_assert!(started, "fresh session must accept its first job");
        self.inner.sessions.insert(
            session_id,
            TrackedSession {
                session: session.clone(),
                poll_cancel: CancellationToken::new(),
            },
        );
        info!(%job_id, service = self.inner.jobs.name(), "worker job submitted");
        Ok(session)
    }

    /// Cancel a job that no store entry points at.
    async fn discard_unrecorded_job(&self, job_id: &JobId) {
        if let Err(e) = self.cancel_job(job_id).await {
            error!(
                %job_id,
                reconcile = true,
                error = %e,
                "unrecorded job cancellation unconfirmed, worker may still be running"
            );
        }
    }

    /// Wait until the session's worker reports a usable endpoint.
    ///
    /// Status is checked right away, then every poll interval. A session the
    /// store knows about but this process does not track is adopted first.
    /// Calling this on a `ready` session re-checks the worker before handing
    /// the endpoint out again.
    ///
    /// Cancelling `cancel` abandons the wait and leaves both the job and the
    /// session as they were.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn await_ready(
        &self,
        session_id: &SessionId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConnectionInfo> {
        validate(session_id)?;
        let (job_id, poll_cancel) = {
            let _lock = self.lock(session_id).await;
            self.prepare_wait(session_id).await?
        };

        // Too far out to represent means no deadline at all.
        let deadline = Instant::now().checked_add(timeout);
        if deadline.is_none() {
            debug!(?timeout, "timeout beyond clock range, waiting without deadline");
        }
        let poller = Poller {
            jobs: &self.inner.jobs,
            job_id: &job_id,
            interval: self.inner.config.poll_interval,
            probe_timeout: self.inner.config.probe_timeout,
        };
        let outcome = poller.run(deadline, cancel, &poll_cancel).await;

        if let PollOutcome::Aborted = outcome {
            debug!(%job_id, "readiness wait aborted by caller");
            return Err(OrchestratorError::Aborted);
        }

        let _lock = self.lock(session_id).await;
        match outcome {
            PollOutcome::Ready(connection) => self.with_tracked(session_id, &job_id, |session| {
                if !session.mark_ready(connection.clone()) {
                    return Err(OrchestratorError::InvalidState {
                        session_id: session_id.clone(),
                        state: session.state,
                    });
                }
                info!(%job_id, endpoint = %connection.endpoint(), "worker ready");
                Ok(connection)
            }),
            PollOutcome::Terminal(status) => self.with_tracked(session_id, &job_id, |session| {
                let _ = session.mark_failed();
                warn!(%job_id, %status, "worker stopped before it could serve the session");
                Err(OrchestratorError::WorkerFailed {
                    session_id: session_id.clone(),
                    job_id: job_id.clone(),
                    status,
                })
            }),
            PollOutcome::TimedOut => self.with_tracked(session_id, &job_id, |session| {
                let _ = session.mark_timed_out();
                warn!(%job_id, ?timeout, "worker not ready before timeout");
                Err(OrchestratorError::ReadyTimeout {
                    session_id: session_id.clone(),
                    timeout,
                })
            }),
            PollOutcome::StatusFailed(source) => {
                warn!(%job_id, error = %source, "status query failed");
                Err(OrchestratorError::StatusQuery { job_id, source })
            }
            PollOutcome::Ended => Err(OrchestratorError::SessionEnded(session_id.clone())),
            PollOutcome::Aborted => Err(OrchestratorError::Aborted),
        }
    }

    /// Resolve the job to wait on. Caller holds the session lock.
    async fn prepare_wait(&self, session_id: &SessionId) -> Result<(JobId, CancellationToken)> {
        if let Some(tracked) = self.inner.sessions.get(session_id) {
            return match (tracked.session.state, &tracked.session.job_id) {
                (SessionState::Starting | SessionState::Ready, Some(job_id)) => {
                    Ok((job_id.clone(), tracked.poll_cancel.clone()))
                }
                (SessionState::Failed, Some(job_id)) if tracked.session.can_extend_wait() => {
                    debug!(%job_id, "extending wait after earlier timeout");
                    Ok((job_id.clone(), tracked.poll_cancel.clone()))
                }
                (state, _) => Err(OrchestratorError::InvalidState {
                    session_id: session_id.clone(),
                    state,
                }),
            };
        }

        let Some(job_id) = self.inner.store.get(session_id).await? else {
            return Err(OrchestratorError::SessionNotFound(session_id.clone()));
        };
        info!(%job_id, "adopting session started elsewhere");
        let poll_cancel = CancellationToken::new();
        self.inner.sessions.insert(
            session_id.clone(),
            TrackedSession {
                session: Session::adopted(session_id.clone(), job_id.clone()),
                poll_cancel: poll_cancel.clone(),
            },
        );
        Ok((job_id, poll_cancel))
    }

    /// Run `f` on the tracked session if it still belongs to `job_id`.
    fn with_tracked<T>(
        &self,
        session_id: &SessionId,
        job_id: &JobId,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        match self.inner.sessions.get_mut(session_id) {
            Some(mut tracked) if tracked.session.job_id.as_ref() == Some(job_id) => {
                f(&mut tracked.session)
            }
            _ => Err(OrchestratorError::SessionEnded(session_id.clone())),
        }
    }

    /// Start the session's worker `lead` before `scheduled_time` (the
    /// configured default when `None`). A fire time already in the past
    /// starts it right away.
    ///
    /// Returns `None` when the session is already tracked. Scheduling again
    /// replaces the pending timer.
    pub fn pre_warm(
        &self,
        session_id: SessionId,
        scheduled_time: DateTime<Utc>,
        lead: Option<Duration>,
    ) -> Result<Option<PrewarmInfo>> {
        self.pre_warm_with(JobRequest::new(session_id), scheduled_time, lead)
    }

    pub fn pre_warm_with(
        &self,
        request: JobRequest,
        scheduled_time: DateTime<Utc>,
        lead: Option<Duration>,
    ) -> Result<Option<PrewarmInfo>> {
        validate(&request.session_id)?;
        let session_id = request.session_id.clone();
        if self.inner.sessions.contains_key(&session_id) {
            debug!(%session_id, "session already tracked, pre-warm skipped");
            return Ok(None);
        }

        let lead = lead.unwrap_or(self.inner.config.default_lead);
        let (fire_at, delay) = fire_time(scheduled_time, lead, Utc::now());
        let generation = self.inner.prewarm_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let info = PrewarmInfo {
            session_id: session_id.clone(),
            scheduled_time,
            fire_at,
        };
        self.inner.prewarms.register(PendingPrewarm {
            generation,
            cancel: cancel.clone(),
            info: info.clone(),
        });
        info!(%session_id, %fire_at, ?delay, "pre-warm scheduled");

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(session_id = %request.session_id, "pre-warm timer cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            this.fire_prewarm(request, scheduled_time, generation).await;
        });

        Ok(Some(info))
    }

    async fn fire_prewarm(&self, request: JobRequest, scheduled_time: DateTime<Utc>, generation: u64) {
        let session_id = request.session_id.clone();
        let _lock = self.lock(&session_id).await;
        if !self.inner.prewarms.is_current(&session_id, generation) {
            debug!(%session_id, "pre-warm superseded before firing");
            return;
        }

        // Stays listed as pending until the session is tracked.
        let started = self.start_locked(request, Some(scheduled_time)).await;
        let _ = self.inner.prewarms.claim(&session_id, generation);
        match started {
            Ok(session) => {
                info!(%session_id, job_id = ?session.job_id, "pre-warm started worker");
            }
            Err(OrchestratorError::SessionAlreadyActive(_)) => {
                debug!(%session_id, "session started elsewhere, pre-warm skipped");
            }
            Err(e) => {
                warn!(%session_id, error = %e, kind = e.error_kind(), "pre-warm failed to start worker");
            }
        }
    }

    /// Drop a pending pre-warm. Returns whether one existed.
    pub fn cancel_prewarm(&self, session_id: &SessionId) -> bool {
        self.inner.prewarms.cancel(session_id)
    }

    pub fn pending_prewarms(&self) -> Vec<PrewarmInfo> {
        self.inner.prewarms.list()
    }

    /// End a session: stop its timers and waits, cancel its job, forget it.
    ///
    /// Returns the cancelled job, or `None` when the store had no job for the
    /// session. When cancellation cannot be confirmed the store entry is kept
    /// so a later call retries, and `CancelFailed` is returned. The session is
    /// untracked either way.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn end_session(&self, session_id: &SessionId) -> Result<Option<JobId>> {
        validate(session_id)?;
        if self.inner.prewarms.cancel(session_id) {
            debug!("pending pre-warm cancelled");
        }
        if let Some(tracked) = self.inner.sessions.get(session_id) {
            tracked.poll_cancel.cancel();
        }

        let _lock = self.lock(session_id).await;
        let tracked_job = self.inner.sessions.remove(session_id).and_then(|(_, mut tracked)| {
            tracked.poll_cancel.cancel();
            let _ = tracked.session.transition(SessionState::Ended);
            tracked.session.job_id
        });

        let job_id = match self.inner.store.get(session_id).await {
            Ok(Some(job_id)) => job_id,
            Ok(None) => {
                debug!("no job recorded, nothing to cancel");
                return Ok(None);
            }
            Err(e) => match tracked_job {
                Some(job_id) => {
                    warn!(%job_id, error = %e, "store lookup failed, cancelling tracked job");
                    job_id
                }
                None => return Err(e.into()),
            },
        };

        match self.cancel_job(&job_id).await {
            Ok(()) => {
                if let Err(e) = self.inner.store.delete(session_id).await {
                    warn!(%job_id, error = %e, "job cancelled but store entry not removed");
                }
                info!(%job_id, "session ended, worker cancelled");
                Ok(Some(job_id))
            }
            Err(source) => {
                error!(
                    %job_id,
                    reconcile = true,
                    error = %source,
                    "job cancellation unconfirmed, worker may still be running"
                );
                Err(OrchestratorError::CancelFailed {
                    session_id: session_id.clone(),
                    job_id,
                    source,
                })
            }
        }
    }

    async fn cancel_job(&self, job_id: &JobId) -> std::result::Result<(), CancellationError> {
        let mut last_error = CancellationError::Rejected;
        for attempt in 1..=CANCEL_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(self.inner.config.cancel_retry_delay).await;
            }
            match self.inner.jobs.cancel(job_id).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    warn!(%job_id, attempt, "cancellation not acknowledged");
                    last_error = CancellationError::Rejected;
                }
                Err(e) => {
                    warn!(%job_id, attempt, error = %e, "cancellation request failed");
                    last_error = e.into();
                }
            }
        }
        Err(last_error)
    }

    /// Snapshot of a tracked session.
    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.inner
            .sessions
            .get(session_id)
            .map(|tracked| tracked.session.clone())
    }

    /// All tracked sessions, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .map(|tracked| tracked.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Track every stored session this process does not know about, in
    /// `starting` state. Used after a restart. Returns how many were adopted.
    pub async fn recover(&self) -> Result<usize> {
        let entries = self.inner.store.list().await?;
        let mut adopted = 0;
        for entry in entries {
            let _lock = self.lock(&entry.session_id).await;
            if self.inner.sessions.contains_key(&entry.session_id) {
                continue;
            }
            let mut session = Session::adopted(entry.session_id.clone(), entry.job_id);
            session.created_at = entry.created_at;
            self.inner.sessions.insert(
                entry.session_id,
                TrackedSession {
                    session,
                    poll_cancel: CancellationToken::new(),
                },
            );
            adopted += 1;
        }
        info!(adopted, "recovered sessions from store");
        Ok(adopted)
    }

    /// Cancel every pre-warm timer and readiness wait. Jobs are left running
    /// and the store untouched. Returns how many timers and waits were
    /// stopped.
    pub fn shutdown(&self) -> usize {
        let timers = self.inner.prewarms.cancel_all();
        let mut waits = 0;
        for tracked in self.inner.sessions.iter() {
            if !tracked.poll_cancel.is_cancelled() {
                tracked.poll_cancel.cancel();
                waits += 1;
            }
        }
        info!(timers, waits, "orchestrator shut down");
        timers + waits
    }

    async fn lock(&self, session_id: &SessionId) -> SessionLock<'_> {
        let lock = self
            .inner
            .locks
            .entry(session_id.clone())
            .or_default()
            .clone();
        SessionLock {
            locks: &self.inner.locks,
            session_id: session_id.clone(),
            _guard: lock.lock_owned().await,
        }
    }
}

fn validate(session_id: &SessionId) -> Result<()> {
    if session_id.is_blank() {
        return Err(OrchestratorError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}
