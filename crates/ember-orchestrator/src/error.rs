use std::time::Duration;

use ember_core::errors::JobServiceError;
use ember_core::ids::{JobId, SessionId};
use ember_core::jobs::JobStatus;
use ember_core::session::SessionState;
use ember_store::StoreError;

/// Why a job cancellation could not be confirmed.
#[derive(Debug, thiserror::Error)]
pub enum CancellationError {
    /// The service answered but did not acknowledge the cancellation.
    #[error("job service did not acknowledge cancellation")]
    Rejected,

    #[error(transparent)]
    Service(#[from] JobServiceError),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("session {0} already has an active worker")]
    SessionAlreadyActive(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {session_id} is {state}")]
    InvalidState {
        session_id: SessionId,
        state: SessionState,
    },

    #[error("job submission failed for session {session_id}: {source}")]
    Submission {
        session_id: SessionId,
        #[source]
        source: JobServiceError,
    },

    #[error("status query failed for job {job_id}: {source}")]
    StatusQuery {
        job_id: JobId,
        #[source]
        source: JobServiceError,
    },

    #[error("worker {job_id} for session {session_id} stopped with status {status}")]
    WorkerFailed {
        session_id: SessionId,
        job_id: JobId,
        status: JobStatus,
    },

    #[error("worker for session {session_id} not ready after {timeout:?}")]
    ReadyTimeout {
        session_id: SessionId,
        timeout: Duration,
    },

    #[error("cancellation of job {job_id} for session {session_id} unconfirmed: {source}")]
    CancelFailed {
        session_id: SessionId,
        job_id: JobId,
        #[source]
        source: CancellationError,
    },

    #[error("wait aborted")]
    Aborted,

    #[error("session {0} ended while waiting")]
    SessionEnded(SessionId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable machine-readable category.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::SessionAlreadyActive(_) => "session_already_active",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Submission { .. } => "submission",
            Self::StatusQuery { .. } => "status_query",
            Self::WorkerFailed { .. } => "worker_failed",
            Self::ReadyTimeout { .. } => "ready_timeout",
            Self::CancelFailed { .. } => "cancel_failed",
            Self::Aborted => "aborted",
            Self::SessionEnded(_) => "session_ended",
            Self::Store(_) => "store",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
