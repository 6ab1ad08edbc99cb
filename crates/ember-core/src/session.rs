use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, SessionId};
use crate::jobs::ConnectionInfo;

/// Lifecycle of a session: `created → starting → (ready | failed) → ended`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Ready,
    Failed,
    Ended,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Created, Starting) => true,
            (Starting, Ready | Failed) => true,
            // re-checking a handed-out worker may find it dead
            (Ready, Failed) => true,
            // a timed-out wait may be extended; `Session` checks the cause
            (Failed, Ready | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session is `failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// No endpoint before the caller's deadline. The job was left running,
    /// so waiting again is allowed.
    ReadyTimeout,
    /// The job reached a terminal status.
    WorkerStopped,
}

/// An application-level voice session backed by at most one worker job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub job_id: Option<JobId>,
    pub state: SessionState,
    pub connection: Option<ConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: SessionId, scheduled_time: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            scheduled_time,
            job_id: None,
            state: SessionState::Created,
            connection: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A session whose job was submitted elsewhere (another process, or
    /// before a restart).
    pub fn adopted(session_id: SessionId, job_id: JobId) -> Self {
        let mut session = Self::new(session_id, None);
        session.job_id = Some(job_id);
        session.state = SessionState::Starting;
        session
    }

    /// Apply a state transition. Returns `false` (and leaves the session
    /// untouched) when the transition is not allowed.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn mark_starting(&mut self, job_id: JobId) -> bool {
        if !self.transition(SessionState::Starting) {
            return false;
        }
        self.job_id = Some(job_id);
        true
    }

    pub fn mark_ready(&mut self, connection: ConnectionInfo) -> bool {
        // connection info only ever follows a submitted job
        if self.job_id.is_none() {
            return false;
        }
        match self.state {
            SessionState::Ready => self.updated_at = Utc::now(),
            SessionState::Failed if !self.can_extend_wait() => return false,
            _ => {
                if !self.transition(SessionState::Ready) {
                    return false;
                }
            }
        }
        self.connection = Some(connection);
        self.failure = None;
        true
    }

    /// The worker is gone for good.
    pub fn mark_failed(&mut self) -> bool {
        self.fail(FailureCause::WorkerStopped)
    }

    /// The caller's deadline passed while the job was still coming up.
    pub fn mark_timed_out(&mut self) -> bool {
        self.fail(FailureCause::ReadyTimeout)
    }

    fn fail(&mut self, cause: FailureCause) -> bool {
        if self.state == SessionState::Failed && !self.can_extend_wait() {
            return false;
        }
        if !self.transition(SessionState::Failed) {
            return false;
        }
        self.connection = None;
        self.failure = Some(cause);
        true
    }

    /// Whether a readiness wait may run again on a failed session: only a
    /// timeout leaves the job alive.
    pub fn can_extend_wait(&self) -> bool {
        self.state == SessionState::Failed && self.failure == Some(FailureCause::ReadyTimeout)
    }

    pub fn is_ended(&self) -> bool {
        self.state == SessionState::Ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionId::from_raw("s1"), None)
    }

    #[test]
    fn new_session_is_created_without_job() {
        let s = session();
        assert_eq!(s.state, SessionState::Created);
        assert!(s.job_id.is_none());
        assert!(s.connection.is_none());
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = session();
        assert!(s.mark_starting(JobId::from_raw("j1")));
        assert_eq!(s.state, SessionState::Starting);
        assert!(s.mark_ready(ConnectionInfo::new("x", 1)));
        assert_eq!(s.state, SessionState::Ready);
        assert!(s.transition(SessionState::Ended));
        assert!(s.is_ended());
    }

    #[test]
    fn ended_is_absorbing() {
        let mut s = session();
        assert!(s.transition(SessionState::Ended));
        for next in [
            SessionState::Created,
            SessionState::Starting,
            SessionState::Ready,
            SessionState::Failed,
            SessionState::Ended,
        ] {
            assert!(!s.transition(next), "ended -> {next} must be rejected");
        }
    }

    #[test]
    fn ready_requires_job() {
        let mut s = session();
        assert!(!s.mark_ready(ConnectionInfo::new("x", 1)));
        assert!(s.connection.is_none());
    }

    #[test]
    fn cannot_skip_starting() {
        let mut s = session();
        assert!(!s.transition(SessionState::Ready));
        assert!(!s.mark_failed());
        assert_eq!(s.state, SessionState::Created);
    }

    #[test]
    fn failed_clears_connection() {
        let mut s = Session::adopted(SessionId::from_raw("s1"), JobId::from_raw("j1"));
        assert!(s.mark_ready(ConnectionInfo::new("x", 1)));
        assert!(s.mark_failed());
        assert_eq!(s.state, SessionState::Failed);
        assert!(s.connection.is_none());
    }

    #[test]
    fn timed_out_session_can_become_ready() {
        let mut s = Session::adopted(SessionId::from_raw("s1"), JobId::from_raw("j1"));
        assert!(s.mark_timed_out());
        assert_eq!(s.state, SessionState::Failed);
        assert_eq!(s.failure, Some(FailureCause::ReadyTimeout));
        assert!(s.can_extend_wait());

        // a second timeout keeps it extendable
        assert!(s.mark_timed_out());
        assert!(s.can_extend_wait());

        assert!(s.mark_ready(ConnectionInfo::new("x", 1)));
        assert_eq!(s.state, SessionState::Ready);
        assert_eq!(s.failure, None);
    }

    #[test]
    fn stopped_worker_is_final() {
        let mut s = Session::adopted(SessionId::from_raw("s1"), JobId::from_raw("j1"));
        assert!(s.mark_timed_out());
        assert!(s.mark_failed());
        assert_eq!(s.failure, Some(FailureCause::WorkerStopped));
        assert!(!s.can_extend_wait());

        assert!(!s.mark_ready(ConnectionInfo::new("x", 1)));
        assert!(!s.mark_timed_out());
        assert!(!s.mark_failed());
        assert_eq!(s.state, SessionState::Failed);
        assert!(s.connection.is_none());
    }

    #[test]
    fn refreshing_ready_connection() {
        let mut s = Session::adopted(SessionId::from_raw("s1"), JobId::from_raw("j1"));
        assert!(s.mark_ready(ConnectionInfo::new("x", 1)));
        assert!(s.mark_ready(ConnectionInfo::new("y", 2)));
        assert_eq!(s.connection.as_ref().map(|c| c.host.as_str()), Some("y"));
    }

    #[test]
    fn state_display() {
        assert_eq!(SessionState::Starting.to_string(), "starting");
        assert_eq!(SessionState::Ended.as_str(), "ended");
    }
}
