//! Job service contract: the serverless platform that runs one worker per
//! session.
//!
//! A job moves through `queued → running → ready` while the worker boots and
//! publishes its connection endpoint, and ends in one of the terminal states
//! (`completed`, `failed`, `cancelled`). Workers stay alive after becoming
//! ready until they are cancelled.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::JobServiceError;
use crate::ids::{JobId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Ready,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// The job will never become ready from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Ready => write!(f, "ready"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Where a ready worker can be reached.
///
/// Workers report `port` as a string (it comes from an environment variable on
/// their side), so both JSON numbers and numeric strings are accepted. Fields
/// this type does not model are kept in `extra`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: None,
            url: None,
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Non-empty host and a non-zero port.
    pub fn is_usable(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    /// `host:port`, suitable for a TCP connect.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u64),
        Text(String),
    }

    match RawPort::deserialize(deserializer)? {
        RawPort::Number(n) => u16::try_from(n)
            .map_err(|_| serde::de::Error::custom(format!("port out of range: {n}"))),
        RawPort::Text(s) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {s:?}"))),
    }
}

/// One observation of a job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub connection: Option<ConnectionInfo>,
}

impl JobSnapshot {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status,
            connection: None,
        }
    }

    pub fn queued() -> Self {
        Self::with_status(JobStatus::Queued)
    }

    pub fn running() -> Self {
        Self::with_status(JobStatus::Running)
    }

    pub fn ready(connection: ConnectionInfo) -> Self {
        Self {
            status: JobStatus::Ready,
            connection: Some(connection),
        }
    }

    /// Connection info, but only when the job reports `ready` with usable
    /// connection data. A `ready` status with an empty payload yields `None`.
    pub fn ready_connection(&self) -> Option<&ConnectionInfo> {
        if self.status != JobStatus::Ready {
            return None;
        }
        self.connection.as_ref().filter(|c| c.is_usable())
    }
}

/// Payload submitted to start a worker for a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub session_id: SessionId,
    /// Path to a voice conditioning file inside the worker image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_prompt: Option<String>,
    /// Persona text for the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_prompt: Option<String>,
}

impl JobRequest {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            voice_prompt: None,
            text_prompt: None,
        }
    }

    #[must_use]
    pub fn with_voice_prompt(mut self, voice_prompt: impl Into<String>) -> Self {
        self.voice_prompt = Some(voice_prompt.into());
        self
    }

    #[must_use]
    pub fn with_text_prompt(mut self, text_prompt: impl Into<String>) -> Self {
        self.text_prompt = Some(text_prompt.into());
        self
    }
}

/// The external platform that runs worker jobs.
#[async_trait]
pub trait JobService: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a new job. Returns the id assigned by the service.
    async fn submit(&self, request: &JobRequest) -> Result<JobId, JobServiceError>;

    /// Query job status. Idempotent, safe to retry.
    async fn status(&self, job_id: &JobId) -> Result<JobSnapshot, JobServiceError>;

    /// Request cancellation. `Ok(true)` means the service acknowledged it.
    /// Cancelling an already cancelled job must not error.
    async fn cancel(&self, job_id: &JobId) -> Result<bool, JobServiceError>;
}

#[async_trait]
impl<S: JobService + ?Sized> JobService for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobId, JobServiceError> {
        (**self).submit(request).await
    }

    async fn status(&self, job_id: &JobId) -> Result<JobSnapshot, JobServiceError> {
        (**self).status(job_id).await
    }

    async fn cancel(&self, job_id: &JobId) -> Result<bool, JobServiceError> {
        (**self).cancel(job_id).await
    }
}
