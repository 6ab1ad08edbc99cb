//! Job service client for the RunPod serverless HTTP API.
//!
//! Endpoints used (relative to `{base_url}/{endpoint_id}`):
//! - `POST /run` with `{"input": {...}}` → `{"id", "status"}`
//! - `GET /status/{id}` → `{"status", "output"?}`
//! - `POST /cancel/{id}` → `{"id", "status"}`
//!
//! The worker publishes its connection details through a progress update, so
//! a job is considered ready when it is `IN_PROGRESS` and its output carries a
//! `connection` object.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use ember_core::errors::JobServiceError;
use ember_core::ids::JobId;
use ember_core::jobs::{ConnectionInfo, JobRequest, JobService, JobSnapshot, JobStatus};

pub const DEFAULT_BASE_URL: &str = "https://api.runpod.ai/v2";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct RunpodConfig {
    pub base_url: String,
    pub endpoint_id: String,
    pub api_key: SecretString,
    /// Whole-request timeout for submit/status/cancel calls.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl RunpodConfig {
    pub fn new(endpoint_id: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint_id: endpoint_id.into(),
            api_key,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

pub struct RunpodJobService {
    client: Client,
    endpoint_url: String,
    api_key: SecretString,
    request_timeout: Duration,
}

#[derive(Deserialize)]
struct RunResponse {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    output: Option<Value>,
}

#[derive(Deserialize)]
struct CancelResponse {
    #[serde(default)]
    status: Option<String>,
}

impl RunpodJobService {
    pub fn new(config: RunpodConfig) -> Result<Self, JobServiceError> {
        if config.endpoint_id.trim().is_empty() {
            return Err(JobServiceError::InvalidRequest(
                "endpoint id is not configured".into(),
            ));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| JobServiceError::NetworkError(format!("build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint_url: format!(
                "{}/{}",
                config.base_url.trim_end_matches('/'),
                config.endpoint_id
            ),
            api_key: config.api_key,
            request_timeout: config.request_timeout,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> JobServiceError {
        if e.is_timeout() {
            JobServiceError::Timeout(self.request_timeout)
        } else {
            JobServiceError::NetworkError(e.to_string())
        }
    }

    async fn error_from_response(resp: reqwest::Response) -> JobServiceError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        JobServiceError::from_status(status, body)
    }
}

/// Translate a RunPod status string and output into a snapshot.
pub(crate) fn snapshot_from_wire(
    status: &str,
    output: Option<&Value>,
) -> Result<JobSnapshot, JobServiceError> {
    let snapshot = match status {
        "IN_QUEUE" => JobSnapshot::queued(),
        "IN_PROGRESS" => match output.and_then(find_connection) {
            Some(connection) => JobSnapshot::ready(connection),
            None => JobSnapshot::running(),
        },
        "COMPLETED" => JobSnapshot::with_status(JobStatus::Completed),
        "FAILED" | "TIMED_OUT" => JobSnapshot::with_status(JobStatus::Failed),
        "CANCELLED" => JobSnapshot::with_status(JobStatus::Cancelled),
        other => {
            return Err(JobServiceError::InvalidResponse(format!(
                "unknown job status {other:?}"
            )))
        }
    };
    Ok(snapshot)
}

/// Find the worker's connection details in a job output.
///
/// Output is either a single progress payload or a list of them (aggregated
/// stream); the most recent payload carrying a `connection` wins.
fn find_connection(output: &Value) -> Option<ConnectionInfo> {
    match output {
        Value::Array(items) => items.iter().rev().find_map(find_connection),
        Value::Object(map) => {
            let raw = map.get("connection")?;
            match serde_json::from_value::<ConnectionInfo>(raw.clone()) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(error = %e, "ignoring malformed connection payload");
                    None
                }
            }
        }
        _ => None,
    }
}

#[async_trait]
impl JobService for RunpodJobService {
    fn name(&self) -> &str {
        "runpod"
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    async fn submit(&self, request: &JobRequest) -> Result<JobId, JobServiceError> {
        let resp = self
            .client
            .post(format!("{}/run", self.endpoint_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({ "input": request }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let body: RunResponse = resp
            .json()
            .await
            .map_err(|e| JobServiceError::InvalidResponse(format!("run response: {e}")))?;

        if body.id.trim().is_empty() {
            return Err(JobServiceError::InvalidResponse("empty job id".into()));
        }

        debug!(job_id = %body.id, "job submitted");
        Ok(JobId::from_raw(body.id))
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn status(&self, job_id: &JobId) -> Result<JobSnapshot, JobServiceError> {
        let resp = self
            .client
            .get(format!("{}/status/{}", self.endpoint_url, job_id))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| JobServiceError::InvalidResponse(format!("status response: {e}")))?;

        snapshot_from_wire(&body.status, body.output.as_ref())
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn cancel(&self, job_id: &JobId) -> Result<bool, JobServiceError> {
        let resp = self
            .client
            .post(format!("{}/cancel/{}", self.endpoint_url, job_id))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match resp.status() {
            // Job already purged; nothing left to cancel.
            StatusCode::NOT_FOUND => Ok(true),
            status if status.is_success() => {
                let body: CancelResponse = resp.json().await.unwrap_or(CancelResponse { status: None });
                // Still running after a cancel request means the service refused it.
                let acknowledged = !matches!(
                    body.status.as_deref(),
                    Some("IN_QUEUE" | "IN_PROGRESS")
                );
                Ok(acknowledged)
            }
            _ => Err(Self::error_from_response(resp).await),
        }
    }
}
