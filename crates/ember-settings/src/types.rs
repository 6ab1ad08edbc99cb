//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial JSON
//! files work: missing fields keep their compiled default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmberSettings {
    pub job_service: JobServiceSettings,
    pub orchestrator: OrchestratorSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

impl EmberSettings {
    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "orchestrator.pollIntervalMs must be greater than zero".into(),
            ));
        }
        if self.job_service.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "jobService.requestTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.job_service.base_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "jobService.baseUrl must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Where and how to reach the serverless job platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobServiceSettings {
    /// API root, without the endpoint id.
    pub base_url: String,
    /// Serverless endpoint that runs the speech worker image.
    pub endpoint_id: String,
    /// Name of the environment variable holding the API key. The key itself
    /// is never stored in the settings file.
    pub api_key_env: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Extra attempts for transient submit/status/cancel failures.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for JobServiceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.runpod.ai/v2".to_string(),
            endpoint_id: String::new(),
            api_key_env: "RUNPOD_API_KEY".to_string(),
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            max_retries: 1,
            retry_delay_ms: 250,
        }
    }
}

impl JobServiceSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    pub poll_interval_ms: u64,
    /// Default wait for a worker to publish its endpoint.
    pub ready_timeout_ms: u64,
    /// How long before a scheduled session the worker is started.
    pub prewarm_lead_ms: u64,
    /// Require a TCP connect to the reported endpoint before treating it as
    /// ready.
    pub probe_endpoint: bool,
    pub probe_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            ready_timeout_ms: 300_000,
            prewarm_lead_ms: 150_000,
            probe_endpoint: false,
            probe_timeout_ms: 1_000,
        }
    }
}

impl OrchestratorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn prewarm_lead(&self) -> Duration {
        Duration::from_millis(self.prewarm_lead_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite file holding the session → job mapping.
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: ember_dir().join("database").join("sessions.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// JSON lines on stdout instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events (reconciliation records included) to SQLite.
    pub persist_warnings: bool,
    pub db_path: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist_warnings: true,
            db_path: ember_dir().join("database").join("logs.db"),
        }
    }
}

/// `~/.ember`, falling back to `/tmp/.ember` without a home directory.
pub fn ember_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".ember")
}
