//! Orchestration of ephemeral per-session GPU workers.
//!
//! [`SessionOrchestrator`] drives each session through
//! `created → starting → (ready | failed) → ended` against a
//! [`JobService`](ember_core::JobService) and a
//! [`SessionStore`](ember_store::SessionStore).

pub mod config;
pub mod error;
pub mod orchestrator;
mod poll;
mod prewarm;
pub mod probe;

pub use config::OrchestratorConfig;
pub use error::{CancellationError, OrchestratorError, Result};
pub use orchestrator::SessionOrchestrator;
pub use prewarm::PrewarmInfo;
