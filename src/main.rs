//! # ember
//!
//! Command-line front end for the session orchestrator: start, wait for,
//! pre-warm and end per-session GPU workers.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use ember_core::{JobRequest, SessionId};
use ember_jobs::{RetryConfig, RetryingJobService, RunpodConfig, RunpodJobService};
use ember_orchestrator::{OrchestratorConfig, SessionOrchestrator};
use ember_settings::EmberSettings;
use ember_store::{Database, SessionStore, SqliteSessionStore};
use ember_telemetry::{LogQuery, TelemetryConfig, TelemetryGuard};

/// Ephemeral GPU worker sessions.
#[derive(Parser, Debug)]
#[command(name = "ember", version, about = "Ephemeral GPU worker sessions")]
struct Cli {
    /// Settings file (defaults to `~/.ember/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a worker job for a session.
    Start {
        /// Session id (generated when omitted).
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        voice_prompt: Option<String>,
        #[arg(long)]
        text_prompt: Option<String>,
        /// Wait for the worker endpoint after submitting.
        #[arg(long)]
        wait: bool,
        /// Readiness timeout (defaults to `orchestrator.readyTimeoutMs`).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Wait until a session's worker publishes its endpoint.
    Await {
        #[arg(long)]
        session: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Cancel a session's worker job.
    End {
        #[arg(long)]
        session: String,
    },
    /// Start a worker ahead of a scheduled session and stay until it fires.
    Prewarm {
        #[arg(long)]
        session: String,
        /// Scheduled session start (RFC 3339).
        #[arg(long)]
        at: DateTime<Utc>,
        /// Lead time (defaults to `orchestrator.prewarmLeadMs`).
        #[arg(long)]
        lead_secs: Option<u64>,
        /// Also wait for the worker endpoint once started.
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List recorded session → job mappings.
    Sessions,
    /// Show jobs whose cancellation was never confirmed.
    ReconcileLog {
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => ember_settings::load_settings_from_path(path),
        None => ember_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let telemetry = ember_telemetry::init_telemetry(
        TelemetryConfig {
            json: settings.logging.json,
            log_to_sqlite: settings.logging.persist_warnings,
            log_db_path: settings.logging.db_path.clone(),
            ..TelemetryConfig::default()
        }
        .with_level_name(&settings.logging.level),
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let ready_timeout = |secs: Option<u64>| {
        secs.map(Duration::from_secs)
            .unwrap_or_else(|| settings.orchestrator.ready_timeout())
    };

    match cli.command {
        Command::Start {
            session,
            voice_prompt,
            text_prompt,
            wait,
            timeout_secs,
        } => {
            let orchestrator = build_orchestrator(&settings)?;
            let session_id = session.map(SessionId::from_raw).unwrap_or_default();
            let mut request = JobRequest::new(session_id.clone());
            request.voice_prompt = voice_prompt;
            request.text_prompt = text_prompt;

            let session = orchestrator.start_session_with(request, None).await?;
            print_json(&session)?;
            if wait {
                let connection = orchestrator
                    .await_ready(&session_id, ready_timeout(timeout_secs), &cancel)
                    .await?;
                print_json(&connection)?;
            }
        }
        Command::Await {
            session,
            timeout_secs,
        } => {
            let orchestrator = build_orchestrator(&settings)?;
            let connection = orchestrator
                .await_ready(
                    &SessionId::from_raw(session),
                    ready_timeout(timeout_secs),
                    &cancel,
                )
                .await?;
            print_json(&connection)?;
        }
        Command::End { session } => {
            let orchestrator = build_orchestrator(&settings)?;
            let session_id = SessionId::from_raw(session);
            match orchestrator.end_session(&session_id).await? {
                Some(job_id) => println!("cancelled job {job_id} for session {session_id}"),
                None => println!("no job recorded for session {session_id}"),
            }
        }
        Command::Prewarm {
            session,
            at,
            lead_secs,
            wait,
            timeout_secs,
        } => {
            let orchestrator = build_orchestrator(&settings)?;
            let session_id = SessionId::from_raw(session);
            let lead = lead_secs.map(Duration::from_secs);
            let Some(info) = orchestrator.pre_warm(session_id.clone(), at, lead)? else {
                println!("session {session_id} is already active");
                return Ok(());
            };
            print_json(&info)?;

            wait_for_prewarm(&orchestrator, &session_id, &cancel).await?;
            if let Some(session) = orchestrator.session(&session_id) {
                print_json(&session)?;
            }
            if wait {
                let connection = orchestrator
                    .await_ready(&session_id, ready_timeout(timeout_secs), &cancel)
                    .await?;
                print_json(&connection)?;
            }
        }
        Command::Sessions => {
            let store = open_store(&settings)?;
            for entry in store.list().await? {
                println!(
                    "{}\t{}\t{}",
                    entry.session_id,
                    entry.job_id,
                    entry.created_at.to_rfc3339()
                );
            }
        }
        Command::ReconcileLog { limit } => print_reconcile_log(&telemetry, limit)?,
    }

    Ok(())
}

fn build_orchestrator(settings: &EmberSettings) -> Result<SessionOrchestrator> {
    let job_settings = &settings.job_service;
    let api_key = std::env::var(&job_settings.api_key_env)
        .with_context(|| format!("{} is not set", job_settings.api_key_env))?;

    let runpod_config = RunpodConfig {
        request_timeout: job_settings.request_timeout(),
        connect_timeout: job_settings.connect_timeout(),
        ..RunpodConfig::new(job_settings.endpoint_id.clone(), SecretString::from(api_key))
            .with_base_url(job_settings.base_url.clone())
    };
    let runpod =
        RunpodJobService::new(runpod_config).context("failed to create job service client")?;
    let jobs = RetryingJobService::new(
        runpod,
        RetryConfig {
            max_retries: job_settings.max_retries,
            retry_delay: job_settings.retry_delay(),
        },
    );

    let orch_settings = &settings.orchestrator;
    let mut config = OrchestratorConfig::default()
        .with_poll_interval(orch_settings.poll_interval())
        .with_default_lead(orch_settings.prewarm_lead());
    if orch_settings.probe_endpoint {
        config = config.with_endpoint_probe(orch_settings.probe_timeout());
    }

    let store = open_store(settings)?;
    Ok(SessionOrchestrator::new(
        Arc::new(jobs),
        Arc::new(store),
        config,
    ))
}

fn open_store(settings: &EmberSettings) -> Result<SqliteSessionStore> {
    let db = Database::open(&settings.store.path).with_context(|| {
        format!(
            "failed to open session store at {}",
            settings.store.path.display()
        )
    })?;
    Ok(SqliteSessionStore::new(db))
}

/// Block until the pre-warm timer has started the worker.
async fn wait_for_prewarm(
    orchestrator: &SessionOrchestrator,
    session_id: &SessionId,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let pending = orchestrator
            .pending_prewarms()
            .iter()
            .any(|p| &p.session_id == session_id);
        if !pending {
            if orchestrator.session(session_id).is_some() {
                return Ok(());
            }
            bail!("pre-warm for {session_id} did not start a worker, see logs");
        }
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = orchestrator.shutdown();
                bail!("pre-warm for {session_id} abandoned");
            }
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

fn print_reconcile_log(telemetry: &TelemetryGuard, limit: u32) -> Result<()> {
    let Some(logs) = telemetry.logs() else {
        bail!("warning persistence is disabled (logging.persistWarnings)");
    };
    let records = logs
        .query(&LogQuery {
            reconcile_only: true,
            limit: Some(limit),
            ..Default::default()
        })
        .context("failed to query log database")?;
    for record in records {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ctrl-C only aborts the current wait; jobs are left as they are.
fn cancel_on_ctrl_c(token: CancellationToken) {
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, aborting wait");
            token.cancel();
        }
    });
}
