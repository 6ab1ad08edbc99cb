//! Session store: durable mapping from application session id to the job
//! that serves it.
//!
//! Two backends are provided: [`MemorySessionStore`] for tests and embedded
//! use, and [`SqliteSessionStore`] which survives process restarts.

pub mod database;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ember_core::ids::{JobId, SessionId};

/// One persisted `session_id → job_id` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionJob {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// Backend for the session → job mapping.
///
/// Implementations must be safe to call concurrently from many sessions.
/// Callers serialize access per session id; entries for different ids are
/// independent.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Job currently recorded for a session, if any.
    async fn get(&self, session_id: &SessionId) -> Result<Option<JobId>, StoreError>;

    /// Record (or replace) the job for a session.
    async fn put(&self, session_id: &SessionId, job_id: &JobId) -> Result<(), StoreError>;

    /// Record the job only if the session has no entry yet. Returns `false`
    /// and leaves the existing entry alone when another job already owns the
    /// session. Atomic with respect to other writers of the same store.
    async fn put_new(&self, session_id: &SessionId, job_id: &JobId) -> Result<bool, StoreError>;

    /// Remove the entry. Returns whether an entry existed.
    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    /// All entries, oldest first.
    async fn list(&self) -> Result<Vec<SessionJob>, StoreError>;
}
