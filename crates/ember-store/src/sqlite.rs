use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use ember_core::ids::{JobId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::{SessionJob, SessionStore};

/// SQLite-backed session store. Mappings survive process restarts, so a
/// session started by one process can be awaited or ended by another.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("created_at {raw:?}: {e}")))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn get(&self, session_id: &SessionId) -> Result<Option<JobId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT job_id FROM session_jobs WHERE session_id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let job_id: String = row.get(0)?;
                    Ok(Some(JobId::from_raw(job_id)))
                }
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, job_id = %job_id))]
    async fn put(&self, session_id: &SessionId, job_id: &JobId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_jobs (session_id, job_id, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET job_id = excluded.job_id,
                                                       created_at = excluded.created_at",
                rusqlite::params![session_id.as_str(), job_id.as_str(), now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, job_id = %job_id))]
    async fn put_new(&self, session_id: &SessionId, job_id: &JobId) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            // The primary key decides between concurrent writers, including
            // other processes sharing the database file.
            let inserted = conn.execute(
                "INSERT INTO session_jobs (session_id, job_id, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO NOTHING",
                rusqlite::params![session_id.as_str(), job_id.as_str(), now],
            )?;
            Ok(inserted > 0)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM session_jobs WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    async fn list(&self) -> Result<Vec<SessionJob>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, job_id, created_at FROM session_jobs
                 ORDER BY created_at ASC, session_id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let session_id: String = row.get(0)?;
                let job_id: String = row.get(1)?;
                let created_at: String = row.get(2)?;
                results.push(SessionJob {
                    session_id: SessionId::from_raw(session_id),
                    job_id: JobId::from_raw(job_id),
                    created_at: parse_timestamp(&created_at)?,
                });
            }
            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteSessionStore {
        SqliteSessionStore::new(Database::in_memory().unwrap())
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = store();
        assert_eq!(store.get(&SessionId::from_raw("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = store();
        let sid = SessionId::from_raw("s1");
        store.put(&sid, &JobId::from_raw("j1")).await.unwrap();
        assert_eq!(store.get(&sid).await.unwrap(), Some(JobId::from_raw("j1")));
    }

    #[tokio::test]
    async fn put_upserts() {
        let store = store();
        let sid = SessionId::from_raw("s1");
        store.put(&sid, &JobId::from_raw("j1")).await.unwrap();
        store.put(&sid, &JobId::from_raw("j2")).await.unwrap();
        assert_eq!(store.get(&sid).await.unwrap(), Some(JobId::from_raw("j2")));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn put_new_refuses_owned_session() {
        let store = store();
        let sid = SessionId::from_raw("s1");
        assert!(store.put_new(&sid, &JobId::from_raw("j1")).await.unwrap());
        assert!(!store.put_new(&sid, &JobId::from_raw("j2")).await.unwrap());
        assert_eq!(store.get(&sid).await.unwrap(), Some(JobId::from_raw("j1")));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn put_new_is_shared_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let first = SqliteSessionStore::new(Database::open(&path).unwrap());
        let second = SqliteSessionStore::new(Database::open(&path).unwrap());
        let sid = SessionId::from_raw("shared");

        assert!(first.put_new(&sid, &JobId::from_raw("j1")).await.unwrap());
        assert!(!second.put_new(&sid, &JobId::from_raw("j2")).await.unwrap());
        assert_eq!(second.get(&sid).await.unwrap(), Some(JobId::from_raw("j1")));

        assert!(first.delete(&sid).await.unwrap());
        assert!(second.put_new(&sid, &JobId::from_raw("j2")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = store();
        let sid = SessionId::from_raw("s1");
        assert!(!store.delete(&sid).await.unwrap());
        store.put(&sid, &JobId::from_raw("j1")).await.unwrap();
        assert!(store.delete(&sid).await.unwrap());
        assert_eq!(store.get(&sid).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_returns_all_entries() {
        let store = store();
        for i in 0..3 {
            store
                .put(
                    &SessionId::from_raw(format!("s{i}")),
                    &JobId::from_raw(format!("j{i}")),
                )
                .await
                .unwrap();
        }
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|e| e.session_id.as_str() == "s2" && e.job_id.as_str() == "j2"));
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let sid = SessionId::from_raw("persisted");

        {
            let store = SqliteSessionStore::new(Database::open(&path).unwrap());
            store.put(&sid, &JobId::from_raw("j-persist")).await.unwrap();
        }

        let reopened = SqliteSessionStore::new(Database::open(&path).unwrap());
        assert_eq!(
            reopened.get(&sid).await.unwrap(),
            Some(JobId::from_raw("j-persist"))
        );
    }

    #[tokio::test]
    async fn corrupt_timestamp_surfaces_error() {
        let store = store();
        store
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO session_jobs (session_id, job_id, created_at) VALUES ('s', 'j', 'yesterday')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(store.list().await, Err(StoreError::Corrupt(_))));
    }
}
