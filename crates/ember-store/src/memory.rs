//! In-memory session store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use ember_core::ids::{JobId, SessionId};

use crate::error::StoreError;
use crate::{SessionJob, SessionStore};

/// Session store kept in a concurrent map.
///
/// Entries are lost when the process exits; use
/// [`SqliteSessionStore`](crate::SqliteSessionStore) when sessions must
/// outlive the orchestrator.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: DashMap<SessionId, SessionJob>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<JobId>, StoreError> {
        Ok(self.entries.get(session_id).map(|e| e.job_id.clone()))
    }

    async fn put(&self, session_id: &SessionId, job_id: &JobId) -> Result<(), StoreError> {
        let _ = self.entries.insert(
            session_id.clone(),
            SessionJob {
                session_id: session_id.clone(),
                job_id: job_id.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn put_new(&self, session_id: &SessionId, job_id: &JobId) -> Result<bool, StoreError> {
        match self.entries.entry(session_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let _ = slot.insert(SessionJob {
                    session_id: session_id.clone(),
                    job_id: job_id.clone(),
                    created_at: Utc::now(),
                });
                Ok(true)
            }
        }
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.entries.remove(session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionJob>, StoreError> {
        let mut all: Vec<SessionJob> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemorySessionStore::new();
        let sid = SessionId::from_raw("s1");

        assert_eq!(store.get(&sid).await.unwrap(), None);
        store.put(&sid, &JobId::from_raw("j1")).await.unwrap();
        assert_eq!(store.get(&sid).await.unwrap(), Some(JobId::from_raw("j1")));

        assert!(store.delete(&sid).await.unwrap());
        assert!(!store.delete(&sid).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn put_replaces_job() {
        let store = MemorySessionStore::new();
        let sid = SessionId::from_raw("s1");
        store.put(&sid, &JobId::from_raw("j1")).await.unwrap();
        store.put(&sid, &JobId::from_raw("j2")).await.unwrap();
        assert_eq!(store.get(&sid).await.unwrap(), Some(JobId::from_raw("j2")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn put_new_keeps_existing_job() {
        let store = MemorySessionStore::new();
        let sid = SessionId::from_raw("s1");
        assert!(store.put_new(&sid, &JobId::from_raw("j1")).await.unwrap());
        assert!(!store.put_new(&sid, &JobId::from_raw("j2")).await.unwrap());
        assert_eq!(store.get(&sid).await.unwrap(), Some(JobId::from_raw("j1")));
    }

    #[tokio::test]
    async fn concurrent_put_new_has_one_winner() {
        let store = Arc::new(MemorySessionStore::new());
        let sid = SessionId::from_raw("contended");
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let sid = sid.clone();
            handles.push(tokio::spawn(async move {
                store.put_new(&sid, &JobId::from_raw(format!("j{i}"))).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sessions_are_independent() {
        let store = Arc::new(MemorySessionStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let sid = SessionId::from_raw(format!("s{i}"));
                store.put(&sid, &JobId::from_raw(format!("j{i}"))).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 32);
        assert_eq!(
            store.get(&SessionId::from_raw("s7")).await.unwrap(),
            Some(JobId::from_raw("j7"))
        );
    }
}
