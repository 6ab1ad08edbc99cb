use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ember_core::errors::JobServiceError;
use ember_core::ids::JobId;
use ember_core::jobs::{JobRequest, JobService, JobSnapshot};

/// Job service double with pre-programmed responses, for deterministic tests
/// without network calls.
///
/// - Submissions pop from a queue; once it is empty, ids `job-1`, `job-2`, …
///   are handed out.
/// - Status scripts are per job. The last scripted entry repeats forever; an
///   unscripted job reports `queued`.
/// - Cancellations pop from a queue and default to acknowledged.
#[derive(Default)]
pub struct ScriptedJobService {
    submits: Mutex<VecDeque<Result<JobId, JobServiceError>>>,
    statuses: Mutex<HashMap<JobId, VecDeque<Result<JobSnapshot, JobServiceError>>>>,
    cancels: Mutex<VecDeque<Result<bool, JobServiceError>>>,
    submit_delay: Mutex<Option<Duration>>,
    submitted: Mutex<Vec<JobRequest>>,
    cancelled: Mutex<Vec<JobId>>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl ScriptedJobService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submit(&self, response: Result<JobId, JobServiceError>) {
        self.submits.lock().push_back(response);
    }

    pub fn script_status(&self, job_id: &JobId, responses: Vec<Result<JobSnapshot, JobServiceError>>) {
        self.statuses
            .lock()
            .insert(job_id.clone(), responses.into_iter().collect());
    }

    pub fn push_cancel(&self, response: Result<bool, JobServiceError>) {
        self.cancels.lock().push_back(response);
    }

    /// Make every submission take this long before answering.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock() = Some(delay);
    }

    pub fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::Relaxed)
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::Relaxed)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_calls.load(Ordering::Relaxed)
    }

    /// Requests received by `submit`, in order.
    pub fn submitted(&self) -> Vec<JobRequest> {
        self.submitted.lock().clone()
    }

    /// Job ids passed to `cancel`, in order (including rejected attempts).
    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl JobService for ScriptedJobService {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobId, JobServiceError> {
        let n = self.submit_calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.submitted.lock().push(request.clone());

        let delay = *self.submit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.submits.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(JobId::from_raw(format!("job-{n}"))))
    }

    async fn status(&self, job_id: &JobId) -> Result<JobSnapshot, JobServiceError> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);

        let mut statuses = self.statuses.lock();
        match statuses.get_mut(job_id) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Ok(JobSnapshot::queued())),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(JobSnapshot::queued())),
            None => Ok(JobSnapshot::queued()),
        }
    }

    async fn cancel(&self, job_id: &JobId) -> Result<bool, JobServiceError> {
        self.cancel_calls.fetch_add(1, Ordering::Relaxed);
        self.cancelled.lock().push(job_id.clone());
        self.cancels.lock().pop_front().unwrap_or(Ok(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::jobs::{ConnectionInfo, JobStatus};

    #[tokio::test]
    async fn default_ids_are_sequential() {
        let mock = ScriptedJobService::new();
        let a = mock.submit(&JobRequest::new("a".into())).await.unwrap();
        let b = mock.submit(&JobRequest::new("b".into())).await.unwrap();
        assert_eq!(a.as_str(), "job-1");
        assert_eq!(b.as_str(), "job-2");
        assert_eq!(mock.submitted().len(), 2);
    }

    #[tokio::test]
    async fn last_status_repeats() {
        let mock = ScriptedJobService::new();
        let job = JobId::from_raw("j1");
        mock.script_status(
            &job,
            vec![
                Ok(JobSnapshot::queued()),
                Ok(JobSnapshot::ready(ConnectionInfo::new("x", 1))),
            ],
        );

        assert_eq!(mock.status(&job).await.unwrap().status, JobStatus::Queued);
        assert_eq!(mock.status(&job).await.unwrap().status, JobStatus::Ready);
        assert_eq!(mock.status(&job).await.unwrap().status, JobStatus::Ready);
        assert_eq!(mock.status_count(), 3);
    }

    #[tokio::test]
    async fn unscripted_job_is_queued() {
        let mock = ScriptedJobService::new();
        let snapshot = mock.status(&JobId::from_raw("other")).await.unwrap();
        assert_eq!(snapshot, JobSnapshot::queued());
    }

    #[tokio::test]
    async fn cancel_defaults_to_acknowledged() {
        let mock = ScriptedJobService::new();
        mock.push_cancel(Ok(false));
        assert!(!mock.cancel(&JobId::from_raw("j1")).await.unwrap());
        assert!(mock.cancel(&JobId::from_raw("j1")).await.unwrap());
        assert_eq!(mock.cancelled().len(), 2);
    }
}
