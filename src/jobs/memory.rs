//! In-process job store for tests and local runs.
//!
//! One mutex guards documents, jobs and results together, which gives the
//! same per-document serialization the Postgres row locks provide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::{ClaimOutcome, Completion, JobStore, RecoveredJob, SweptJob};
use crate::domain::{EnqueueResult, FinalEstimate, Job, JobOptions, JobStatus, StoredDocument};
use crate::error::PipelineError;

#[derive(Default)]
struct State {
    documents: HashMap<Uuid, StoredDocument>,
    /// Insertion order doubles as creation order.
    jobs: Vec<Job>,
    results: HashMap<Uuid, FinalEstimate>,
}

impl State {
    fn job_mut(&mut self, job_id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }
}

#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    injected_failures: AtomicU32,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` claim/attempt/finalize calls fail with a
    /// database error.
    pub fn fail_next_writes(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Backdate a job's last update, for retention and lease tests.
    pub fn set_updated_at(&self, job_id: Uuid, at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().job_mut(job_id) {
            job.updated_at = at;
        }
    }

    fn check_injected(&self) -> Result<(), PipelineError> {
        let taken = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(PipelineError::Database("injected connection reset".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn register_document(&self, document: &StoredDocument) -> Result<(), PipelineError> {
        self.state.lock().documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn find_document(&self, document_id: Uuid) -> Result<Option<StoredDocument>, PipelineError> {
        Ok(self.state.lock().documents.get(&document_id).cloned())
    }

    async fn enqueue(&self, document_id: Uuid, options: &JobOptions) -> Result<EnqueueResult, PipelineError> {
        let mut state = self.state.lock();
        if !state.documents.contains_key(&document_id) {
            return Err(PipelineError::Validation(format!("document {} does not exist", document_id)));
        }
        if let Some(active) = state
            .jobs
            .iter()
            .find(|j| j.document_id == document_id && j.status.is_active())
        {
            return Ok(EnqueueResult::Duplicate(active.id));
        }

        let job = Job::new(document_id, options.clone());
        let id = job.id;
        state.jobs.push(job);
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, job_id: Uuid) -> Result<ClaimOutcome, PipelineError> {
        self.check_injected()?;
        let mut state = self.state.lock();

        let (status, document_id) = match state.jobs.iter().find(|j| j.id == job_id) {
            Some(job) => (job.status, job.document_id),
            None => return Err(PipelineError::NotFound(format!("job {}", job_id))),
        };
        if status != JobStatus::Pending {
            return Ok(ClaimOutcome::Skipped(status));
        }
        if state
            .jobs
            .iter()
            .any(|j| j.document_id == document_id && j.id != job_id && j.status == JobStatus::Processing)
        {
            return Ok(ClaimOutcome::Skipped(JobStatus::Processing));
        }

        let document = state.documents.get(&document_id).cloned();
        let now = Utc::now();
        let Some(job) = state.job_mut(job_id) else {
            return Err(PipelineError::NotFound(format!("job {}", job_id)));
        };
        job.updated_at = now;

        match document {
            Some(document) => {
                job.status = JobStatus::Processing;
                job.lease_id = Some(Uuid::new_v4());
                Ok(ClaimOutcome::Claimed {
                    job: job.clone(),
                    document,
                })
            }
            None => {
                let message = format!("document {} does not exist", document_id);
                job.status = JobStatus::Failed;
                job.error_message = Some(message.clone());
                Ok(ClaimOutcome::Rejected(message))
            }
        }
    }

    async fn record_attempt(&self, job_id: Uuid) -> Result<i32, PipelineError> {
        self.check_injected()?;
        let mut state = self.state.lock();
        let job = state
            .job_mut(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        job.attempts += 1;
        job.updated_at = Utc::now();
        Ok(job.attempts)
    }

    async fn heartbeat(&self, job_id: Uuid, lease_id: Uuid) -> Result<bool, PipelineError> {
        let mut state = self.state.lock();
        match state.job_mut(job_id) {
            Some(job) if job.holds_lease(lease_id) => {
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, job_id: Uuid, lease_id: Uuid, completion: &Completion) -> Result<bool, PipelineError> {
        self.check_injected()?;
        let mut state = self.state.lock();
        let job = state
            .job_mut(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        if !job.holds_lease(lease_id) {
            return Ok(false);
        }

        job.status = completion.status;
        job.lease_id = None;
        job.error_message = completion.error_message.clone();
        job.updated_at = Utc::now();
        let document_id = job.document_id;

        if let Some(result) = &completion.result {
            let created_at = state
                .results
                .get(&document_id)
                .map(|existing| existing.created_at)
                .unwrap_or(result.created_at);
            let mut stored = result.clone();
            stored.created_at = created_at;
            state.results.insert(document_id, stored);
        }
        Ok(true)
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>, PipelineError> {
        Ok(self.state.lock().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn find_result(&self, document_id: Uuid) -> Result<Option<FinalEstimate>, PipelineError> {
        Ok(self.state.lock().results.get(&document_id).cloned())
    }

    async fn latest_job_for_document(&self, document_id: Uuid) -> Result<Option<Job>, PipelineError> {
        Ok(self
            .state
            .lock()
            .jobs
            .iter()
            .rev()
            .find(|j| j.document_id == document_id)
            .cloned())
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Uuid>, PipelineError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .state
            .lock()
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .take(limit)
            .map(|j| j.id)
            .collect())
    }

    async fn cancel(&self, job_id: Uuid, reason: &str) -> Result<bool, PipelineError> {
        let mut state = self.state.lock();
        let job = state
            .job_mut(job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(reason.to_string());
        job.lease_id = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn recover_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
        exhausted_message: &str,
    ) -> Result<Vec<RecoveredJob>, PipelineError> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut recovered = Vec::new();
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < stale_before)
        {
            if job.attempts < max_attempts {
                job.status = JobStatus::Pending;
            } else {
                job.status = JobStatus::Failed;
                job.error_message = Some(exhausted_message.to_string());
            }
            job.lease_id = None;
            job.updated_at = now;
            recovered.push(RecoveredJob {
                job_id: job.id,
                document_id: job.document_id,
                status: job.status,
            });
        }
        Ok(recovered)
    }

    async fn sweep_failed(&self, cutoff: DateTime<Utc>) -> Result<Vec<SweptJob>, PipelineError> {
        let mut state = self.state.lock();
        let (expired, kept): (Vec<Job>, Vec<Job>) = std::mem::take(&mut state.jobs)
            .into_iter()
            .partition(|j| j.status == JobStatus::Failed && j.updated_at < cutoff);
        state.jobs = kept;

        let mut swept = Vec::with_capacity(expired.len());
        for job in expired {
            if state
                .results
                .get(&job.document_id)
                .is_some_and(|r| r.job_id == job.id)
            {
                state.results.remove(&job.document_id);
            }

            let still_referenced = state.jobs.iter().any(|j| j.document_id == job.document_id);
            let orphaned_file = if still_referenced {
                None
            } else {
                state.documents.remove(&job.document_id).map(|d| d.file_path)
            };

            swept.push(SweptJob {
                job_id: job.id,
                document_id: job.document_id,
                orphaned_file,
            });
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> StoredDocument {
        StoredDocument {
            id: Uuid::new_v4(),
            filename: "roof.pdf".to_string(),
            file_path: "/tmp/roof.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            page_count: Some(3),
            created_at: Utc::now(),
        }
    }

    async fn claimed_lease(store: &InMemoryJobStore, job_id: Uuid) -> Uuid {
        match store.claim(job_id).await.unwrap() {
            ClaimOutcome::Claimed { job, .. } => job.lease_id.unwrap(),
            other => panic!("expected claim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_active() {
        let store = InMemoryJobStore::new();
        let doc = document();
        store.register_document(&doc).await.unwrap();

        let first = store.enqueue(doc.id, &JobOptions::default()).await.unwrap();
        let second = store.enqueue(doc.id, &JobOptions::default()).await.unwrap();
        assert!(first.is_created());
        assert_eq!(second, EnqueueResult::Duplicate(first.job_id()));
    }

    #[tokio::test]
    async fn second_claim_is_skipped() {
        let store = InMemoryJobStore::new();
        let doc = document();
        store.register_document(&doc).await.unwrap();
        let job_id = store.enqueue(doc.id, &JobOptions::default()).await.unwrap().job_id();

        assert!(matches!(store.claim(job_id).await.unwrap(), ClaimOutcome::Claimed { .. }));
        assert!(matches!(
            store.claim(job_id).await.unwrap(),
            ClaimOutcome::Skipped(JobStatus::Processing)
        ));
    }

    #[tokio::test]
    async fn finalize_after_cancel_is_ignored() {
        let store = InMemoryJobStore::new();
        let doc = document();
        store.register_document(&doc).await.unwrap();
        let job_id = store.enqueue(doc.id, &JobOptions::default()).await.unwrap().job_id();
        let lease = claimed_lease(&store, job_id).await;

        assert!(store.cancel(job_id, "cancelled").await.unwrap());
        assert!(!store.heartbeat(job_id, lease).await.unwrap());
        let applied = store
            .finalize(job_id, lease, &Completion::failed("late failure", None))
            .await
            .unwrap();
        assert!(!applied);
        let job = store.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryJobStore::new();
        let doc = document();
        store.register_document(&doc).await.unwrap();
        let job_id = store.enqueue(doc.id, &JobOptions::default()).await.unwrap().job_id();

        store.fail_next_writes(1);
        assert!(store.claim(job_id).await.unwrap_err().is_transient());
        assert!(matches!(store.claim(job_id).await.unwrap(), ClaimOutcome::Claimed { .. }));
    }

    #[tokio::test]
    async fn stale_processing_job_is_released_and_old_lease_is_void() {
        let store = InMemoryJobStore::new();
        let doc = document();
        store.register_document(&doc).await.unwrap();
        let job_id = store.enqueue(doc.id, &JobOptions::default()).await.unwrap().job_id();
        let stale_lease = claimed_lease(&store, job_id).await;
        store.record_attempt(job_id).await.unwrap();

        // Fresh heartbeats keep the job
        let recovered = store
            .recover_stale(Utc::now() - chrono::Duration::minutes(10), 3, "lease expired")
            .await
            .unwrap();
        assert!(recovered.is_empty());

        store.set_updated_at(job_id, Utc::now() - chrono::Duration::days(30));
        let recovered = store
            .recover_stale(Utc::now() - chrono::Duration::minutes(10), 3, "lease expired")
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, JobStatus::Pending);
        assert_eq!(store.pending_jobs(10).await.unwrap(), vec![job_id]);

        // A new claim issues a new lease; the lost worker can no longer write
        let fresh_lease = claimed_lease(&store, job_id).await;
        assert_ne!(fresh_lease, stale_lease);
        assert!(!store.heartbeat(job_id, stale_lease).await.unwrap());
        let late = Completion::failed("late", None);
        assert!(!store.finalize(job_id, stale_lease, &late).await.unwrap());
        assert!(store.heartbeat(job_id, fresh_lease).await.unwrap());
    }

    #[tokio::test]
    async fn stale_job_without_attempts_left_fails() {
        let store = InMemoryJobStore::new();
        let doc = document();
        store.register_document(&doc).await.unwrap();
        let job_id = store.enqueue(doc.id, &JobOptions::default()).await.unwrap().job_id();
        claimed_lease(&store, job_id).await;
        store.record_attempt(job_id).await.unwrap();
        store.set_updated_at(job_id, Utc::now() - chrono::Duration::hours(1));

        let recovered = store
            .recover_stale(Utc::now() - chrono::Duration::minutes(10), 1, "lease expired")
            .await
            .unwrap();
        assert_eq!(recovered[0].status, JobStatus::Failed);

        let job = store.find_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.error_message.as_deref(), Some("lease expired"));
        assert!(store.enqueue(doc.id, &JobOptions::default()).await.unwrap().is_created());
    }
}
