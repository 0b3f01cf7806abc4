//! Durable storage for documents, estimate jobs and per-document results.
//!
//! Every mutation runs under the job row lock (and the document row lock where
//! two jobs could race), so implementations serialize work per document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{EnqueueResult, FinalEstimate, Job, JobOptions, JobStatus, StoredDocument};
use crate::error::PipelineError;

/// Outcome of trying to move a job from `PENDING` to `PROCESSING`.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The job is now `PROCESSING` and owned by the caller.
    Claimed { job: Job, document: StoredDocument },
    /// Nothing to do: the job is not pending, or another job for the same
    /// document is already processing.
    Skipped(JobStatus),
    /// The job's preconditions failed; it has been moved to `FAILED`.
    Rejected(String),
}

/// Terminal write applied by `finalize`.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: JobStatus,
    pub error_message: Option<String>,
    /// Upserted into the document's result slot when present.
    pub result: Option<FinalEstimate>,
}

impl Completion {
    pub fn completed(result: FinalEstimate) -> Self {
        Self {
            status: JobStatus::Completed,
            error_message: None,
            result: Some(result),
        }
    }

    pub fn failed(message: impl Into<String>, partial: Option<FinalEstimate>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(message.into()),
            result: partial,
        }
    }
}

/// A failed job removed by the retention sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweptJob {
    pub job_id: Uuid,
    pub document_id: Uuid,
    /// Set when the sweep also removed the document because no other job
    /// referenced it; the caller deletes the file.
    pub orphaned_file: Option<String>,
}

/// A `PROCESSING` job whose lease lapsed, and the status recovery moved it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredJob {
    pub job_id: Uuid,
    pub document_id: Uuid,
    /// `PENDING` when attempts remain, otherwise `FAILED`.
    pub status: JobStatus,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn register_document(&self, document: &StoredDocument) -> Result<(), PipelineError>;

    async fn find_document(&self, document_id: Uuid) -> Result<Option<StoredDocument>, PipelineError>;

    /// Create a `PENDING` job, or return the document's active job.
    async fn enqueue(&self, document_id: Uuid, options: &JobOptions) -> Result<EnqueueResult, PipelineError>;

    async fn claim(&self, job_id: Uuid) -> Result<ClaimOutcome, PipelineError>;

    /// Count one pipeline attempt; returns the new total.
    async fn record_attempt(&self, job_id: Uuid) -> Result<i32, PipelineError>;

    /// Extend the lease held by `lease_id`. Returns `false` when the job is no
    /// longer `PROCESSING` under that lease.
    async fn heartbeat(&self, job_id: Uuid, lease_id: Uuid) -> Result<bool, PipelineError>;

    /// Apply a terminal status. Returns `false` when the job was no longer
    /// `PROCESSING` under `lease_id`, in which case nothing was written.
    async fn finalize(&self, job_id: Uuid, lease_id: Uuid, completion: &Completion) -> Result<bool, PipelineError>;

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>, PipelineError>;

    async fn find_result(&self, document_id: Uuid) -> Result<Option<FinalEstimate>, PipelineError>;

    async fn latest_job_for_document(&self, document_id: Uuid) -> Result<Option<Job>, PipelineError>;

    /// Oldest pending job ids first.
    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Uuid>, PipelineError>;

    /// Move a non-terminal job to `FAILED` with `reason`. Returns `false` for
    /// jobs that are already terminal.
    async fn cancel(&self, job_id: Uuid, reason: &str) -> Result<bool, PipelineError>;

    /// Release `PROCESSING` jobs not heartbeated since `stale_before`. Jobs
    /// with fewer than `max_attempts` attempts go back to `PENDING`; the rest
    /// fail with `exhausted_message`.
    async fn recover_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
        exhausted_message: &str,
    ) -> Result<Vec<RecoveredJob>, PipelineError>;

    /// Delete jobs that have been `FAILED` since before `cutoff`, together
    /// with results they produced.
    async fn sweep_failed(&self, cutoff: DateTime<Utc>) -> Result<Vec<SweptJob>, PipelineError>;
}
