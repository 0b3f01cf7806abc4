//! Estimate job domain types
//!
//! Types for tracking one background pipeline run per document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::documents::DocumentType;
use super::estimate::FinalEstimate;

/// Durable job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `COMPLETED` and `FAILED` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Stages recorded in `stages_completed`, in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Analyzing,
    Extracting,
    Interpreting,
    Validating,
    Completed,
}

impl PipelineStage {
    pub const ORDER: [PipelineStage; 5] = [
        PipelineStage::Analyzing,
        PipelineStage::Extracting,
        PipelineStage::Interpreting,
        PipelineStage::Validating,
        PipelineStage::Completed,
    ];
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Analyzing => write!(f, "analyzing"),
            PipelineStage::Extracting => write!(f, "extracting"),
            PipelineStage::Interpreting => write!(f, "interpreting"),
            PipelineStage::Validating => write!(f, "validating"),
            PipelineStage::Completed => write!(f, "completed"),
        }
    }
}

/// Pipeline controller state machine.
///
/// `Uploaded → Analyzing → Extracting → Interpreting → Validating → Completed`,
/// with `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Uploaded,
    Analyzing,
    Extracting,
    Interpreting,
    Validating,
    Completed,
    Failed,
}

impl PipelineState {
    /// The state that follows a successful stage, if any.
    pub fn next(self) -> Option<PipelineState> {
        match self {
            PipelineState::Uploaded => Some(PipelineState::Analyzing),
            PipelineState::Analyzing => Some(PipelineState::Extracting),
            PipelineState::Extracting => Some(PipelineState::Interpreting),
            PipelineState::Interpreting => Some(PipelineState::Validating),
            PipelineState::Validating => Some(PipelineState::Completed),
            PipelineState::Completed | PipelineState::Failed => None,
        }
    }

    /// The stage name recorded once this state has been left successfully.
    pub fn stage(self) -> Option<PipelineStage> {
        match self {
            PipelineState::Analyzing => Some(PipelineStage::Analyzing),
            PipelineState::Extracting => Some(PipelineStage::Extracting),
            PipelineState::Interpreting => Some(PipelineStage::Interpreting),
            PipelineState::Validating => Some(PipelineStage::Validating),
            PipelineState::Completed => Some(PipelineStage::Completed),
            PipelineState::Uploaded | PipelineState::Failed => None,
        }
    }
}

/// How much work the pipeline spends on a document.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Standard,
    /// Skips vision detection; measurements come from the document text only.
    Fast,
}

/// Options supplied on enqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    #[serde(default)]
    pub mode: ProcessingMode,
    /// Caller-declared document type; bypasses the classifier when present.
    #[serde(default)]
    pub document_type: Option<DocumentType>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

/// Estimate job entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub document_id: Uuid,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub options: JobOptions,
    /// Pipeline attempts consumed so far.
    pub attempts: i32,
    /// Issued by each claim and cleared when the job leaves `PROCESSING`.
    /// Heartbeats and finalize only apply for the current holder.
    #[serde(skip)]
    pub lease_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Doubles as the lease heartbeat while `PROCESSING`.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn holds_lease(&self, lease_id: Uuid) -> bool {
        self.status == JobStatus::Processing && self.lease_id == Some(lease_id)
    }

    pub fn new(document_id: Uuid, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id,
            status: JobStatus::Pending,
            error_message: None,
            options,
            attempts: 0,
            lease_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new job was created
    Created(Uuid),
    /// The document already had a pending or processing job
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Status as reported to callers; unknown job ids yield `Unknown`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Unknown,
}

impl From<JobStatus> for ReportedStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => ReportedStatus::Pending,
            JobStatus::Processing => ReportedStatus::Processing,
            JobStatus::Completed => ReportedStatus::Completed,
            JobStatus::Failed => ReportedStatus::Failed,
        }
    }
}

/// Response for `get_status`. `result` is only set for completed jobs and
/// `error` only for failed ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: Uuid,
    pub status: ReportedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusReport {
    pub fn unknown(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: ReportedStatus::Unknown,
            result: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_walks_stages_in_order() {
        let mut state = PipelineState::Uploaded;
        let mut stages = Vec::new();
        while let Some(next) = state.next() {
            state = next;
            stages.extend(state.stage());
        }
        assert_eq!(state, PipelineState::Completed);
        assert_eq!(stages, PipelineStage::ORDER.to_vec());
    }

    #[test]
    fn terminal_states_have_no_successor() {
        assert_eq!(PipelineState::Completed.next(), None);
        assert_eq!(PipelineState::Failed.next(), None);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn stage_names_serialize_uppercase() {
        let json = serde_json::to_string(&PipelineStage::Interpreting).unwrap();
        assert_eq!(json, "\"INTERPRETING\"");
    }
}
