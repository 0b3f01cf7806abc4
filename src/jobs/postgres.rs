//! Postgres-backed job store.
//!
//! Claim and finalize lock the job row, then the document row, with
//! `SELECT ... FOR UPDATE`; the partial unique index on active jobs keeps a
//! document to at most one `PENDING`/`PROCESSING` job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::{ClaimOutcome, Completion, JobStore, RecoveredJob, SweptJob};
use crate::domain::{EnqueueResult, FinalEstimate, Job, JobOptions, JobStatus, StoredDocument};
use crate::error::PipelineError;

// ============================================================================
// Database Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    document_id: Uuid,
    status: JobStatus,
    error_message: Option<String>,
    options: Json<JobOptions>,
    attempts: i32,
    lease_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            document_id: row.document_id,
            status: row.status,
            error_message: row.error_message,
            options: row.options.0,
            attempts: row.attempts,
            lease_id: row.lease_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    filename: String,
    file_path: String,
    mime_type: String,
    page_count: Option<i32>,
    created_at: DateTime<Utc>,
}

impl From<DocumentRow> for StoredDocument {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            filename: row.filename,
            file_path: row.file_path,
            mime_type: row.mime_type,
            page_count: row.page_count,
            created_at: row.created_at,
        }
    }
}

const JOB_COLUMNS: &str =
    "id, document_id, status, error_message, options, attempts, lease_id, created_at, updated_at";

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<Option<JobRow>, PipelineError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM estimate_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn lock_document(
        tx: &mut Transaction<'_, Postgres>,
        document_id: Uuid,
    ) -> Result<Option<DocumentRow>, PipelineError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT id, filename, file_path, mime_type, page_count, created_at
            FROM documents
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(document_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn upsert_result(
        tx: &mut Transaction<'_, Postgres>,
        result: &FinalEstimate,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO estimate_results
                (id, document_id, job_id, roof_area, estimated_cost, confidence_score, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (document_id) DO UPDATE SET
                job_id = EXCLUDED.job_id,
                roof_area = EXCLUDED.roof_area,
                estimated_cost = EXCLUDED.estimated_cost,
                confidence_score = EXCLUDED.confidence_score,
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(result.id)
        .bind(result.document_id)
        .bind(result.job_id)
        .bind(result.roof_area)
        .bind(result.estimated_cost)
        .bind(result.confidence_score)
        .bind(Json(result))
        .bind(result.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn register_document(&self, document: &StoredDocument) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, file_path, mime_type, page_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(document.id)
        .bind(&document.filename)
        .bind(&document.file_path)
        .bind(&document.mime_type)
        .bind(document.page_count)
        .bind(document.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_document(&self, document_id: Uuid) -> Result<Option<StoredDocument>, PipelineError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, filename, file_path, mime_type, page_count, created_at FROM documents WHERE id = $1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, options))]
    async fn enqueue(&self, document_id: Uuid, options: &JobOptions) -> Result<EnqueueResult, PipelineError> {
        let mut tx = self.pool.begin().await?;

        if Self::lock_document(&mut tx, document_id).await?.is_none() {
            return Err(PipelineError::Validation(format!("document {} does not exist", document_id)));
        }

        let active: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM estimate_jobs
            WHERE document_id = $1 AND status IN ('pending', 'processing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = active {
            tx.commit().await?;
            return Ok(EnqueueResult::Duplicate(id));
        }

        let job = Job::new(document_id, options.clone());
        sqlx::query(
            r#"
            INSERT INTO estimate_jobs (id, document_id, status, error_message, options, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, NULL, $4, 0, $5, $5)
            "#,
        )
        .bind(job.id)
        .bind(job.document_id)
        .bind(job.status)
        .bind(Json(&job.options))
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(EnqueueResult::Created(job.id))
    }

    #[instrument(skip(self))]
    async fn claim(&self, job_id: Uuid) -> Result<ClaimOutcome, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let job = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        if job.status != JobStatus::Pending {
            debug!(status = %job.status, "Job not pending, skipping claim");
            return Ok(ClaimOutcome::Skipped(job.status));
        }

        let Some(document) = Self::lock_document(&mut tx, job.document_id).await? else {
            let message = format!("document {} does not exist", job.document_id);
            sqlx::query(
                "UPDATE estimate_jobs SET status = 'failed', error_message = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(job_id)
            .bind(&message)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(ClaimOutcome::Rejected(message));
        };

        let busy: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM estimate_jobs WHERE document_id = $1 AND id <> $2 AND status = 'processing' LIMIT 1",
        )
        .bind(job.document_id)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;
        if busy.is_some() {
            return Ok(ClaimOutcome::Skipped(JobStatus::Processing));
        }

        let claimed = sqlx::query_as::<_, JobRow>(&format!(
            "UPDATE estimate_jobs SET status = 'processing', lease_id = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(Uuid::new_v4())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ClaimOutcome::Claimed {
            job: claimed.into(),
            document: document.into(),
        })
    }

    async fn record_attempt(&self, job_id: Uuid) -> Result<i32, PipelineError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE estimate_jobs SET attempts = attempts + 1, updated_at = NOW() WHERE id = $1 RETURNING attempts",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        attempts.ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))
    }

    async fn heartbeat(&self, job_id: Uuid, lease_id: Uuid) -> Result<bool, PipelineError> {
        let result = sqlx::query(
            "UPDATE estimate_jobs SET updated_at = NOW() WHERE id = $1 AND status = 'processing' AND lease_id = $2",
        )
        .bind(job_id)
        .bind(lease_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, completion), fields(status = %completion.status))]
    async fn finalize(&self, job_id: Uuid, lease_id: Uuid, completion: &Completion) -> Result<bool, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let job: Job = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?
            .into();
        if !job.holds_lease(lease_id) {
            debug!(status = %job.status, "Lease no longer held, dropping completion");
            return Ok(false);
        }
        Self::lock_document(&mut tx, job.document_id).await?;

        if let Some(result) = &completion.result {
            Self::upsert_result(&mut tx, result).await?;
        }

        sqlx::query(
            "UPDATE estimate_jobs SET status = $2, error_message = $3, lease_id = NULL, updated_at = NOW() WHERE id = $1",
        )
            .bind(job_id)
            .bind(completion.status)
            .bind(&completion.error_message)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>, PipelineError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {} FROM estimate_jobs WHERE id = $1", JOB_COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_result(&self, document_id: Uuid) -> Result<Option<FinalEstimate>, PipelineError> {
        let payload: Option<Json<FinalEstimate>> =
            sqlx::query_scalar("SELECT payload FROM estimate_results WHERE document_id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(payload.map(|p| p.0))
    }

    async fn latest_job_for_document(&self, document_id: Uuid) -> Result<Option<Job>, PipelineError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM estimate_jobs WHERE document_id = $1 ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<Uuid>, PipelineError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM estimate_jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, job_id: Uuid, reason: &str) -> Result<bool, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let job = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE estimate_jobs SET status = 'failed', error_message = $2, lease_id = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn recover_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
        exhausted_message: &str,
    ) -> Result<Vec<RecoveredJob>, PipelineError> {
        let rows: Vec<(Uuid, Uuid, JobStatus)> = sqlx::query_as(
            r#"
            UPDATE estimate_jobs
            SET status = CASE WHEN attempts < $2 THEN 'pending' ELSE 'failed' END,
                error_message = CASE WHEN attempts < $2 THEN error_message ELSE $3 END,
                lease_id = NULL,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM estimate_jobs
                WHERE status = 'processing' AND updated_at < $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, document_id, status
            "#,
        )
        .bind(stale_before)
        .bind(max_attempts)
        .bind(exhausted_message)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(job_id, document_id, status)| RecoveredJob {
                job_id,
                document_id,
                status,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn sweep_failed(&self, cutoff: DateTime<Utc>) -> Result<Vec<SweptJob>, PipelineError> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT id, document_id FROM estimate_jobs
            WHERE status = 'failed' AND updated_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut swept = Vec::with_capacity(expired.len());
        for (job_id, document_id) in expired {
            sqlx::query("DELETE FROM estimate_results WHERE document_id = $1 AND job_id = $2")
                .bind(document_id)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM estimate_jobs WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;

            let orphaned_file: Option<String> = sqlx::query_scalar(
                r#"
                DELETE FROM documents d
                WHERE d.id = $1
                  AND NOT EXISTS (SELECT 1 FROM estimate_jobs j WHERE j.document_id = d.id)
                RETURNING d.file_path
                "#,
            )
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;

            swept.push(SweptJob {
                job_id,
                document_id,
                orphaned_file,
            });
        }

        tx.commit().await?;
        Ok(swept)
    }
}
