//! Job lifecycle manager.
//!
//! Owns the `PENDING → PROCESSING → {COMPLETED, FAILED}` transitions. The
//! pipeline itself runs outside any lock: the claim commits `PROCESSING`
//! first and the finalize re-locks to write the result and terminal status.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::store::{ClaimOutcome, Completion, JobStore};
use crate::config::JobConfig;
use crate::domain::{
    DocumentRef, EnqueueResult, FinalEstimate, Job, JobOptions, JobStatus, JobStatusReport,
    StoredDocument,
};
use crate::error::{truncate_message, PipelineError};
use crate::pipeline::estimate::complexity_factors;
use crate::pipeline::{PipelineResult, PipelineRunner};

const CANCELLED: &str = "cancelled";
const LEASE_EXPIRED: &str = "worker stopped responding; processing lease expired";

/// What `process` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job reached this terminal status during the call.
    Finished(JobStatus),
    /// Another caller owns the job, or it was already terminal.
    Skipped(JobStatus),
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn PipelineRunner>,
    config: JobConfig,
    notify: Arc<Notify>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<dyn PipelineRunner>, config: JobConfig) -> Self {
        Self {
            store,
            runner,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Signalled after every new job; workers wait on it between polls.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn register_document(&self, document: &StoredDocument) -> Result<(), PipelineError> {
        self.store.register_document(document).await
    }

    #[instrument(skip(self, options), fields(document_id = %document_id))]
    pub async fn enqueue(&self, document_id: Uuid, options: JobOptions) -> Result<EnqueueResult, PipelineError> {
        let outcome = self.store.enqueue(document_id, &options).await?;
        match outcome {
            EnqueueResult::Created(job_id) => {
                info!(job_id = %job_id, mode = ?options.mode, "Estimate job enqueued");
                self.notify.notify_one();
            }
            EnqueueResult::Duplicate(job_id) => {
                debug!(job_id = %job_id, "Document already has an active job");
            }
        }
        Ok(outcome)
    }

    pub async fn pending_jobs(&self, limit: i64) -> Result<Vec<Uuid>, PipelineError> {
        self.store.pending_jobs(limit).await
    }

    /// Claim, run and finalize one job.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn process(&self, job_id: Uuid) -> Result<ProcessOutcome, PipelineError> {
        let claim = self
            .retry("claim", || self.store.claim(job_id))
            .await
            .map_err(|e| {
                if e.is_permanent_precondition() {
                    warn!(error = %e, "Job cannot be claimed");
                }
                e
            })?;
        let (job, document) = match claim {
            ClaimOutcome::Claimed { job, document } => (job, document),
            ClaimOutcome::Skipped(status) => {
                debug!(status = %status, "Job not claimable");
                return Ok(ProcessOutcome::Skipped(status));
            }
            ClaimOutcome::Rejected(reason) => {
                warn!(reason = %reason, "Job rejected at claim");
                return Ok(ProcessOutcome::Finished(JobStatus::Failed));
            }
        };

        let Some(lease_id) = job.lease_id else {
            return Err(PipelineError::Fatal(format!("claim of job {} issued no lease", job_id)));
        };

        let file_exists = tokio::fs::try_exists(&document.file_path).await.unwrap_or(false);
        if !file_exists {
            warn!(path = %document.file_path, "Document file missing");
            let completion = Completion::failed(
                truncate_message(&format!("document file not found: {}", document.file_path)),
                None,
            );
            return self.finish(job_id, lease_id, completion).await;
        }

        let Some(result) = self.run_leased(&job, lease_id, &document.to_ref()).await? else {
            info!("Lease lost between attempts; not re-running");
            return Ok(ProcessOutcome::Skipped(self.current_status(job_id).await?));
        };

        let completion = completion_for(&job, &result);
        self.finish(job_id, lease_id, completion).await
    }

    /// Run the pipeline while heartbeating the lease. A lost lease (cancelled,
    /// or released by stale recovery) stops the heartbeat but not the run in
    /// flight; finalize then drops its completion.
    async fn run_leased(
        &self,
        job: &Job,
        lease_id: Uuid,
        document: &DocumentRef,
    ) -> Result<Option<PipelineResult>, PipelineError> {
        let run = self.run_pipeline(job, lease_id, document);
        tokio::pin!(run);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut holding = true;
        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = heartbeat.tick(), if holding => match self.store.heartbeat(job.id, lease_id).await {
                    Ok(true) => debug!("Lease extended"),
                    Ok(false) => {
                        info!("Lease lost; the run in flight will not be recorded");
                        holding = false;
                    }
                    // Missing one beat is fine; the lease outlives several
                    Err(e) => warn!(error = %e, "Heartbeat failed"),
                },
            }
        }
    }

    /// Run the pipeline, re-running the whole job while it fails transiently.
    /// Returns `None` if the lease was lost between attempts.
    async fn run_pipeline(
        &self,
        job: &Job,
        lease_id: Uuid,
        document: &DocumentRef,
    ) -> Result<Option<PipelineResult>, PipelineError> {
        let mut backoff = self.backoff();
        loop {
            let attempts = self.retry("record_attempt", || self.store.record_attempt(job.id)).await?;
            let result = self.runner.run(document, &job.options).await;

            let transient = result.failure.as_ref().is_some_and(PipelineError::is_transient);
            let exhausted = u32::try_from(attempts).unwrap_or(u32::MAX) >= self.config.max_attempts;
            if !transient || exhausted {
                return Ok(Some(result));
            }

            let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = ?result.failure,
                "Transient pipeline failure, re-running job"
            );
            tokio::time::sleep(delay).await;

            if !self.store.heartbeat(job.id, lease_id).await? {
                return Ok(None);
            }
        }
    }

    async fn finish(&self, job_id: Uuid, lease_id: Uuid, completion: Completion) -> Result<ProcessOutcome, PipelineError> {
        let status = completion.status;
        let applied = self
            .retry("finalize", || self.store.finalize(job_id, lease_id, &completion))
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to finalize job");
                e
            })?;

        if !applied {
            info!("Job changed state while running; completion dropped");
            return Ok(ProcessOutcome::Skipped(self.current_status(job_id).await?));
        }

        match &completion.error_message {
            Some(message) => warn!(status = %status, error = %message, "Job finished"),
            None => info!(status = %status, "Job finished"),
        }
        Ok(ProcessOutcome::Finished(status))
    }

    async fn current_status(&self, job_id: Uuid) -> Result<JobStatus, PipelineError> {
        Ok(self
            .store
            .find_job(job_id)
            .await?
            .map(|j| j.status)
            .unwrap_or(JobStatus::Failed))
    }

    /// Status of a job. Never fails; lookups that error report `UNKNOWN`.
    pub async fn get_status(&self, job_id: Uuid) -> JobStatusReport {
        let job = match self.store.find_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return JobStatusReport::unknown(job_id),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Status lookup failed");
                return JobStatusReport::unknown(job_id);
            }
        };

        let result = if job.status == JobStatus::Completed {
            match self.store.find_result(job.document_id).await {
                Ok(result) => result.filter(|r| r.job_id == job.id),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Result lookup failed");
                    None
                }
            }
        } else {
            None
        };
        let error = if job.status == JobStatus::Failed {
            job.error_message.clone()
        } else {
            None
        };

        JobStatusReport {
            job_id,
            status: job.status.into(),
            result,
            error,
        }
    }

    /// The estimate of the document's latest job, once that job completed.
    pub async fn get_estimate(&self, document_id: Uuid) -> Result<FinalEstimate, PipelineError> {
        let job = self
            .store
            .latest_job_for_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("no estimate job for document {}", document_id)))?;

        if job.status != JobStatus::Completed {
            return Err(PipelineError::NotReady(format!("job {} is {}", job.id, job.status)));
        }

        self.store
            .find_result(document_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("no estimate for document {}", document_id)))
    }

    /// Whether `estimate` (typically from the cache) still belongs to the
    /// document's latest job and that job completed.
    pub async fn estimate_is_current(&self, estimate: &FinalEstimate) -> Result<bool, PipelineError> {
        let latest = self.store.latest_job_for_document(estimate.document_id).await?;
        Ok(latest.is_some_and(|job| job.id == estimate.job_id && job.status == JobStatus::Completed))
    }

    /// Cooperative cancel: the job becomes `FAILED` "cancelled"; a run in
    /// flight finishes but its completion is dropped.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, PipelineError> {
        let cancelled = self.store.cancel(job_id, CANCELLED).await?;
        if cancelled {
            info!("Job cancelled");
        }
        Ok(cancelled)
    }

    /// Delete jobs that have been `FAILED` for longer than the retention
    /// window, with their results and any document file left unreferenced.
    pub async fn sweep_expired(&self) -> Result<usize, PipelineError> {
        let cutoff = Utc::now() - self.config.failed_retention;
        let swept = self.store.sweep_failed(cutoff).await?;

        for job in &swept {
            let Some(path) = &job.orphaned_file else {
                continue;
            };
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path, "Removed document file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path, error = %e, "Failed to remove document file"),
            }
        }

        if !swept.is_empty() {
            info!(count = swept.len(), "Swept expired failed jobs");
        }
        Ok(swept.len())
    }

    /// Release `PROCESSING` jobs whose worker stopped heartbeating: back to
    /// `PENDING` while attempts remain, otherwise `FAILED`.
    pub async fn recover_stale(&self) -> Result<usize, PipelineError> {
        let lease = chrono::Duration::from_std(self.config.processing_lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let max_attempts = i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX);
        let recovered = self
            .store
            .recover_stale(Utc::now() - lease, max_attempts, LEASE_EXPIRED)
            .await?;

        for job in &recovered {
            warn!(
                job_id = %job.job_id,
                document_id = %job.document_id,
                status = %job.status,
                "Released job with expired lease"
            );
            if job.status == JobStatus::Pending {
                self.notify.notify_one();
            }
        }
        Ok(recovered.len())
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_max_interval(self.config.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Retry a store operation on transient errors, up to `max_attempts`.
    async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let attempt = AtomicU32::new(0);
        let max_attempts = self.config.max_attempts.max(1);

        backoff::future::retry(self.backoff(), || {
            let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() && n < max_attempts {
                        warn!(operation, attempt = n, error = %e, "Transient store error, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

/// Terminal write for a finished pipeline run.
fn completion_for(job: &Job, result: &PipelineResult) -> Completion {
    let estimate = build_estimate(job, result);

    if result.is_completed() {
        return match estimate {
            Some(estimate) => Completion::completed(estimate),
            None => Completion::failed("pipeline completed without an estimate", None),
        };
    }

    let joined = result.errors.join("; ");
    let message = (!joined.is_empty())
        .then_some(joined)
        .or_else(|| result.failure.as_ref().map(PipelineError::short_message))
        .unwrap_or_else(|| "pipeline failed".to_string());
    Completion::failed(truncate_message(&message), estimate)
}

/// Fold a run's outputs into the durable result. `None` when no stage
/// produced anything worth keeping.
pub fn build_estimate(job: &Job, result: &PipelineResult) -> Option<FinalEstimate> {
    let outputs = &result.outputs;
    outputs.profile.as_ref()?;

    let interpretation = outputs.interpretation.as_ref();
    let validated = outputs.estimate.as_ref();

    let confidence = match (validated, interpretation) {
        (Some(v), _) if v.validated_measurements.primary_area.is_some() => v.validated_measurements.confidence,
        (_, Some(i)) => i.confidence,
        _ => outputs.profile.as_ref().map(|p| p.confidence).unwrap_or(0.0),
    };
    let confidence_score = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let mut warnings = result.warnings.clone();
    let mut errors = result.errors.clone();
    if let Some(v) = validated {
        warnings.extend(v.warnings.iter().cloned());
        errors.extend(v.errors.iter().cloned());
    }

    let now = Utc::now();
    Some(FinalEstimate {
        id: Uuid::new_v4(),
        document_id: job.document_id,
        job_id: job.id,
        roof_area: validated.and_then(|v| v.validated_measurements.primary_area),
        estimated_cost: validated.and_then(|v| v.cost_breakdown.as_ref().map(|c| c.final_cost)),
        confidence_score,
        quality_score: validated.map(|v| v.quality_score),
        timeline: validated.map(|v| v.timeline.clone()),
        reconciliation_recommendation: validated.map(|v| v.reconciliation_recommendation),
        materials: interpretation.map(|i| i.materials.clone()).unwrap_or_default(),
        features: interpretation.map(|i| i.detected_features.clone()).unwrap_or_default(),
        complexity_factors: interpretation.map(complexity_factors).unwrap_or_default(),
        stages_completed: result.stages_completed.clone(),
        extraction_method: outputs.content.as_ref().map(|c| c.extraction_method),
        interpretation: interpretation.and_then(|i| serde_json::to_value(i).ok()),
        recommendations: validated.map(|v| v.material_recommendations.clone()).unwrap_or_default(),
        warnings,
        errors,
        created_at: now,
        updated_at: now,
    })
}
