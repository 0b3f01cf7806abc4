//! Stage pipeline controller.
//!
//! Drives one document through
//! `UPLOADED → ANALYZING → EXTRACTING → INTERPRETING → VALIDATING → COMPLETED`.
//! A failing stage moves the run to `FAILED` and keeps every output produced
//! before it. Stages are never retried here.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::domain::{
    DocumentProfile, DocumentRef, ExtractedContent, Interpretation, JobOptions, PipelineStage,
    PipelineState, ProcessingMode, ValidatedEstimate,
};
use crate::error::{PipelineError, StageError};
use crate::pipeline::{classification, estimate, extraction, interpretation, reconciliation};
use crate::services::PipelineServices;

/// Typed per-stage outputs of one run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutputs {
    pub profile: Option<DocumentProfile>,
    pub content: Option<ExtractedContent>,
    pub interpretation: Option<Interpretation>,
    pub estimate: Option<ValidatedEstimate>,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub state: PipelineState,
    /// Always a prefix of `PipelineStage::ORDER`.
    pub stages_completed: Vec<PipelineStage>,
    pub outputs: PipelineOutputs,
    /// Stage failures, prefixed with the stage name.
    pub errors: Vec<String>,
    /// Degraded conditions and fallbacks that did not stop the run.
    pub warnings: Vec<String>,
    pub failure: Option<PipelineError>,
    pub elapsed_seconds: f64,
}

impl PipelineResult {
    pub fn is_completed(&self) -> bool {
        self.state == PipelineState::Completed
    }
}

/// Anything that can run the pipeline for a document.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, document: &DocumentRef, options: &JobOptions) -> PipelineResult;
}

pub struct PipelineController {
    services: PipelineServices,
    config: PipelineConfig,
}

struct RunContext {
    working_document: DocumentRef,
    outputs: PipelineOutputs,
    warnings: Vec<String>,
}

impl PipelineController {
    pub fn new(services: PipelineServices, config: PipelineConfig) -> Self {
        Self { services, config }
    }

    async fn run_stage(
        &self,
        state: PipelineState,
        ctx: &mut RunContext,
        options: &JobOptions,
    ) -> Result<(), PipelineError> {
        match state {
            PipelineState::Analyzing => {
                let analysis = classification::analyze(
                    &ctx.working_document,
                    options,
                    &self.services,
                    &self.config.routing,
                )
                .await?;
                ctx.warnings.extend(analysis.warnings);
                ctx.working_document = analysis.working_document;
                ctx.outputs.profile = Some(analysis.profile);
            }
            PipelineState::Extracting => {
                let outcome = extraction::extract_content(&ctx.working_document, &self.services).await?;
                ctx.warnings.extend(outcome.warnings);
                ctx.outputs.content = Some(outcome.content);
            }
            PipelineState::Interpreting => {
                let content = ctx.outputs.content.as_ref().ok_or_else(|| missing("extracted content"))?;
                let outcome = interpretation::interpret(content, &self.services).await?;
                ctx.warnings.extend(outcome.warnings);
                ctx.outputs.interpretation = Some(outcome.interpretation);
            }
            PipelineState::Validating => {
                let validated = self.validate(ctx, options).await?;
                ctx.outputs.estimate = Some(validated);
            }
            PipelineState::Completed => {}
            PipelineState::Uploaded | PipelineState::Failed => {
                return Err(PipelineError::Fatal(format!("{:?} is not a runnable stage", state)));
            }
        }
        Ok(())
    }

    async fn validate(
        &self,
        ctx: &mut RunContext,
        options: &JobOptions,
    ) -> Result<ValidatedEstimate, PipelineError> {
        let profile = ctx.outputs.profile.as_ref().ok_or_else(|| missing("document profile"))?;
        let content = ctx.outputs.content.as_ref().ok_or_else(|| missing("extracted content"))?;
        let interpretation = ctx
            .outputs
            .interpretation
            .as_ref()
            .ok_or_else(|| missing("interpretation"))?;

        let mut candidates = Vec::new();
        candidates.extend(reconciliation::printed_area_candidate(profile));

        if options.mode == ProcessingMode::Standard {
            let detection = reconciliation::detect_roof_area(
                &ctx.working_document,
                &self.services,
                &self.config.reconciliation,
            )
            .await;
            ctx.warnings.extend(detection.warnings);
            candidates.extend(detection.candidate);
        }

        candidates.extend(reconciliation::interpretation_candidate(interpretation));

        let reconciled = reconciliation::reconcile(&candidates, &self.config.reconciliation);
        Ok(estimate::synthesize(
            reconciled,
            interpretation,
            content.extraction_method,
            &self.config.estimate,
        ))
    }
}

fn missing(what: &str) -> PipelineError {
    PipelineError::Fatal(format!("{} missing from previous stage", what))
}

#[async_trait]
impl PipelineRunner for PipelineController {
    #[instrument(skip_all, fields(document_id = %document.document_id, mode = ?options.mode))]
    async fn run(&self, document: &DocumentRef, options: &JobOptions) -> PipelineResult {
        let started = Instant::now();
        let mut ctx = RunContext {
            working_document: document.clone(),
            outputs: PipelineOutputs::default(),
            warnings: Vec::new(),
        };
        let mut stages_completed = Vec::new();
        let mut errors = Vec::new();
        let mut failure = None;

        let mut state = PipelineState::Uploaded;
        while let Some(next) = state.next() {
            state = next;
            debug!(state = ?state, "Entering stage");

            match self.run_stage(state, &mut ctx, options).await {
                Ok(()) => stages_completed.extend(state.stage()),
                Err(error) => {
                    // Every non-terminal state maps to a stage
                    let stage = state.stage().unwrap_or(PipelineStage::Analyzing);
                    let stage_error = StageError::new(stage, error.clone());
                    warn!(stage = %stage, error = %error, "Pipeline stage failed");
                    errors.push(stage_error.to_string());
                    failure = Some(error);
                    state = PipelineState::Failed;
                    break;
                }
            }
        }

        let elapsed_seconds = started.elapsed().as_secs_f64();
        info!(
            state = ?state,
            stages = stages_completed.len(),
            warnings = ctx.warnings.len(),
            elapsed_seconds,
            "Pipeline run finished"
        );

        PipelineResult {
            state,
            stages_completed,
            outputs: ctx.outputs,
            errors,
            warnings: ctx.warnings,
            failure,
            elapsed_seconds,
        }
    }
}
