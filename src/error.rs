//! Error taxonomy for the estimate pipeline and its HTTP surface
//!
//! `PipelineError` classifies every failure the core can see so the job
//! lifecycle can decide between retrying, falling back and failing the job.
//! `ApiError` maps those failures onto consistent HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::jobs::PipelineStage;

/// Maximum length of an error message persisted on a job or returned to callers.
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Bad input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing job or document. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested estimate exists but its job has not completed.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Quota, timeout or network failure of a collaborator. Retried with backoff.
    #[error("transient service error: {0}")]
    Transient(String),

    /// A collaborator answered but the output was empty or unusable.
    #[error("degraded output: {0}")]
    Degraded(String),

    /// Extraction, interpretation or classification failure.
    #[error("stage error: {0}")]
    Stage(String),

    /// Unexpected internal failure. Aborts the job immediately.
    #[error("fatal pipeline error: {0}")]
    Fatal(String),

    /// Storage failure. Treated as transient.
    #[error("database error: {0}")]
    Database(String),
}

impl PipelineError {
    /// Whether the failure may succeed if the same work is attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Database(_))
    }

    /// Failures that mean the job's inputs are unusable; these skip retries
    /// and move the job straight to `FAILED`.
    pub fn is_permanent_precondition(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }

    /// Short message suitable for persisting on a job row.
    pub fn short_message(&self) -> String {
        truncate_message(&self.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Stage(format!("invalid JSON payload: {}", err))
    }
}

/// A failure raised inside one pipeline stage, tagged with the stage name.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage} failed: {error}")]
pub struct StageError {
    pub stage: PipelineStage,
    pub error: PipelineError,
}

impl StageError {
    pub fn new(stage: PipelineStage, error: PipelineError) -> Self {
        Self { stage, error }
    }
}

/// Cut a message down to `MAX_ERROR_MESSAGE_LEN` characters on a char boundary.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "NOT_READY",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::NotFound(msg)
            | Self::BadRequest(msg)
            | Self::Conflict(msg)
            | Self::Unavailable(msg) => msg.clone(),
            // Don't leak internal error details
            Self::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(msg) => Self::BadRequest(msg),
            PipelineError::NotFound(msg) => Self::NotFound(msg),
            PipelineError::NotReady(msg) => Self::Conflict(msg),
            PipelineError::Transient(msg) | PipelineError::Database(msg) => Self::Unavailable(msg),
            other => Self::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(e) => {
                tracing::error!(error = ?e, "Internal server error");
            }
            _ => {
                tracing::warn!(error = %self, "API error");
            }
        }

        let status = self.status_code();
        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.public_message(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
