//! Document routes
//!
//! Registration of uploaded files, estimate job submission and estimate
//! retrieval.

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{Accepted, Created, DataResponse};
use crate::app::AppState;
use crate::domain::{EnqueueResult, JobOptions, StoredDocument};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RegisterDocumentRequest {
    pub filename: String,
    /// Path relative to the storage root
    pub file_path: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    pub page_count: Option<i32>,
}

fn default_mime_type() -> String {
    "application/pdf".to_string()
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    /// False when the document already had an active job
    pub created: bool,
}

/// Resolve a client-supplied relative path inside `root`.
fn resolve_storage_path(root: &FsPath, relative: &str) -> Result<PathBuf, ApiError> {
    let relative = FsPath::new(relative);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if relative.as_os_str().is_empty() || !plain {
        return Err(ApiError::BadRequest(
            "file_path must be a relative path inside the storage root".to_string(),
        ));
    }
    Ok(root.join(relative))
}

/// POST /documents
pub async fn register_document(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RegisterDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if input.filename.trim().is_empty() {
        return Err(ApiError::BadRequest("filename is required".to_string()));
    }
    if input.page_count.is_some_and(|n| n < 0) {
        return Err(ApiError::BadRequest("page_count cannot be negative".to_string()));
    }
    let path = resolve_storage_path(&state.settings.storage_root, &input.file_path)?;

    let document = StoredDocument {
        id: Uuid::new_v4(),
        filename: input.filename,
        file_path: path.to_string_lossy().into_owned(),
        mime_type: input.mime_type,
        page_count: input.page_count,
        created_at: Utc::now(),
    };
    state.manager.register_document(&document).await?;

    tracing::info!(document_id = %document.id, "Document registered");
    Ok(Created(document))
}

/// POST /documents/:document_id/jobs
///
/// Body is optional; an empty body runs with default options.
pub async fn enqueue_job(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
    options: Option<Json<JobOptions>>,
) -> Result<Response, ApiError> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let outcome = state.manager.enqueue(document_id, options).await?;

    // A new run supersedes whatever estimate was cached for the document
    if let Err(e) = state.cache.invalidate(document_id).await {
        tracing::warn!(document_id = %document_id, error = %e, "Failed to invalidate cached estimate");
    }

    let body = EnqueueResponse {
        job_id: outcome.job_id(),
        created: outcome.is_created(),
    };
    Ok(match outcome {
        EnqueueResult::Created(_) => Accepted(body).into_response(),
        EnqueueResult::Duplicate(_) => DataResponse::new(body).into_response(),
    })
}

/// GET /documents/:document_id/estimate
pub async fn get_estimate(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    // A cached entry may predate a newer job when a write raced an enqueue
    if let Some(cached) = state.cache.estimate(document_id).await {
        if state.manager.estimate_is_current(&cached).await? {
            return Ok(DataResponse::new(cached));
        }
        tracing::debug!(document_id = %document_id, job_id = %cached.job_id, "Ignoring stale cached estimate");
    }

    let estimate = state.manager.get_estimate(document_id).await?;
    if let Err(e) = state.cache.store_estimate(document_id, &estimate).await {
        tracing::warn!(document_id = %document_id, error = %e, "Failed to cache estimate");
    }

    Ok(DataResponse::new(estimate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_paths_stay_inside_the_root() {
        let root = FsPath::new("/srv/uploads");
        assert_eq!(
            resolve_storage_path(root, "2024/roof.pdf").unwrap(),
            PathBuf::from("/srv/uploads/2024/roof.pdf")
        );
        assert!(resolve_storage_path(root, "../etc/passwd").is_err());
        assert!(resolve_storage_path(root, "/etc/passwd").is_err());
        assert!(resolve_storage_path(root, "").is_err());
    }
}
