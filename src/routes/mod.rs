pub mod documents;
pub mod health;
pub mod jobs;

use axum::{routing::get, routing::post, Router};
use std::sync::Arc;

use crate::app::AppState;

/// Build the API router with all routes
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        // Documents
        .route("/documents", post(documents::register_document))
        .route("/documents/:document_id/jobs", post(documents::enqueue_job))
        .route("/documents/:document_id/estimate", get(documents::get_estimate))
        // Jobs
        .route("/jobs/:job_id", get(jobs::get_job_status))
        .route("/jobs/:job_id/cancel", post(jobs::cancel_job))
}
