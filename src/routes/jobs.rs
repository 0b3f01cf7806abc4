//! Estimate job routes

use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::DataResponse;
use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
}

/// GET /jobs/:job_id
///
/// Unknown ids report `UNKNOWN` rather than 404.
pub async fn get_job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> impl IntoResponse {
    DataResponse::new(state.manager.get_status(job_id).await)
}

/// POST /jobs/:job_id/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.manager.cancel(job_id).await?;
    Ok(DataResponse::new(CancelResponse { job_id, cancelled }))
}
