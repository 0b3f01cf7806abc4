//! Liveness and dependency health

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;
use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: Overall,
    pub version: &'static str,
    pub database: bool,
    pub redis: bool,
    pub ai_service: bool,
}

impl HealthReport {
    /// Jobs cannot be claimed without the database; cache and AI outages
    /// only degrade the service.
    fn from_checks(database: bool, redis: bool, ai_service: bool) -> Self {
        let status = match (database, redis && ai_service) {
            (false, _) => Overall::Unhealthy,
            (true, true) => Overall::Healthy,
            (true, false) => Overall::Degraded,
        };
        Self {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database,
            redis,
            ai_service,
        }
    }
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let (database, redis, ai) = tokio::join!(
        db::health_check(&state.db),
        state.cache.health_check(),
        state.ai_client.health_check(),
    );

    let report = HealthReport::from_checks(database, redis.is_ok(), ai.is_ok());
    let code = match report.status {
        Overall::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}
