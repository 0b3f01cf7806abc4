//! HTTP application assembly: shared state, middleware and routes.

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, Method, Request},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

use crate::config::Settings;
use crate::jobs::JobManager;
use crate::middleware::{request_id_layer, RequestIdExt, X_REQUEST_ID};
use crate::routes;
use crate::services::{AiClient, RedisCache};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub settings: Settings,
    pub cache: RedisCache,
    /// Only used by `/health`; pipeline calls go through `manager`
    pub ai_client: AiClient,
    pub manager: Arc<JobManager>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        settings: Settings,
        cache: RedisCache,
        ai_client: AiClient,
        manager: Arc<JobManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            settings,
            cache,
            ai_client,
            manager,
        })
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.settings);
    with_middleware(routes::api_router(), cors).with_state(state)
}

/// Each `.layer` wraps everything added before it, so the last one is the
/// outermost: the request id is set before the trace span opens and is
/// echoed on the way out.
fn with_middleware<S>(router: Router<S>, cors: CorsLayer) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let (set_request_id, propagate_request_id) = request_id_layer();

    router
        .layer(propagate_request_id)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(set_request_id)
        .layer(cors)
}

fn request_span(request: &Request<Body>) -> Span {
    tracing::info_span!(
        "http_request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = request.headers().request_id().unwrap_or("-"),
    )
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allow_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(X_REQUEST_ID),
        ])
        .expose_headers([HeaderName::from_static(X_REQUEST_ID)])
        .max_age(Duration::from_secs(3600))
}
