use std::sync::Arc;

use anyhow::{Context, Result};

use roofscope_pipeline::{
    app, config, db,
    jobs::{JobManager, PgJobStore, WorkerPool},
    logging,
    pipeline::PipelineController,
    services::{AiClient, RedisCache},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::Settings::from_env()?;
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        workers = settings.jobs.worker_count,
        "Starting roof estimate pipeline"
    );

    let pool = db::create_pool(&settings).await?;
    db::run_migrations(&pool).await?;

    let cache = RedisCache::new(&settings.redis_url, settings.redis_cache_ttl_seconds).await?;

    let ai_client = AiClient::new(
        &settings.ai_service_url,
        &settings.ai_service_token,
        settings.ai_service_timeout_seconds,
    )?;
    let services = ai_client.pipeline_services();
    tracing::debug!(services = ?services, "Pipeline services configured");
    let init_failures = services.init().await;
    if !init_failures.is_empty() {
        tracing::warn!(failures = ?init_failures, "Starting with unready pipeline services; calls will be retried");
    }

    let controller = PipelineController::new(services.clone(), settings.pipeline.clone());
    let store = PgJobStore::new(pool.clone());
    let manager = Arc::new(JobManager::new(
        Arc::new(store),
        Arc::new(controller),
        settings.jobs.clone(),
    ));

    let workers = WorkerPool::start(manager.clone());

    let state = app::AppState::new(pool, settings.clone(), cache, ai_client, manager);
    let app = app::create_app(state);

    let listener = tokio::net::TcpListener::bind(&settings.server_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server_addr))?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers.shutdown().await;
    services.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
