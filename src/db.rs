//! PostgreSQL pool and embedded migrations

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Settings;

/// Connections kept free for request handlers while every worker holds one.
const HANDLER_HEADROOM: u32 = 2;

/// Workers hold a connection for the length of a claim or finalize
/// transaction, so the pool is never sized below `workers + headroom`.
pub fn pool_size(settings: &Settings) -> u32 {
    let workers = u32::try_from(settings.jobs.worker_count).unwrap_or(u32::MAX);
    settings
        .database_max_connections
        .max(workers.saturating_add(HANDLER_HEADROOM))
}

pub async fn create_pool(settings: &Settings) -> Result<PgPool> {
    let connect_options = PgConnectOptions::from_str(&settings.database_url)
        .context("Invalid DATABASE_URL")?
        .application_name("roofscope-pipeline");

    let max_connections = pool_size(settings);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect_with(connect_options)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tracing::info!(max_connections, "Database pool ready");
    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database migrations applied");
    Ok(())
}
