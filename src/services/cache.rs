//! Redis cache of finished estimates, keyed by document.
//!
//! Reads that fail (connection or decode) count as misses. Entries are
//! dropped whenever a new job is enqueued for the document so a re-run
//! never serves the previous estimate.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::FinalEstimate;

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisCache {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        tracing::info!(ttl_secs = ttl_seconds, "Estimate cache connected");
        Ok(Self {
            conn,
            ttl: Duration::from_secs(ttl_seconds),
        })
    }

    #[instrument(skip(self), fields(hit))]
    pub async fn estimate(&self, document_id: Uuid) -> Option<FinalEstimate> {
        let mut conn = self.conn.clone();
        let key = estimate_key(document_id);

        let raw: Option<String> = match conn.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Estimate cache read failed");
                None
            }
        };
        let estimate = raw.and_then(|data| {
            serde_json::from_str(&data)
                .map_err(|e| warn!(error = %e, "Discarding undecodable cached estimate"))
                .ok()
        });

        tracing::Span::current().record("hit", estimate.is_some());
        estimate
    }

    #[instrument(skip(self, estimate))]
    pub async fn store_estimate(&self, document_id: Uuid, estimate: &FinalEstimate) -> Result<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(estimate).context("Failed to encode estimate")?;

        conn.set_ex::<_, _, ()>(estimate_key(document_id), data, self.ttl.as_secs())
            .await
            .context("Failed to cache estimate")?;
        debug!(ttl_secs = self.ttl.as_secs(), "Estimate cached");
        Ok(())
    }

    /// Returns whether an entry existed.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, document_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(estimate_key(document_id))
            .await
            .context("Failed to invalidate cached estimate")?;
        Ok(removed > 0)
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;
        Ok(())
    }
}

fn estimate_key(document_id: Uuid) -> String {
    format!("estimate:document:{}", document_id)
}
