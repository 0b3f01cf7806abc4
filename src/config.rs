use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub redis_cache_ttl_seconds: u64,

    // CORS
    pub cors_allow_origins: Vec<String>,

    // AI Service
    pub ai_service_url: String,
    pub ai_service_token: String,
    pub ai_service_timeout_seconds: u64,

    // Uploaded document storage
    pub storage_root: PathBuf,

    pub jobs: JobConfig,
    pub pipeline: PipelineConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("ENV").unwrap_or_else(|_| "dev".to_string()));
        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        // Database
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = env_or("DATABASE_MAX_CONNECTIONS", 10);

        // Redis
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/0".to_string());
        let redis_cache_ttl_seconds = env_or("REDIS_CACHE_TTL_SECONDS", 3600); // 1 hour default

        // CORS
        let cors_allow_origins = env::var("CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        // AI Service
        let ai_service_url =
            env::var("AI_SERVICE_URL").unwrap_or_else(|_| "http://ai-service:8000".to_string());
        url::Url::parse(&ai_service_url).context("AI_SERVICE_URL must be a valid URL")?;
        let ai_service_token =
            env::var("AI_SERVICE_TOKEN").context("AI_SERVICE_TOKEN must be set")?;
        let ai_service_timeout_seconds = env_or("AI_SERVICE_TIMEOUT_SECONDS", 120); // 2 minutes default for LLM calls

        let storage_root = env::var("STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./storage"));

        Ok(Settings {
            env,
            server_addr,
            database_url,
            database_max_connections,
            redis_url,
            redis_cache_ttl_seconds,
            cors_allow_origins,
            ai_service_url,
            ai_service_token,
            ai_service_timeout_seconds,
            storage_root,
            jobs: JobConfig::from_env(),
            pipeline: PipelineConfig::from_env(),
        })
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is missing or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// Job lifecycle
// ============================================================================

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub worker_count: usize,
    /// How long an idle worker waits before polling for pending jobs again
    pub poll_interval: Duration,
    /// Upper bound on attempts for transient failures (claim, pipeline, finalize)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a FAILED job is kept before the retention sweep removes it
    pub failed_retention: chrono::Duration,
    pub sweep_interval: Duration,
    /// A `PROCESSING` job with no heartbeat for this long is released
    pub processing_lease: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            failed_retention: chrono::Duration::days(7),
            sweep_interval: Duration::from_secs(3600),
            processing_lease: Duration::from_secs(600),
        }
    }
}

impl JobConfig {
    /// Heartbeats run several times per lease so one late tick is harmless.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.processing_lease / 4).max(Duration::from_millis(1))
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_or("JOB_WORKER_COUNT", defaults.worker_count).max(1),
            poll_interval: Duration::from_millis(env_or("JOB_POLL_INTERVAL_MS", 5_000)),
            max_attempts: env_or("JOB_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            initial_backoff: Duration::from_millis(env_or("JOB_INITIAL_BACKOFF_MS", 500)),
            max_backoff: Duration::from_millis(env_or("JOB_MAX_BACKOFF_MS", 30_000)),
            failed_retention: chrono::Duration::hours(env_or("FAILED_JOB_RETENTION_HOURS", 168)),
            sweep_interval: Duration::from_secs(env_or("RETENTION_SWEEP_INTERVAL_SECONDS", 3600)),
            processing_lease: Duration::from_secs(env_or::<u64>("JOB_PROCESSING_LEASE_SECONDS", 600).max(1)),
        }
    }
}

// ============================================================================
// Pipeline tunables
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub routing: RoutingConfig,
    pub reconciliation: ReconciliationConfig,
    pub estimate: EstimateConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            routing: RoutingConfig::from_env(),
            reconciliation: ReconciliationConfig::from_env(),
            estimate: EstimateConfig::from_env(),
        }
    }
}

/// Page-routing thresholds
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Documents longer than this are always routed when relevant pages exist
    pub max_pages_without_routing: u32,
    /// Route when relevant pages make up less than this share of the document
    pub min_relevant_ratio: f64,
    /// Page always kept in a routed document
    pub general_notes_page: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_pages_without_routing: 20,
            min_relevant_ratio: 0.3,
            general_notes_page: 2,
        }
    }
}

impl RoutingConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_pages_without_routing: env_or("ROUTING_MAX_PAGES", d.max_pages_without_routing),
            min_relevant_ratio: env_or("ROUTING_MIN_RELEVANT_RATIO", d.min_relevant_ratio),
            general_notes_page: env_or("ROUTING_GENERAL_NOTES_PAGE", d.general_notes_page),
        }
    }
}

/// Reconciliation tiers and detector escalation thresholds
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub agree_pct: f64,
    pub close_pct: f64,
    pub divergent_pct: f64,
    pub agree_confidence: f64,
    pub close_confidence: f64,
    pub divergent_confidence: f64,
    pub conflict_confidence: f64,
    /// Geometric detector confidence below which the AI detector is consulted
    pub escalation_confidence: f64,
    /// Detectors closer than this (percent of the larger total) count as agreeing
    pub escalation_agreement_pct: f64,
    pub nms_iou_threshold: f64,
    pub min_detection_confidence: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            agree_pct: 5.0,
            close_pct: 15.0,
            divergent_pct: 30.0,
            agree_confidence: 0.95,
            close_confidence: 0.8,
            divergent_confidence: 0.6,
            conflict_confidence: 0.3,
            escalation_confidence: 0.7,
            escalation_agreement_pct: 20.0,
            nms_iou_threshold: 0.4,
            min_detection_confidence: 0.25,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            agree_pct: env_or("RECONCILE_AGREE_PCT", d.agree_pct),
            close_pct: env_or("RECONCILE_CLOSE_PCT", d.close_pct),
            divergent_pct: env_or("RECONCILE_DIVERGENT_PCT", d.divergent_pct),
            escalation_confidence: env_or("DETECTOR_ESCALATION_CONFIDENCE", d.escalation_confidence),
            escalation_agreement_pct: env_or(
                "DETECTOR_AGREEMENT_PCT",
                d.escalation_agreement_pct,
            ),
            nms_iou_threshold: env_or("NMS_IOU_THRESHOLD", d.nms_iou_threshold),
            ..d
        }
    }
}

/// Per-square-foot rates for one material
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialRate {
    pub material: Decimal,
    pub labor: Decimal,
}

impl MaterialRate {
    /// Rates in cents per square foot.
    pub const fn cents(material: i64, labor: i64) -> Self {
        Self {
            material: Decimal::from_parts(material as u32, 0, 0, false, 2),
            labor: Decimal::from_parts(labor as u32, 0, 0, false, 2),
        }
    }
}

/// Cost model inputs
#[derive(Debug, Clone)]
pub struct EstimateConfig {
    pub rates: BTreeMap<String, MaterialRate>,
    /// Used for materials missing from `rates`
    pub default_rate: MaterialRate,
    /// Used when no material was identified
    pub default_material: String,
    pub overhead_pct: Decimal,
    pub profit_pct: Decimal,
    pub contingency_pct: Decimal,
    pub min_plausible_area: f64,
    pub max_plausible_area: f64,
    pub low_confidence: f64,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        let rates = [
            ("asphalt_shingle", MaterialRate::cents(450, 300)),
            ("architectural_shingle", MaterialRate::cents(550, 325)),
            ("metal", MaterialRate::cents(900, 500)),
            ("standing_seam_metal", MaterialRate::cents(1100, 600)),
            ("tile", MaterialRate::cents(1000, 650)),
            ("clay_tile", MaterialRate::cents(1200, 700)),
            ("slate", MaterialRate::cents(1500, 800)),
            ("wood_shake", MaterialRate::cents(850, 500)),
            ("tpo", MaterialRate::cents(600, 350)),
            ("epdm", MaterialRate::cents(500, 300)),
            ("modified_bitumen", MaterialRate::cents(550, 350)),
        ]
        .into_iter()
        .map(|(name, rate)| (name.to_string(), rate))
        .collect();

        Self {
            rates,
            default_rate: MaterialRate::cents(500, 300),
            default_material: "asphalt_shingle".to_string(),
            overhead_pct: Decimal::from(15),
            profit_pct: Decimal::from(10),
            contingency_pct: Decimal::from(5),
            min_plausible_area: 100.0,
            max_plausible_area: 50_000.0,
            low_confidence: 0.5,
        }
    }
}

impl EstimateConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            overhead_pct: env_or("ESTIMATE_OVERHEAD_PCT", d.overhead_pct),
            profit_pct: env_or("ESTIMATE_PROFIT_PCT", d.profit_pct),
            contingency_pct: env_or("ESTIMATE_CONTINGENCY_PCT", d.contingency_pct),
            ..d
        }
    }

    pub fn rate_for(&self, material: &str) -> MaterialRate {
        self.rates.get(material).copied().unwrap_or(self.default_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_build_exact_decimals() {
        let rate = MaterialRate::cents(800, 400);
        assert_eq!(rate.material, Decimal::from(8));
        assert_eq!(rate.labor, Decimal::from(4));
    }

    #[test]
    fn unknown_material_uses_default_rate() {
        let config = EstimateConfig::default();
        assert_eq!(config.rate_for("thatch"), config.default_rate);
        assert_eq!(config.rate_for("slate"), MaterialRate::cents(1500, 800));
    }

    #[test]
    fn environment_parsing_defaults_to_dev() {
        assert_eq!(Environment::from_str("production"), Environment::Prod);
        assert_eq!(Environment::from_str("anything"), Environment::Dev);
    }
}
