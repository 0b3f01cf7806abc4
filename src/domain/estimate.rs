//! Estimate domain types
//!
//! The validation stage output and the durable per-document result.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extraction::{DetectedFeature, ExtractionMethod, Material};
use super::jobs::PipelineStage;
use super::measurement::{Reconciliation, ReconciliationRecommendation};

/// Cost model breakdown, in compounding order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostBreakdown {
    pub primary_material: String,
    pub area_sqft: Decimal,
    pub material_rate: Decimal,
    pub labor_rate: Decimal,
    pub base_cost: Decimal,
    pub subtotal: Decimal,
    pub profit: Decimal,
    pub contingency: Decimal,
    pub final_cost: Decimal,
}

/// Output of the validation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedEstimate {
    pub validated_measurements: Reconciliation,
    pub cost_breakdown: Option<CostBreakdown>,
    pub primary_material: String,
    pub material_recommendations: Vec<String>,
    /// 0.0 to 10.0
    pub quality_score: f64,
    pub timeline: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub reconciliation_recommendation: ReconciliationRecommendation,
}

/// Durable result row, one per document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalEstimate {
    pub id: Uuid,
    pub document_id: Uuid,
    pub job_id: Uuid,
    pub roof_area: Option<f64>,
    pub estimated_cost: Option<Decimal>,
    /// 0.0 to 1.0
    pub confidence_score: f64,
    pub quality_score: Option<f64>,
    pub timeline: Option<String>,
    pub reconciliation_recommendation: Option<ReconciliationRecommendation>,
    pub materials: Vec<Material>,
    pub features: Vec<DetectedFeature>,
    pub complexity_factors: Vec<String>,
    pub stages_completed: Vec<PipelineStage>,
    pub extraction_method: Option<ExtractionMethod>,
    pub interpretation: Option<serde_json::Value>,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
