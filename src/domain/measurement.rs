//! Measurement candidates, detection regions and reconciliation output.

use serde::{Deserialize, Serialize};

/// Where a measurement candidate came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    /// Dimensions printed on the drawings.
    Blueprint,
    /// Geometric / computer-vision detector.
    GeometricDetector,
    /// AI-based vision detector.
    AiDetector,
    /// Area stated by the interpretation stage.
    Interpretation,
}

impl MeasurementSource {
    /// Lower is more precise. The most precise candidate is the primary.
    pub fn precision_rank(&self) -> u8 {
        match self {
            MeasurementSource::Blueprint => 0,
            MeasurementSource::GeometricDetector => 1,
            MeasurementSource::AiDetector => 2,
            MeasurementSource::Interpretation => 3,
        }
    }
}

impl std::fmt::Display for MeasurementSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementSource::Blueprint => write!(f, "blueprint"),
            MeasurementSource::GeometricDetector => write!(f, "geometric_detector"),
            MeasurementSource::AiDetector => write!(f, "ai_detector"),
            MeasurementSource::Interpretation => write!(f, "interpretation"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AreaItem {
    pub label: String,
    pub area_sqft: f64,
}

/// One source's estimate of the total roof area
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementCandidate {
    pub source_id: MeasurementSource,
    pub total_area: f64,
    pub per_item_breakdown: Vec<AreaItem>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationRecommendation {
    UsePrimary,
    ManualReview,
}

impl std::fmt::Display for ReconciliationRecommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationRecommendation::UsePrimary => write!(f, "use_primary"),
            ReconciliationRecommendation::ManualReview => write!(f, "manual_review"),
        }
    }
}

/// Reconciled measurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reconciliation {
    pub primary_area: Option<f64>,
    pub primary_source: Option<MeasurementSource>,
    pub confidence: f64,
    pub recommendation: ReconciliationRecommendation,
    /// Largest disagreement between the primary and any other candidate.
    pub diff_pct: Option<f64>,
    pub candidates: Vec<MeasurementCandidate>,
}

// ============================================================================
// Vision detection
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Geometric,
    Ai,
}

impl DetectorKind {
    pub fn source(&self) -> MeasurementSource {
        match self {
            DetectorKind::Geometric => MeasurementSource::GeometricDetector,
            DetectorKind::Ai => MeasurementSource::AiDetector,
        }
    }
}

/// Axis-aligned box in page pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection area over union area.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedRegion {
    pub feature_type: String,
    pub bbox: BoundingBox,
    pub confidence: f64,
    #[serde(default)]
    pub area_sqft: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionDetection {
    pub elements: Vec<DetectedRegion>,
    #[serde(default)]
    pub total_area_sqft: Option<f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DetectionThresholds {
    pub min_confidence: f64,
    pub nms_iou: f64,
}
