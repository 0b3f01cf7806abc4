//! Extraction and interpretation domain types
//!
//! Typed payloads for the extraction and interpretation stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Extracted Content
// ============================================================================

/// Which text extraction path produced the content
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Layout-aware OCR with table and entity detection.
    DocumentAi,
    /// Plain text layer / basic OCR.
    TextLayer,
    /// Every extractor returned empty output.
    None,
}

impl ExtractionMethod {
    pub fn is_high_fidelity(&self) -> bool {
        matches!(self, ExtractionMethod::DocumentAi)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::DocumentAi => "document_ai",
            ExtractionMethod::TextLayer => "text_layer",
            ExtractionMethod::None => "none",
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A table found by the extraction service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedTable {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

/// A named entity found by the extraction service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEntity {
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub confidence: f64,
}

/// A measurement read directly from the document text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMeasurement {
    pub label: String,
    pub value: f64,
    pub unit: String,
    pub confidence: f64,
    pub source_method: String,
}

impl RawMeasurement {
    pub fn is_area(&self) -> bool {
        self.unit == "sqft"
    }
}

/// Output of the extraction stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub text: String,
    pub tables: Vec<ExtractedTable>,
    pub entities: Vec<ExtractedEntity>,
    pub raw_measurements: Vec<RawMeasurement>,
    pub extraction_method: ExtractionMethod,
    pub confidence: f64,
}

impl ExtractedContent {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            tables: Vec::new(),
            entities: Vec::new(),
            raw_measurements: Vec::new(),
            extraction_method: ExtractionMethod::None,
            confidence: 0.0,
        }
    }
}

// ============================================================================
// Interpretation
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterpretationMethod {
    Llm,
    RuleBased,
}

impl InterpretationMethod {
    pub fn is_ai(&self) -> bool {
        matches!(self, InterpretationMethod::Llm)
    }
}

/// Material mention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Material {
    #[serde(rename = "type")]
    pub material_type: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

impl Material {
    pub fn named(material_type: impl Into<String>) -> Self {
        Self {
            material_type: normalize_material(&material_type.into()),
            quantity: None,
            unit: None,
        }
    }
}

/// Canonical material key: lowercase with underscores.
pub fn normalize_material(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Interpreted measurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub label: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DamageSeverity {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DamageAssessment {
    pub severity: DamageSeverity,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeatureImpact {
    Low,
    Medium,
    High,
}

/// Roof feature with a count and cost impact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedFeature {
    #[serde(rename = "type")]
    pub feature_type: String,
    pub count: u32,
    pub impact: FeatureImpact,
}

/// Output of the interpretation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    pub area_sqft: Option<f64>,
    pub pitch: Option<String>,
    pub materials: Vec<Material>,
    pub measurements: Vec<Measurement>,
    pub damage_assessment: Option<DamageAssessment>,
    pub special_requirements: Vec<String>,
    pub detected_features: Vec<DetectedFeature>,
    pub confidence: f64,
    pub interpretation_method: InterpretationMethod,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Interpretation {
    pub fn has_high_damage(&self) -> bool {
        self.damage_assessment
            .as_ref()
            .is_some_and(|d| d.severity == DamageSeverity::High)
    }
}
