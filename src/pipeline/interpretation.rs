//! Interpretation of extracted content into roofing facts.
//!
//! The language model is asked for a JSON object matching `SCHEMA_HINT`; when
//! it is missing, fails or answers with something unparseable, a deterministic
//! keyword interpreter takes over.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::domain::{
    normalize_material, DamageAssessment, DamageSeverity, DetectedFeature, ExtractedContent,
    FeatureImpact, Interpretation, InterpretationMethod, Material, Measurement,
};
use crate::error::PipelineError;
use crate::pipeline::json::parse_largest_object;
use crate::pipeline::strategy::{FallbackChain, Strategy};
use crate::services::{LanguageInterpretationService, PipelineServices};

pub const SCHEMA_HINT: &str = r#"{
  "area_sqft": "number or null",
  "pitch": "string such as 6/12 or null",
  "materials": [{"type": "string", "quantity": "number or null", "unit": "string or null"}],
  "measurements": [{"label": "string", "value": "number", "unit": "string or null"}],
  "damage_assessment": {"severity": "low | moderate | high", "description": "string"},
  "special_requirements": ["string"],
  "detected_features": [{"type": "string", "count": "integer", "impact": "low | medium | high"}],
  "confidence": "number between 0 and 1"
}"#;

/// Characters of document text sent to the language model.
const LLM_TEXT_LIMIT: usize = 12_000;
const DEFAULT_LLM_CONFIDENCE: f64 = 0.7;

// =============================================================================
// Language model strategy
// =============================================================================

pub struct LlmInterpreter {
    language: Arc<dyn LanguageInterpretationService>,
}

impl LlmInterpreter {
    pub const NAME: &'static str = "llm";

    pub fn new(language: Arc<dyn LanguageInterpretationService>) -> Self {
        Self { language }
    }
}

#[derive(Debug, Deserialize)]
struct LlmReply {
    #[serde(default)]
    area_sqft: Option<f64>,
    #[serde(default)]
    pitch: Option<String>,
    #[serde(default)]
    materials: Vec<Material>,
    #[serde(default)]
    measurements: Vec<Measurement>,
    #[serde(default)]
    damage_assessment: Option<DamageAssessment>,
    #[serde(default)]
    special_requirements: Vec<String>,
    #[serde(default)]
    detected_features: Vec<DetectedFeature>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[async_trait]
impl Strategy<ExtractedContent, Interpretation> for LlmInterpreter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn attempt(&self, content: &ExtractedContent) -> Result<Interpretation, PipelineError> {
        if content.text.trim().is_empty() {
            return Err(PipelineError::Degraded("no text to interpret".to_string()));
        }

        let prompt = build_prompt(content);
        let reply = self.language.interpret(&prompt, SCHEMA_HINT).await?;
        let parsed: LlmReply = parse_largest_object(&reply)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("strategy".to_string(), serde_json::json!(Self::NAME));

        Ok(Interpretation {
            area_sqft: parsed.area_sqft.filter(|a| a.is_finite() && *a > 0.0),
            pitch: parsed.pitch.filter(|p| !p.trim().is_empty()),
            materials: parsed
                .materials
                .into_iter()
                .map(|m| Material {
                    material_type: normalize_material(&m.material_type),
                    ..m
                })
                .filter(|m| !m.material_type.is_empty())
                .collect(),
            measurements: parsed.measurements,
            damage_assessment: parsed.damage_assessment,
            special_requirements: parsed.special_requirements,
            detected_features: parsed.detected_features,
            confidence: parsed
                .confidence
                .unwrap_or(DEFAULT_LLM_CONFIDENCE)
                .clamp(0.0, 1.0),
            interpretation_method: InterpretationMethod::Llm,
            metadata,
        })
    }
}

fn build_prompt(content: &ExtractedContent) -> String {
    let excerpt: String = content.text.chars().take(LLM_TEXT_LIMIT).collect();
    let mut prompt = String::from(
        "Extract roofing facts from this construction document. Answer with one JSON object.\n\n",
    );
    if !content.raw_measurements.is_empty() {
        prompt.push_str("Measurements already found:\n");
        for m in &content.raw_measurements {
            prompt.push_str(&format!("- {}: {} {}\n", m.label, m.value, m.unit));
        }
        prompt.push('\n');
    }
    prompt.push_str(&excerpt);
    prompt
}

// =============================================================================
// Rule-based strategy
// =============================================================================

fn word_pattern(words: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{})\b", words)).unwrap()
}

static MATERIAL_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("architectural_shingle", word_pattern(r"architectural\s+shingles?|dimensional\s+shingles?")),
        ("asphalt_shingle", word_pattern(r"asphalt\s+shingles?|3-tab|three[\s-]tab|composition\s+shingles?")),
        ("standing_seam_metal", word_pattern(r"standing\s+seam")),
        ("metal", word_pattern(r"metal\s+roof(?:ing)?|metal\s+panels?|corrugated\s+metal")),
        ("clay_tile", word_pattern(r"clay\s+tiles?")),
        ("tile", word_pattern(r"concrete\s+tiles?|roof\s+tiles?")),
        ("slate", word_pattern(r"slate")),
        ("wood_shake", word_pattern(r"wood\s+shakes?|cedar\s+shakes?")),
        ("tpo", word_pattern(r"tpo")),
        ("epdm", word_pattern(r"epdm|rubber\s+membrane")),
        ("modified_bitumen", word_pattern(r"modified\s+bitumen|mod\s+bit")),
    ]
});

static REQUIREMENT_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("permit", word_pattern(r"permits?")),
        ("tear_off", word_pattern(r"tear[\s-]?off|remove\s+existing")),
        ("ventilation", word_pattern(r"ventilation|ridge\s+vents?")),
        ("ice_and_water_shield", word_pattern(r"ice\s+(?:and|&)\s+water(?:\s+shield)?")),
        ("steep_slope_safety", word_pattern(r"steep\s+slope|fall\s+protection")),
    ]
});

static FEATURE_PATTERNS: LazyLock<Vec<(&'static str, FeatureImpact, Regex)>> = LazyLock::new(|| {
    vec![
        ("chimney", FeatureImpact::Medium, word_pattern(r"chimneys?")),
        ("skylight", FeatureImpact::Medium, word_pattern(r"skylights?")),
        ("vent", FeatureImpact::Low, word_pattern(r"vents?|pipe\s+boots?")),
        ("dormer", FeatureImpact::High, word_pattern(r"dormers?")),
        ("valley", FeatureImpact::Medium, word_pattern(r"valleys?")),
    ]
});

static HIGH_DAMAGE: LazyLock<Regex> = LazyLock::new(|| {
    word_pattern(r"severe|structural\s+damage|active\s+leaks?|sagging|missing\s+shingles|rot(?:ted|ten)?\s+deck(?:ing)?")
});
static MODERATE_DAMAGE: LazyLock<Regex> =
    LazyLock::new(|| word_pattern(r"hail\s+damage|wind\s+damage|damaged?|granule\s+loss|cracked|lifted"));
static LOW_DAMAGE: LazyLock<Regex> = LazyLock::new(|| word_pattern(r"wear|weathering|minor|cosmetic"));

const RULE_BASE_CONFIDENCE: f64 = 0.4;
const RULE_MAX_CONFIDENCE: f64 = 0.6;

pub struct RuleBasedInterpreter;

impl RuleBasedInterpreter {
    pub const NAME: &'static str = "rule_based";
}

#[async_trait]
impl Strategy<ExtractedContent, Interpretation> for RuleBasedInterpreter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn attempt(&self, content: &ExtractedContent) -> Result<Interpretation, PipelineError> {
        Ok(interpret_by_rules(content))
    }
}

/// Deterministic interpretation from raw measurements and keywords.
pub fn interpret_by_rules(content: &ExtractedContent) -> Interpretation {
    let text = content.text.as_str();

    let areas: Vec<_> = content.raw_measurements.iter().filter(|m| m.is_area()).collect();
    let area_sqft = areas
        .iter()
        .find(|m| m.label.contains("total"))
        .or_else(|| {
            areas
                .iter()
                .max_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal))
        })
        .map(|m| m.value);

    let pitch = content
        .raw_measurements
        .iter()
        .find(|m| m.label == "pitch")
        .map(|m| format!("{}/12", m.value));

    // Most-mentioned material first; the sort is stable so ties keep table order
    let mut mentions: Vec<(&str, usize)> = MATERIAL_PATTERNS
        .iter()
        .map(|(name, re)| (*name, re.find_iter(text).count()))
        .filter(|(_, count)| *count > 0)
        .collect();
    mentions.sort_by(|a, b| b.1.cmp(&a.1));
    let materials: Vec<Material> = mentions.iter().map(|(name, _)| Material::named(*name)).collect();

    let measurements = content
        .raw_measurements
        .iter()
        .map(|m| Measurement {
            label: m.label.clone(),
            value: m.value,
            unit: Some(m.unit.clone()),
        })
        .collect();

    let damage_assessment = damage_severity(text).map(|severity| DamageAssessment {
        severity,
        description: Some("keyword match".to_string()),
    });

    let special_requirements = REQUIREMENT_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| name.to_string())
        .collect();

    let detected_features = FEATURE_PATTERNS
        .iter()
        .filter_map(|(name, impact, re)| {
            let count = re.find_iter(text).count() as u32;
            (count > 0).then(|| DetectedFeature {
                feature_type: name.to_string(),
                count,
                impact: *impact,
            })
        })
        .collect();

    let mut confidence = RULE_BASE_CONFIDENCE;
    if area_sqft.is_some() {
        confidence += 0.1;
    }
    if !materials.is_empty() {
        confidence += 0.05;
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("strategy".to_string(), serde_json::json!(RuleBasedInterpreter::NAME));

    Interpretation {
        area_sqft,
        pitch,
        materials,
        measurements,
        damage_assessment,
        special_requirements,
        detected_features,
        confidence: confidence.min(RULE_MAX_CONFIDENCE),
        interpretation_method: InterpretationMethod::RuleBased,
        metadata,
    }
}

fn damage_severity(text: &str) -> Option<DamageSeverity> {
    if HIGH_DAMAGE.is_match(text) {
        Some(DamageSeverity::High)
    } else if MODERATE_DAMAGE.is_match(text) {
        Some(DamageSeverity::Moderate)
    } else if LOW_DAMAGE.is_match(text) {
        Some(DamageSeverity::Low)
    } else {
        None
    }
}

// =============================================================================
// Interpretation stage
// =============================================================================

#[derive(Debug, Clone)]
pub struct InterpretationOutcome {
    pub interpretation: Interpretation,
    pub warnings: Vec<String>,
}

#[instrument(skip_all, fields(chars = content.text.len()))]
pub async fn interpret(
    content: &ExtractedContent,
    services: &PipelineServices,
) -> Result<InterpretationOutcome, PipelineError> {
    let mut chain = FallbackChain::<ExtractedContent, Interpretation>::new();
    if let Some(language) = &services.language {
        chain = chain.push(LlmInterpreter::new(language.clone()));
    }
    let chain = chain.push(RuleBasedInterpreter);

    let outcome = chain.run(content).await.map_err(|e| e.into_error("interpretation"))?;
    debug!(strategy = %outcome.strategy, "Content interpreted");

    Ok(InterpretationOutcome {
        interpretation: outcome.value,
        warnings: outcome
            .failures
            .iter()
            .map(|f| format!("interpretation: {}", f))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExtractionMethod, RawMeasurement};

    struct Scripted(Result<String, PipelineError>);

    #[async_trait]
    impl LanguageInterpretationService for Scripted {
        async fn interpret(&self, _content: &str, _schema: &str) -> Result<String, PipelineError> {
            self.0.clone()
        }
    }

    fn content(text: &str, measurements: Vec<RawMeasurement>) -> ExtractedContent {
        ExtractedContent {
            text: text.to_string(),
            raw_measurements: measurements,
            extraction_method: ExtractionMethod::TextLayer,
            confidence: 0.7,
            ..ExtractedContent::empty()
        }
    }

    fn area(label: &str, value: f64) -> RawMeasurement {
        RawMeasurement {
            label: label.to_string(),
            value,
            unit: "sqft".to_string(),
            confidence: 0.7,
            source_method: "text_layer".to_string(),
        }
    }

    #[test]
    fn rules_prefer_total_area_and_rank_materials() {
        let interpretation = interpret_by_rules(&content(
            "Install architectural shingles over ice and water shield. \
             Architectural shingles on garage. Two chimneys and one skylight. \
             Hail damage on north slope. Permit required.",
            vec![area("garage", 3200.0), area("total roof area", 2450.0)],
        ));

        assert_eq!(interpretation.area_sqft, Some(2450.0));
        assert_eq!(interpretation.materials[0].material_type, "architectural_shingle");
        assert_eq!(
            interpretation.damage_assessment.map(|d| d.severity),
            Some(DamageSeverity::Moderate)
        );
        assert!(interpretation.special_requirements.contains(&"permit".to_string()));
        assert!(interpretation
            .special_requirements
            .contains(&"ice_and_water_shield".to_string()));
        let chimney = interpretation
            .detected_features
            .iter()
            .find(|f| f.feature_type == "chimney")
            .unwrap();
        assert_eq!(chimney.count, 1);
        assert_eq!(interpretation.interpretation_method, InterpretationMethod::RuleBased);
        assert!(interpretation.confidence <= RULE_MAX_CONFIDENCE);
    }

    #[test]
    fn rules_fall_back_to_largest_area() {
        let interpretation =
            interpret_by_rules(&content("", vec![area("garage", 400.0), area("house", 1900.0)]));
        assert_eq!(interpretation.area_sqft, Some(1900.0));
    }

    #[tokio::test]
    async fn llm_json_embedded_in_prose_is_used() {
        let reply = r#"Here you go:
{"area_sqft": 2400, "pitch": "6/12", "materials": [{"type": "Standing Seam Metal"}],
 "detected_features": [{"type": "dormer", "count": 2, "impact": "high"}], "confidence": 0.85}
Let me know if you need more."#;
        let services = PipelineServices::new().with_language(Arc::new(Scripted(Ok(reply.into()))));

        let outcome = interpret(&content("roof plan text", vec![]), &services).await.unwrap();
        let interpretation = outcome.interpretation;
        assert_eq!(interpretation.interpretation_method, InterpretationMethod::Llm);
        assert_eq!(interpretation.area_sqft, Some(2400.0));
        assert_eq!(interpretation.materials[0].material_type, "standing_seam_metal");
        assert_eq!(interpretation.confidence, 0.85);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn unparseable_llm_reply_falls_back_to_rules() {
        let services = PipelineServices::new()
            .with_language(Arc::new(Scripted(Ok("I could not read the document.".into()))));

        let outcome = interpret(&content("slate roof", vec![]), &services).await.unwrap();
        assert_eq!(
            outcome.interpretation.interpretation_method,
            InterpretationMethod::RuleBased
        );
        assert_eq!(outcome.interpretation.materials[0].material_type, "slate");
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn transient_llm_failure_falls_back_to_rules() {
        let services = PipelineServices::new()
            .with_language(Arc::new(Scripted(Err(PipelineError::Transient("429".into())))));

        let outcome = interpret(&content("tpo membrane", vec![]), &services).await.unwrap();
        assert_eq!(
            outcome.interpretation.interpretation_method,
            InterpretationMethod::RuleBased
        );
    }
}
