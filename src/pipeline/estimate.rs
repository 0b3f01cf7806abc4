//! Estimate synthesis: cost, quality score, timeline and sanity checks.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::config::{EstimateConfig, MaterialRate};
use crate::domain::{
    CostBreakdown, ExtractionMethod, FeatureImpact, Interpretation, Reconciliation,
    ReconciliationRecommendation, ValidatedEstimate,
};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;
const QUALITY_CAP: f64 = 10.0;
/// Pitch rise (per 12) from which a roof counts as steep.
const STEEP_PITCH: f64 = 8.0;

/// Compound the cost model for `area_sqft` of `material`.
///
/// `base = area * (material + labor)`, `subtotal = base * (1 + overhead%)`,
/// profit and contingency are both taken on the subtotal.
pub fn compute_cost(area_sqft: f64, material: &str, config: &EstimateConfig) -> Option<CostBreakdown> {
    let area = Decimal::from_f64(area_sqft)?.round_dp(2);
    let MaterialRate { material: material_rate, labor: labor_rate } = config.rate_for(material);

    let base_cost = area * (material_rate + labor_rate);
    let subtotal = base_cost * (Decimal::ONE + config.overhead_pct / HUNDRED);
    let profit = subtotal * config.profit_pct / HUNDRED;
    let contingency = subtotal * config.contingency_pct / HUNDRED;
    let final_cost = subtotal + profit + contingency;

    Some(CostBreakdown {
        primary_material: material.to_string(),
        area_sqft: area,
        material_rate,
        labor_rate,
        base_cost: base_cost.round_dp(2),
        subtotal: subtotal.round_dp(2),
        profit: profit.round_dp(2),
        contingency: contingency.round_dp(2),
        final_cost: final_cost.round_dp(2),
    })
}

/// Most frequently mentioned material; ties go to the first one seen.
pub fn primary_material(interpretation: &Interpretation, config: &EstimateConfig) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for material in &interpretation.materials {
        match counts.iter_mut().find(|(name, _)| *name == material.material_type) {
            Some((_, count)) => *count += 1,
            None => counts.push((material.material_type.as_str(), 1)),
        }
    }

    // max_by_key returns the last maximum, so walk in reverse to keep the first
    counts
        .iter()
        .rev()
        .max_by_key(|(_, count)| *count)
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| config.default_material.clone())
}

pub fn quality_score(
    confidence: f64,
    interpretation: &Interpretation,
    has_area: bool,
    extraction_method: ExtractionMethod,
) -> f64 {
    let mut score = confidence.clamp(0.0, 1.0) * 3.0;
    if has_area {
        score += 2.0;
    }
    if !interpretation.materials.is_empty() {
        score += 1.0;
    }
    if !interpretation.measurements.is_empty() {
        score += 1.0;
    }
    score += if extraction_method.is_high_fidelity() { 1.5 } else { 0.5 };
    score += if interpretation.interpretation_method.is_ai() { 1.0 } else { 0.5 };

    (score.min(QUALITY_CAP) * 100.0).round() / 100.0
}

fn base_days(area_sqft: Option<f64>) -> u32 {
    match area_sqft {
        Some(a) if a >= 10_000.0 => 10,
        Some(a) if a >= 5_000.0 => 7,
        Some(a) if a >= 2_000.0 => 4,
        _ => 2,
    }
}

pub fn timeline(area_sqft: Option<f64>, interpretation: &Interpretation) -> String {
    let mut days = base_days(area_sqft) + interpretation.special_requirements.len() as u32;
    if interpretation.has_high_damage() {
        days += 2;
    }
    format!("{}-{} business days", days, days + 2)
}

/// Site conditions that make the job harder than a plain re-roof.
pub fn complexity_factors(interpretation: &Interpretation) -> Vec<String> {
    let mut factors = Vec::new();

    if let Some(rise) = interpretation.pitch.as_deref().and_then(pitch_rise) {
        if rise >= STEEP_PITCH {
            factors.push(format!("steep pitch ({}/12)", rise));
        }
    }
    for feature in &interpretation.detected_features {
        if feature.impact != FeatureImpact::Low {
            factors.push(format!("{} x{}", feature.feature_type, feature.count));
        }
    }
    if interpretation.has_high_damage() {
        factors.push("high damage".to_string());
    }
    factors.extend(interpretation.special_requirements.iter().cloned());
    factors
}

fn pitch_rise(pitch: &str) -> Option<f64> {
    pitch.split('/').next()?.trim().parse().ok()
}

fn recommendations(
    primary: &str,
    cost: Option<&CostBreakdown>,
    interpretation: &Interpretation,
    reconciliation: &Reconciliation,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if let Some(cost) = cost {
        recommendations.push(format!(
            "{} at {} per sqft installed (material {} + labor {})",
            primary.replace('_', " "),
            cost.material_rate + cost.labor_rate,
            cost.material_rate,
            cost.labor_rate
        ));
    }
    if reconciliation.recommendation == ReconciliationRecommendation::ManualReview {
        recommendations.push("Verify roof area on site before quoting".to_string());
    }
    if interpretation.has_high_damage() {
        recommendations.push("Inspect decking for replacement before installation".to_string());
    }
    let penetrations: u32 = interpretation
        .detected_features
        .iter()
        .filter(|f| matches!(f.feature_type.as_str(), "chimney" | "skylight" | "vent"))
        .map(|f| f.count)
        .sum();
    if penetrations > 0 {
        recommendations.push(format!("Include flashing for {} roof penetrations", penetrations));
    }

    recommendations
}

/// Build the validated estimate from reconciled measurements and interpretation.
pub fn synthesize(
    reconciliation: Reconciliation,
    interpretation: &Interpretation,
    extraction_method: ExtractionMethod,
    config: &EstimateConfig,
) -> ValidatedEstimate {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let area = reconciliation.primary_area;
    let primary = primary_material(interpretation, config);
    let cost_breakdown = area.and_then(|a| compute_cost(a, &primary, config));

    let confidence = if area.is_some() {
        reconciliation.confidence
    } else {
        interpretation.confidence
    };

    match area {
        None => errors.push("No roof area could be determined".to_string()),
        Some(a) if a < config.min_plausible_area || a > config.max_plausible_area => {
            warnings.push(format!(
                "Roof area {:.0} sqft is outside the expected range {:.0}-{:.0}",
                a, config.min_plausible_area, config.max_plausible_area
            ));
        }
        Some(_) => {}
    }
    if interpretation.materials.is_empty() {
        warnings.push(format!(
            "No materials identified; assuming {}",
            config.default_material.replace('_', " ")
        ));
    }
    if confidence < config.low_confidence {
        warnings.push(format!("Low confidence estimate ({:.2})", confidence));
    }

    ValidatedEstimate {
        quality_score: quality_score(confidence, interpretation, area.is_some(), extraction_method),
        timeline: timeline(area, interpretation),
        material_recommendations: recommendations(
            &primary,
            cost_breakdown.as_ref(),
            interpretation,
            &reconciliation,
        ),
        reconciliation_recommendation: reconciliation.recommendation,
        validated_measurements: reconciliation,
        cost_breakdown,
        primary_material: primary,
        warnings,
        errors,
    }
}
