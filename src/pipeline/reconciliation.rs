//! Measurement reconciliation: merging independently derived roof areas into
//! one trusted figure, plus the vision detector escalation that feeds it.

use std::collections::BTreeMap;

use tracing::{debug, instrument, warn};

use crate::config::ReconciliationConfig;
use crate::domain::{
    AreaItem, DetectedRegion, DetectionThresholds, DetectorKind, DocumentProfile, DocumentRef,
    DocumentType, Interpretation, MeasurementCandidate, MeasurementSource, Reconciliation,
    ReconciliationRecommendation, VisionDetection,
};
use crate::services::PipelineServices;

/// Confidence given to an area printed on drawings or a vendor measurement report.
const PRINTED_AREA_CONFIDENCE: f64 = 0.85;
/// Confidence given to an area found in any other kind of document.
const STATED_AREA_CONFIDENCE: f64 = 0.7;

/// Percent difference of two areas relative to the larger one.
pub fn diff_pct(a: f64, b: f64) -> f64 {
    let larger = a.max(b);
    if larger <= 0.0 {
        return 0.0;
    }
    (a - b).abs() / larger * 100.0
}

/// Reconcile measurement candidates into a single area.
///
/// The most precise source is primary. Its largest disagreement with any
/// other candidate selects the confidence tier.
pub fn reconcile(candidates: &[MeasurementCandidate], config: &ReconciliationConfig) -> Reconciliation {
    let usable: Vec<MeasurementCandidate> = candidates
        .iter()
        .filter(|c| c.total_area.is_finite() && c.total_area > 0.0)
        .cloned()
        .collect();

    let Some(primary) = usable.iter().min_by(|a, b| {
        a.source_id
            .precision_rank()
            .cmp(&b.source_id.precision_rank())
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    }) else {
        return Reconciliation {
            primary_area: None,
            primary_source: None,
            confidence: 0.0,
            recommendation: ReconciliationRecommendation::ManualReview,
            diff_pct: None,
            candidates: usable,
        };
    };

    let worst_diff = usable
        .iter()
        .filter(|c| !std::ptr::eq(*c, primary))
        .map(|c| diff_pct(primary.total_area, c.total_area))
        .fold(None, |worst: Option<f64>, d| Some(worst.map_or(d, |w| w.max(d))));

    let (confidence, recommendation) = match worst_diff {
        None => (primary.confidence.clamp(0.0, 1.0), ReconciliationRecommendation::UsePrimary),
        Some(d) => tier(d, config),
    };

    debug!(
        primary_source = %primary.source_id,
        primary_area = primary.total_area,
        candidates = usable.len(),
        diff_pct = ?worst_diff,
        confidence,
        "Measurements reconciled"
    );

    Reconciliation {
        primary_area: Some(primary.total_area),
        primary_source: Some(primary.source_id),
        confidence,
        recommendation,
        diff_pct: worst_diff,
        candidates: usable.clone(),
    }
}

fn tier(diff: f64, config: &ReconciliationConfig) -> (f64, ReconciliationRecommendation) {
    use ReconciliationRecommendation::*;
    if diff < config.agree_pct {
        (config.agree_confidence, UsePrimary)
    } else if diff < config.close_pct {
        (config.close_confidence, UsePrimary)
    } else if diff < config.divergent_pct {
        (config.divergent_confidence, ManualReview)
    } else {
        (config.conflict_confidence, ManualReview)
    }
}

/// Non-maximum suppression per feature type.
///
/// Within each type, regions are visited by descending confidence and kept
/// only if their IoU with every region already kept stays below the threshold.
pub fn non_max_suppression(regions: Vec<DetectedRegion>, iou_threshold: f64) -> Vec<DetectedRegion> {
    let mut by_type: BTreeMap<String, Vec<DetectedRegion>> = BTreeMap::new();
    for region in regions {
        by_type.entry(region.feature_type.clone()).or_default().push(region);
    }

    let mut kept_all = Vec::new();
    for (_, mut group) in by_type {
        group.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut kept: Vec<DetectedRegion> = Vec::new();
        for region in group {
            if kept.iter().all(|k| k.bbox.iou(&region.bbox) < iou_threshold) {
                kept.push(region);
            }
        }
        kept_all.extend(kept);
    }
    kept_all
}

/// Turn one detector's output into a measurement candidate.
pub fn detection_candidate(
    detection: VisionDetection,
    kind: DetectorKind,
    config: &ReconciliationConfig,
) -> Option<MeasurementCandidate> {
    let regions: Vec<DetectedRegion> = detection
        .elements
        .into_iter()
        .filter(|r| r.confidence >= config.min_detection_confidence)
        .collect();
    let kept = non_max_suppression(regions, config.nms_iou_threshold);

    let per_item_breakdown: Vec<AreaItem> = kept
        .iter()
        .filter_map(|r| {
            r.area_sqft.map(|area_sqft| AreaItem {
                label: r.feature_type.clone(),
                area_sqft,
            })
        })
        .collect();

    let total_area = detection.total_area_sqft.or_else(|| {
        (!per_item_breakdown.is_empty()).then(|| per_item_breakdown.iter().map(|i| i.area_sqft).sum())
    })?;

    (total_area.is_finite() && total_area > 0.0).then(|| MeasurementCandidate {
        source_id: kind.source(),
        total_area,
        per_item_breakdown,
        confidence: detection.confidence.clamp(0.0, 1.0),
    })
}

/// Pick between the geometric and AI detector results.
///
/// Close results favour the cheaper geometric detector; otherwise the more
/// confident one wins.
pub fn choose_detection(
    geometric: MeasurementCandidate,
    ai: MeasurementCandidate,
    config: &ReconciliationConfig,
) -> MeasurementCandidate {
    if diff_pct(geometric.total_area, ai.total_area) < config.escalation_agreement_pct {
        geometric
    } else if ai.confidence > geometric.confidence {
        ai
    } else {
        geometric
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectionOutcome {
    pub candidate: Option<MeasurementCandidate>,
    pub warnings: Vec<String>,
}

/// Run the primary detector and escalate to the secondary when its
/// confidence is too low or it fails.
#[instrument(skip_all, fields(document_id = %document.document_id))]
pub async fn detect_roof_area(
    document: &DocumentRef,
    services: &PipelineServices,
    config: &ReconciliationConfig,
) -> DetectionOutcome {
    let mut outcome = DetectionOutcome::default();
    let thresholds = DetectionThresholds {
        min_confidence: config.min_detection_confidence,
        nms_iou: config.nms_iou_threshold,
    };

    let Some(primary) = &services.vision_primary else {
        return outcome;
    };

    let primary_candidate = match primary.detect(document, &thresholds).await {
        Ok(detection) => detection_candidate(detection, primary.kind(), config),
        Err(e) => {
            warn!(error = %e, "Primary detector failed");
            outcome.warnings.push(format!("validation: primary detector failed: {}", e));
            None
        }
    };

    let escalate = primary_candidate
        .as_ref()
        .map_or(true, |c| c.confidence < config.escalation_confidence);

    let secondary_candidate = match (&services.vision_secondary, escalate) {
        (Some(secondary), true) => match secondary.detect(document, &thresholds).await {
            Ok(detection) => detection_candidate(detection, secondary.kind(), config),
            Err(e) => {
                warn!(error = %e, "Secondary detector failed");
                outcome.warnings.push(format!("validation: secondary detector failed: {}", e));
                None
            }
        },
        _ => None,
    };

    outcome.candidate = match (primary_candidate, secondary_candidate) {
        (Some(p), Some(s)) => Some(choose_detection(p, s, config)),
        (p, s) => p.or(s),
    };
    outcome
}

/// Candidate from an area printed in the document itself.
pub fn printed_area_candidate(profile: &DocumentProfile) -> Option<MeasurementCandidate> {
    let area = profile.extracted_metadata.get("roof_area")?.as_f64()?;
    let confidence = match profile.document_type {
        DocumentType::Blueprint | DocumentType::DomainVariant => PRINTED_AREA_CONFIDENCE,
        _ => STATED_AREA_CONFIDENCE,
    };
    Some(MeasurementCandidate {
        source_id: MeasurementSource::Blueprint,
        total_area: area,
        per_item_breakdown: Vec::new(),
        confidence,
    })
}

pub fn interpretation_candidate(interpretation: &Interpretation) -> Option<MeasurementCandidate> {
    let area = interpretation.area_sqft?;
    Some(MeasurementCandidate {
        source_id: MeasurementSource::Interpretation,
        total_area: area,
        per_item_breakdown: interpretation
            .measurements
            .iter()
            .filter(|m| m.unit.as_deref() == Some("sqft"))
            .map(|m| AreaItem {
                label: m.label.clone(),
                area_sqft: m.value,
            })
            .collect(),
        confidence: interpretation.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BoundingBox;

    fn candidate(source_id: MeasurementSource, total_area: f64, confidence: f64) -> MeasurementCandidate {
        MeasurementCandidate {
            source_id,
            total_area,
            per_item_breakdown: Vec::new(),
            confidence,
        }
    }

    fn region(feature: &str, x: f64, confidence: f64, area: Option<f64>) -> DetectedRegion {
        DetectedRegion {
            feature_type: feature.to_string(),
            bbox: BoundingBox { x, y: 0.0, width: 10.0, height: 10.0 },
            confidence,
            area_sqft: area,
        }
    }

    #[test]
    fn close_candidates_use_primary() {
        let config = ReconciliationConfig::default();
        let result = reconcile(
            &[
                candidate(MeasurementSource::Interpretation, 2500.0, 0.6),
                candidate(MeasurementSource::Blueprint, 2400.0, 0.85),
            ],
            &config,
        );
        assert_eq!(result.primary_area, Some(2400.0));
        assert_eq!(result.primary_source, Some(MeasurementSource::Blueprint));
        assert!((result.diff_pct.unwrap() - 4.0).abs() < 1e-9);
        assert_eq!(result.confidence, 0.95);
        assert_eq!(result.recommendation, ReconciliationRecommendation::UsePrimary);
    }

    #[test]
    fn conflicting_candidates_need_review() {
        let config = ReconciliationConfig::default();
        let result = reconcile(
            &[
                candidate(MeasurementSource::GeometricDetector, 2000.0, 0.9),
                candidate(MeasurementSource::Interpretation, 3000.0, 0.6),
            ],
            &config,
        );
        assert_eq!(result.primary_area, Some(2000.0));
        assert_eq!(result.confidence, 0.3);
        assert_eq!(result.recommendation, ReconciliationRecommendation::ManualReview);
    }

    #[test]
    fn tier_boundaries() {
        let config = ReconciliationConfig::default();
        assert_eq!(tier(10.0, &config), (0.8, ReconciliationRecommendation::UsePrimary));
        assert_eq!(tier(15.0, &config), (0.6, ReconciliationRecommendation::ManualReview));
        assert_eq!(tier(30.0, &config), (0.3, ReconciliationRecommendation::ManualReview));
    }

    #[test]
    fn single_candidate_is_trusted_as_is() {
        let result = reconcile(
            &[candidate(MeasurementSource::AiDetector, 1800.0, 0.72)],
            &ReconciliationConfig::default(),
        );
        assert_eq!(result.primary_area, Some(1800.0));
        assert_eq!(result.confidence, 0.72);
        assert_eq!(result.recommendation, ReconciliationRecommendation::UsePrimary);
        assert_eq!(result.diff_pct, None);
    }

    #[test]
    fn no_candidates_needs_review() {
        let result = reconcile(&[], &ReconciliationConfig::default());
        assert_eq!(result.primary_area, None);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.recommendation, ReconciliationRecommendation::ManualReview);
    }

    #[test]
    fn worst_disagreement_sets_the_tier() {
        let result = reconcile(
            &[
                candidate(MeasurementSource::Blueprint, 2000.0, 0.85),
                candidate(MeasurementSource::GeometricDetector, 2050.0, 0.8),
                candidate(MeasurementSource::Interpretation, 2500.0, 0.6),
            ],
            &ReconciliationConfig::default(),
        );
        assert_eq!(result.primary_area, Some(2000.0));
        assert!((result.diff_pct.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(result.recommendation, ReconciliationRecommendation::ManualReview);
    }

    #[test]
    fn nms_keeps_higher_confidence_overlap() {
        // Offset of 2.5 on 10x10 boxes gives IoU 75/125 = 0.6
        let kept = non_max_suppression(
            vec![region("roof", 2.5, 0.7, None), region("roof", 0.0, 0.9, None)],
            0.4,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn nms_never_suppresses_across_types() {
        let kept = non_max_suppression(
            vec![region("roof", 0.0, 0.9, None), region("chimney", 0.0, 0.5, None)],
            0.4,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn detection_total_falls_back_to_region_sum() {
        let detection = VisionDetection {
            elements: vec![
                region("roof_plane", 0.0, 0.9, Some(1200.0)),
                region("roof_plane", 50.0, 0.8, Some(900.0)),
                region("roof_plane", 1.0, 0.1, Some(5000.0)),
            ],
            total_area_sqft: None,
            confidence: 0.8,
        };
        let candidate =
            detection_candidate(detection, DetectorKind::Geometric, &ReconciliationConfig::default())
                .unwrap();
        assert_eq!(candidate.total_area, 2100.0);
        assert_eq!(candidate.source_id, MeasurementSource::GeometricDetector);
    }

    #[test]
    fn detector_choice() {
        let config = ReconciliationConfig::default();
        let geometric = candidate(MeasurementSource::GeometricDetector, 2000.0, 0.5);

        let agreeing = candidate(MeasurementSource::AiDetector, 2200.0, 0.9);
        assert_eq!(
            choose_detection(geometric.clone(), agreeing, &config).source_id,
            MeasurementSource::GeometricDetector
        );

        let disagreeing = candidate(MeasurementSource::AiDetector, 3000.0, 0.9);
        assert_eq!(
            choose_detection(geometric, disagreeing, &config).source_id,
            MeasurementSource::AiDetector
        );
    }
}
