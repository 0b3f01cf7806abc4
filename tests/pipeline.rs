//! End-to-end pipeline runs with scripted collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use roofscope_pipeline::config::{PipelineConfig, ReconciliationConfig};
use roofscope_pipeline::domain::{
    BoundingBox, DetectedRegion, DetectionThresholds, DetectorKind, DocumentRef, DocumentType,
    ExtractionMethod, InterpretationMethod, JobOptions, MeasurementCandidate, MeasurementSource,
    PipelineStage, PipelineState, ProcessingMode, ReconciliationRecommendation, VisionDetection,
};
use roofscope_pipeline::error::PipelineError;
use roofscope_pipeline::pipeline::reconciliation::{detect_roof_area, non_max_suppression, reconcile};
use roofscope_pipeline::pipeline::{PipelineController, PipelineRunner};
use roofscope_pipeline::services::{
    LanguageInterpretationService, PageRange, PipelineServices, TextExtraction,
    TextExtractionService, VisionDetectionService,
};

const PLAN_TEXT: &str = "Sheet A-2.1 Roof Plan\n\
    Project: Maple Street Residence\n\
    Roof area: 2,400 sq ft\n\
    Architectural shingles over synthetic underlayment. Pitch 6/12.\n";

struct TextLayer(Result<&'static str, PipelineError>);

#[async_trait]
impl TextExtractionService for TextLayer {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::TextLayer
    }

    async fn extract(
        &self,
        _document: &DocumentRef,
        _pages: Option<PageRange>,
    ) -> Result<TextExtraction, PipelineError> {
        self.0.clone().map(|text| TextExtraction {
            text: text.to_string(),
            confidence: 0.9,
            ..Default::default()
        })
    }
}

/// Answers classification prompts and interpretation prompts separately.
struct ChattyModel {
    interpretation_reply: &'static str,
}

#[async_trait]
impl LanguageInterpretationService for ChattyModel {
    async fn interpret(&self, _content: &str, schema_hint: &str) -> Result<String, PipelineError> {
        if schema_hint.contains("document_type") {
            return Ok(r#"Looks like {"document_type": "blueprint", "confidence": 0.92}"#.to_string());
        }
        Ok(self.interpretation_reply.to_string())
    }
}

struct Detector {
    kind: DetectorKind,
    result: Result<VisionDetection, PipelineError>,
    calls: AtomicUsize,
}

#[async_trait]
impl VisionDetectionService for Detector {
    fn kind(&self) -> DetectorKind {
        self.kind
    }

    async fn detect(
        &self,
        _document: &DocumentRef,
        _thresholds: &DetectionThresholds,
    ) -> Result<VisionDetection, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

fn region(x: f64, confidence: f64) -> DetectedRegion {
    DetectedRegion {
        feature_type: "roof_plane".to_string(),
        bbox: BoundingBox {
            x,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        },
        confidence,
        area_sqft: Some(1250.0),
    }
}

fn geometric_detector() -> Arc<Detector> {
    Arc::new(Detector {
        kind: DetectorKind::Geometric,
        result: Ok(VisionDetection {
            elements: vec![region(0.0, 0.9), region(40.0, 0.85)],
            total_area_sqft: Some(2500.0),
            confidence: 0.9,
        }),
        calls: AtomicUsize::new(0),
    })
}

fn detector(kind: DetectorKind, total_area: f64, confidence: f64) -> Arc<Detector> {
    Arc::new(Detector {
        kind,
        result: Ok(VisionDetection {
            elements: Vec::new(),
            total_area_sqft: Some(total_area),
            confidence,
        }),
        calls: AtomicUsize::new(0),
    })
}

fn failing_detector(kind: DetectorKind) -> Arc<Detector> {
    Arc::new(Detector {
        kind,
        result: Err(PipelineError::Transient("detector timed out".into())),
        calls: AtomicUsize::new(0),
    })
}

fn document() -> DocumentRef {
    DocumentRef {
        document_id: Uuid::new_v4(),
        filename: "roof_plan.pdf".to_string(),
        file_path: "/tmp/roof_plan.pdf".to_string(),
        page_count: Some(4),
        source_pages: None,
    }
}

fn candidate(source: MeasurementSource, area: f64) -> MeasurementCandidate {
    MeasurementCandidate {
        source_id: source,
        total_area: area,
        per_item_breakdown: Vec::new(),
        confidence: 0.8,
    }
}

#[tokio::test]
async fn full_run_reconciles_printed_detected_and_interpreted_areas() {
    let detector = geometric_detector();
    let services = PipelineServices::new()
        .with_text_extractor(Arc::new(TextLayer(Ok(PLAN_TEXT))))
        .with_language(Arc::new(ChattyModel {
            interpretation_reply: r#"Here you go:
                {"area_sqft": 2450, "pitch": "6/12",
                 "materials": [{"type": "Architectural Shingles"}],
                 "confidence": 0.9}
                Let me know if you need more."#,
        }))
        .with_vision(detector.clone(), None);
    let controller = PipelineController::new(services, PipelineConfig::default());

    let result = controller.run(&document(), &JobOptions::default()).await;
    assert!(result.is_completed(), "errors: {:?}", result.errors);
    assert_eq!(result.stages_completed, PipelineStage::ORDER.to_vec());
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);

    let profile = result.outputs.profile.unwrap();
    assert_eq!(profile.document_type, DocumentType::Blueprint);

    let interpretation = result.outputs.interpretation.unwrap();
    assert_eq!(interpretation.interpretation_method, InterpretationMethod::Llm);

    let estimate = result.outputs.estimate.unwrap();
    let measured = &estimate.validated_measurements;
    assert_eq!(measured.primary_source, Some(MeasurementSource::Blueprint));
    assert_eq!(measured.primary_area, Some(2400.0));
    assert_eq!(measured.recommendation, ReconciliationRecommendation::UsePrimary);
    assert_eq!(measured.candidates.len(), 3);
    assert!(estimate.cost_breakdown.is_some());
}

#[tokio::test]
async fn fast_mode_skips_vision_detection() {
    let detector = geometric_detector();
    let services = PipelineServices::new()
        .with_text_extractor(Arc::new(TextLayer(Ok(PLAN_TEXT))))
        .with_vision(detector.clone(), None);
    let controller = PipelineController::new(services, PipelineConfig::default());

    let options = JobOptions {
        mode: ProcessingMode::Fast,
        ..Default::default()
    };
    let result = controller.run(&document(), &options).await;
    assert!(result.is_completed());
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unparseable_model_reply_falls_back_to_rules() {
    let services = PipelineServices::new()
        .with_text_extractor(Arc::new(TextLayer(Ok(PLAN_TEXT))))
        .with_language(Arc::new(ChattyModel {
            interpretation_reply: "I could not find any roofing information, sorry.",
        }));
    let controller = PipelineController::new(services, PipelineConfig::default());

    let result = controller.run(&document(), &JobOptions::default()).await;
    assert!(result.is_completed());
    let interpretation = result.outputs.interpretation.unwrap();
    assert_eq!(interpretation.interpretation_method, InterpretationMethod::RuleBased);
    assert!(result.warnings.iter().any(|w| w.contains("llm")));
}

#[tokio::test]
async fn declared_document_type_bypasses_classification() {
    let services = PipelineServices::new().with_text_extractor(Arc::new(TextLayer(Ok(PLAN_TEXT))));
    let controller = PipelineController::new(services, PipelineConfig::default());

    let options = JobOptions {
        document_type: Some(DocumentType::InspectionReport),
        ..Default::default()
    };
    let result = controller.run(&document(), &options).await;
    let profile = result.outputs.profile.unwrap();
    assert_eq!(profile.document_type, DocumentType::InspectionReport);
    assert_eq!(profile.classification_confidence, 1.0);
}

#[tokio::test]
async fn completed_stages_are_always_a_prefix() {
    let scenarios: Vec<Result<&'static str, PipelineError>> = vec![
        Ok(PLAN_TEXT),
        Ok(""),
        Err(PipelineError::Stage("corrupt".into())),
        Err(PipelineError::Transient("timeout".into())),
        Err(PipelineError::Fatal("bad credentials".into())),
    ];

    for scenario in scenarios {
        let services = PipelineServices::new().with_text_extractor(Arc::new(TextLayer(scenario)));
        let controller = PipelineController::new(services, PipelineConfig::default());
        let result = controller.run(&document(), &JobOptions::default()).await;

        let n = result.stages_completed.len();
        assert_eq!(result.stages_completed, PipelineStage::ORDER[..n].to_vec());
        match result.state {
            PipelineState::Completed => assert_eq!(n, PipelineStage::ORDER.len()),
            PipelineState::Failed => {
                assert!(n < PipelineStage::ORDER.len());
                assert_eq!(result.errors.len(), 1);
            }
            other => panic!("run ended in non-terminal state {:?}", other),
        }
    }
}

#[tokio::test]
async fn square_feet_and_dates_do_not_inflate_the_estimate() {
    let text = "Roof Inspection Report\n\
        House measures 1,800 square feet\n\
        Inspection date: 11/12/2024\n\
        Asphalt shingles in fair condition.\n";
    let services = PipelineServices::new().with_text_extractor(Arc::new(TextLayer(Ok(text))));
    let controller = PipelineController::new(services, PipelineConfig::default());

    let result = controller.run(&document(), &JobOptions::default()).await;
    assert!(result.is_completed(), "errors: {:?}", result.errors);
    let interpretation = result.outputs.interpretation.unwrap();
    assert_eq!(interpretation.area_sqft, Some(1800.0));
    assert_eq!(interpretation.pitch, None);
}

async fn detect_with(
    primary: Arc<Detector>,
    secondary: Arc<Detector>,
) -> roofscope_pipeline::pipeline::reconciliation::DetectionOutcome {
    let services = PipelineServices::new().with_vision(primary, Some(secondary));
    detect_roof_area(&document(), &services, &ReconciliationConfig::default()).await
}

#[tokio::test]
async fn confident_primary_detector_is_not_escalated() {
    let primary = detector(DetectorKind::Geometric, 2400.0, 0.85);
    let secondary = detector(DetectorKind::Ai, 3600.0, 0.95);

    let outcome = detect_with(primary.clone(), secondary.clone()).await;
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    let chosen = outcome.candidate.unwrap();
    assert_eq!(chosen.source_id, MeasurementSource::GeometricDetector);
    assert_eq!(chosen.total_area, 2400.0);
}

#[tokio::test]
async fn low_confidence_primary_escalates_to_the_secondary() {
    // Far apart: the more confident detector wins
    let primary = detector(DetectorKind::Geometric, 2400.0, 0.5);
    let secondary = detector(DetectorKind::Ai, 3600.0, 0.9);
    let outcome = detect_with(primary.clone(), secondary.clone()).await;
    assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    let chosen = outcome.candidate.unwrap();
    assert_eq!(chosen.source_id, MeasurementSource::AiDetector);
    assert_eq!(chosen.total_area, 3600.0);

    // Close together: the geometric result is kept
    let primary = detector(DetectorKind::Geometric, 2400.0, 0.5);
    let secondary = detector(DetectorKind::Ai, 2450.0, 0.9);
    let outcome = detect_with(primary, secondary.clone()).await;
    assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcome.candidate.unwrap().source_id,
        MeasurementSource::GeometricDetector
    );
}

#[tokio::test]
async fn failed_primary_detector_falls_through_to_the_secondary() {
    let primary = failing_detector(DetectorKind::Geometric);
    let secondary = detector(DetectorKind::Ai, 2600.0, 0.8);

    let outcome = detect_with(primary.clone(), secondary.clone()).await;
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    let chosen = outcome.candidate.unwrap();
    assert_eq!(chosen.source_id, MeasurementSource::AiDetector);
    assert_eq!(chosen.total_area, 2600.0);
    assert!(outcome.warnings.iter().any(|w| w.contains("primary detector failed")));
}

/// Records lifecycle hook calls; `init` fails when `unready` is set.
struct Hooked {
    unready: bool,
    inits: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl Hooked {
    fn new(unready: bool) -> Arc<Self> {
        Arc::new(Self {
            unready,
            inits: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    fn start(&self) -> Result<(), PipelineError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.unready {
            return Err(PipelineError::Transient("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LanguageInterpretationService for Hooked {
    async fn interpret(&self, _content: &str, _schema_hint: &str) -> Result<String, PipelineError> {
        Ok("{}".to_string())
    }

    async fn init(&self) -> Result<(), PipelineError> {
        self.start()
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VisionDetectionService for Hooked {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Geometric
    }

    async fn detect(
        &self,
        _document: &DocumentRef,
        _thresholds: &DetectionThresholds,
    ) -> Result<VisionDetection, PipelineError> {
        Err(PipelineError::Degraded("no regions".into()))
    }

    async fn init(&self) -> Result<(), PipelineError> {
        self.start()
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn lifecycle_hooks_reach_every_service() {
    let language = Hooked::new(false);
    let vision = Hooked::new(true);
    let services = PipelineServices::new()
        .with_text_extractor(Arc::new(TextLayer(Ok(PLAN_TEXT))))
        .with_language(language.clone())
        .with_vision(vision.clone(), None);

    let failures = services.init().await;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].starts_with("primary detector"), "{:?}", failures);
    assert_eq!(language.inits.load(Ordering::SeqCst), 1);
    assert_eq!(vision.inits.load(Ordering::SeqCst), 1);

    services.shutdown().await;
    assert_eq!(language.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(vision.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn reconciliation_tiers_follow_worst_disagreement() {
    let config = ReconciliationConfig::default();

    let close = reconcile(
        &[
            candidate(MeasurementSource::Blueprint, 2400.0),
            candidate(MeasurementSource::GeometricDetector, 2500.0),
        ],
        &config,
    );
    assert_eq!(close.recommendation, ReconciliationRecommendation::UsePrimary);
    assert_eq!(close.confidence, 0.95);
    assert!((close.diff_pct.unwrap() - 4.0).abs() < 1e-9);

    let conflicting = reconcile(
        &[
            candidate(MeasurementSource::Blueprint, 2000.0),
            candidate(MeasurementSource::AiDetector, 3000.0),
        ],
        &config,
    );
    assert_eq!(conflicting.recommendation, ReconciliationRecommendation::ManualReview);
    assert_eq!(conflicting.confidence, 0.3);
}

#[test]
fn overlapping_regions_keep_the_most_confident() {
    // Overlap 75 of union 125 gives IoU 0.6
    let kept = non_max_suppression(vec![region(2.5, 0.7), region(0.0, 0.9)], 0.4);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].confidence, 0.9);
}
