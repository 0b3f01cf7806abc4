//! Document analysis: sheet index scan, metadata, document type and page routing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::RoutingConfig;
use crate::domain::{DocumentProfile, DocumentRef, DocumentType, JobOptions, MetadataValue, TocEntry};
use crate::error::PipelineError;
use crate::pipeline::json::parse_largest_object;
use crate::pipeline::strategy::{FallbackChain, Strategy};
use crate::services::{LanguageInterpretationService, PageRange, PipelineServices};

// =============================================================================
// Sheet index scan
// =============================================================================

static TOC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sheet\s+index|drawing\s+index|index\s+of\s+drawings|table\s+of\s+contents|sheet\s+list|drawing\s+list)\b").unwrap()
});

/// Roof sheets are always significant, whatever the rest of the line says.
static REQUIRED_SHEETS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^\s*(A-?\d{1,2}(?:\.\d{1,2})?)\b.*\broof\s+(?:plan|details?|framing)\b").unwrap(),
        Regex::new(r"(?i)^\s*(R-?\d{1,2}(?:\.\d{1,2})?)\b").unwrap(),
    ]
});

static TOPIC_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:roof|elevations?|details?|sections?|framing|drainage|flashing|specifications|general\s+notes)\b").unwrap()
});

static SHEET_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Z]{1,2})-?(\d{1,2})(?:\.(\d{1,2}))?\b").unwrap());

static TRAILING_PAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\.{2,}\s*|\bpage\s+|\bpg\.?\s*|\s{2,}|\t)(\d{1,3})\s*$").unwrap()
});

/// Index titles are short; long lines are body text that happens to mention a topic.
const MAX_TITLE_LINE_LEN: usize = 80;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TocScan {
    pub header_found: bool,
    pub entries: Vec<TocEntry>,
}

impl TocScan {
    pub fn relevant_pages(&self) -> BTreeSet<u32> {
        self.entries.iter().filter_map(|e| e.page_number).collect()
    }

    pub fn has_sheet_references(&self) -> bool {
        self.entries.iter().any(|e| e.sheet_reference.is_some())
    }
}

/// Scan first-page text for a sheet index and roof-relevant entries.
pub fn scan_toc(first_page: &str) -> TocScan {
    let header_found = TOC_HEADER.is_match(first_page);
    let mut entries = Vec::new();

    for line in first_page.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let required = REQUIRED_SHEETS.iter().any(|re| re.is_match(trimmed));
        let topical = trimmed.len() <= MAX_TITLE_LINE_LEN && TOPIC_TITLE.is_match(trimmed);
        if !required && !topical {
            continue;
        }

        let sheet = SHEET_REFERENCE.captures(trimmed);
        let sheet_reference = sheet.as_ref().map(|c| c[0].trim().to_string());

        let explicit_page = TRAILING_PAGE
            .captures(trimmed)
            .and_then(|c| c[1].parse::<u32>().ok())
            .filter(|p| *p > 0);
        let page_number = explicit_page.or_else(|| {
            sheet
                .as_ref()
                .and_then(|c| infer_page(&c[1], c[2].parse().ok()?))
        });

        // A topical line with nothing to route on is just prose
        if !required && sheet_reference.is_none() && page_number.is_none() {
            continue;
        }

        let title = TRAILING_PAGE.replace(trimmed, "").trim_end_matches('.').trim().to_string();
        entries.push(TocEntry {
            title,
            sheet_reference,
            page_number,
            required,
        });
    }

    TocScan { header_found, entries }
}

/// Best-effort page number from sheet numbering: general sheets first,
/// architecture early, structural later.
pub fn infer_page(discipline: &str, number: u32) -> Option<u32> {
    match discipline.to_ascii_uppercase().as_str() {
        "G" | "T" | "CS" => Some(number.max(1)),
        "A" | "R" => Some(2 + number),
        "S" => Some(10 + number),
        _ => None,
    }
}

// =============================================================================
// Project metadata
// =============================================================================

struct FieldPatterns {
    field: &'static str,
    numeric: bool,
    patterns: Vec<Regex>,
}

static METADATA_FIELDS: LazyLock<Vec<FieldPatterns>> = LazyLock::new(|| {
    let re = |p: &str| Regex::new(p).unwrap();
    vec![
        FieldPatterns {
            field: "project_name",
            numeric: false,
            patterns: vec![
                re(r"(?im)^\s*project(?:\s+name)?\s*[:\-]\s*(.+?)\s*$"),
                re(r"(?im)^\s*job(?:\s+name)?\s*:\s*(.+?)\s*$"),
            ],
        },
        FieldPatterns {
            field: "project_number",
            numeric: false,
            patterns: vec![
                re(r"(?i)\bproject\s*(?:no\.?|number|#)\s*[:#]?\s*([A-Z0-9][A-Z0-9\-]{2,})"),
                re(r"(?i)\bjob\s*(?:no\.?|number|#)\s*[:#]?\s*([A-Z0-9][A-Z0-9\-]{2,})"),
            ],
        },
        FieldPatterns {
            field: "address",
            numeric: false,
            patterns: vec![
                re(r"(?im)^\s*(?:site\s+|project\s+|property\s+)?address\s*:\s*(.+?)\s*$"),
                re(r"(?i)\b(\d{1,6}\s+[A-Za-z0-9.' ]+?\s(?:street|st|avenue|ave|road|rd|drive|dr|lane|ln|court|ct|boulevard|blvd|way)\b\.?)"),
            ],
        },
        FieldPatterns {
            field: "contact",
            numeric: false,
            patterns: vec![
                re(r"(?im)^\s*(?:architect|contact|owner|engineer|contractor)\s*:\s*(.+?)\s*$"),
                re(r"(\(?\d{3}\)?[\-.\s]\d{3}[\-.\s]\d{4})"),
            ],
        },
        FieldPatterns {
            field: "date",
            numeric: false,
            patterns: vec![
                re(r"(?i)\bdate\s*:\s*(\d{1,2}[/\-]\d{1,2}[/\-]\d{2,4})"),
                re(r"\b(\d{1,2}/\d{1,2}/\d{2,4})\b"),
                re(r"(?i)\b((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},\s*\d{4})"),
            ],
        },
        FieldPatterns {
            field: "materials",
            numeric: false,
            patterns: vec![re(
                r"(?i)\b(asphalt\s+shingles?|architectural\s+shingles?|standing\s+seam\s+metal|metal\s+roofing|clay\s+tiles?|concrete\s+tiles?|slate|tpo|epdm|modified\s+bitumen|wood\s+shakes?)\b",
            )],
        },
        FieldPatterns {
            field: "roof_area",
            numeric: true,
            patterns: vec![
                re(r"(?i)\broof\s+area\s*[:=]?\s*([\d,]+(?:\.\d+)?)\s*(?:sq\.?\s*ft|sf|square\s+feet)?"),
                re(r"(?i)\btotal\s+(?:roof\s+)?area\s*[:=]?\s*([\d,]+(?:\.\d+)?)"),
                re(r"(?i)\b([\d,]+(?:\.\d+)?)\s*(?:sq\.?\s*ft|sf|square\s+feet)\s+(?:of\s+)?roof"),
            ],
        },
    ]
});

/// Pull project metadata out of document text. Patterns are tried in order
/// per field and the first match wins.
pub fn extract_metadata(text: &str) -> BTreeMap<String, MetadataValue> {
    let mut metadata = BTreeMap::new();

    for field in METADATA_FIELDS.iter() {
        let found = field
            .patterns
            .iter()
            .find_map(|re| re.captures(text).map(|c| c[1].trim().to_string()));

        let Some(raw) = found.filter(|v| !v.is_empty()) else {
            continue;
        };

        let value = if field.numeric {
            match raw.replace(',', "").parse::<f64>() {
                Ok(n) => MetadataValue::Number(n),
                Err(_) => continue,
            }
        } else {
            MetadataValue::Text(raw)
        };
        metadata.insert(field.field.to_string(), value);
    }

    metadata
}

// =============================================================================
// Document type
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub document_type: DocumentType,
    pub confidence: f64,
    pub classifier: String,
}

pub struct ClassificationInput {
    pub filename: String,
    pub text: String,
}

const BRAND_TOKENS: &[&str] = &["eagleview", "hover", "roofr", "quickmeasure"];
const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".heic", ".tif", ".tiff", ".webp"];
const INSPECTION_KEYWORDS: &[&str] = &["inspection", "hail", "damage", "claim", "adjuster"];
const ESTIMATE_KEYWORDS: &[&str] = &["estimate", "proposal", "quote", "bid"];
const DRAWING_KEYWORDS: &[&str] = &["blueprint", "drawing", "sheet", "plan", "elevation"];

/// Deterministic keyword and filename rules. First matching rule wins.
pub fn classify_by_rules(filename: &str, text: &str) -> Classification {
    let name = filename.to_lowercase();
    let haystack = format!("{} {}", name, text.to_lowercase());
    let contains_any = |words: &[&str]| words.iter().any(|w| haystack.contains(w));

    let (document_type, confidence) = if BRAND_TOKENS.iter().any(|t| name.contains(t)) {
        (DocumentType::DomainVariant, 0.9)
    } else if IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        (DocumentType::Photo, 0.8)
    } else if contains_any(INSPECTION_KEYWORDS) {
        (DocumentType::InspectionReport, 0.7)
    } else if contains_any(ESTIMATE_KEYWORDS) {
        (DocumentType::Estimate, 0.6)
    } else if contains_any(DRAWING_KEYWORDS) {
        (DocumentType::Blueprint, 0.6)
    } else {
        (DocumentType::Unknown, 0.3)
    };

    Classification {
        document_type,
        confidence,
        classifier: RuleTableClassifier::NAME.to_string(),
    }
}

pub struct RuleTableClassifier;

impl RuleTableClassifier {
    pub const NAME: &'static str = "rule_table";
}

#[async_trait]
impl Strategy<ClassificationInput, Classification> for RuleTableClassifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn attempt(&self, input: &ClassificationInput) -> Result<Classification, PipelineError> {
        Ok(classify_by_rules(&input.filename, &input.text))
    }
}

const CLASSIFIER_SCHEMA: &str = r#"{"document_type": "blueprint | inspection_report | photo | estimate | domain_variant | unknown", "confidence": "number between 0 and 1"}"#;

/// Characters of document text sent to the language model.
const CLASSIFIER_TEXT_LIMIT: usize = 4000;

pub struct AiClassifier {
    language: Arc<dyn LanguageInterpretationService>,
}

impl AiClassifier {
    pub const NAME: &'static str = "ai_classifier";

    pub fn new(language: Arc<dyn LanguageInterpretationService>) -> Self {
        Self { language }
    }
}

#[derive(Deserialize)]
struct ClassifierReply {
    document_type: String,
    #[serde(default)]
    confidence: f64,
}

#[async_trait]
impl Strategy<ClassificationInput, Classification> for AiClassifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn attempt(&self, input: &ClassificationInput) -> Result<Classification, PipelineError> {
        let excerpt: String = input.text.chars().take(CLASSIFIER_TEXT_LIMIT).collect();
        let content = format!(
            "Classify this construction document.\nFilename: {}\n\n{}",
            input.filename, excerpt
        );

        let reply = self.language.interpret(&content, CLASSIFIER_SCHEMA).await?;
        let parsed: ClassifierReply = parse_largest_object(&reply)?;

        let document_type = DocumentType::from_label(&parsed.document_type).ok_or_else(|| {
            PipelineError::Stage(format!(
                "classifier returned label outside the closed set: {}",
                parsed.document_type
            ))
        })?;

        Ok(Classification {
            document_type,
            confidence: parsed.confidence.clamp(0.0, 1.0),
            classifier: Self::NAME.to_string(),
        })
    }
}

// =============================================================================
// Page routing
// =============================================================================

/// Pages for a reduced working document, or `None` when the full document
/// should be processed.
pub fn plan_routing(
    relevant_pages: &BTreeSet<u32>,
    total_pages: u32,
    config: &RoutingConfig,
) -> Option<Vec<u32>> {
    let in_range: BTreeSet<u32> = relevant_pages
        .iter()
        .copied()
        .filter(|p| (1..=total_pages).contains(p))
        .collect();
    if in_range.is_empty() {
        return None;
    }

    let sparse = (in_range.len() as f64) < config.min_relevant_ratio * total_pages as f64;
    if total_pages <= config.max_pages_without_routing && !sparse {
        return None;
    }

    let mut pages = in_range;
    pages.insert(config.general_notes_page.clamp(1, total_pages));

    if pages.len() as u32 >= total_pages {
        return None;
    }
    Some(pages.into_iter().collect())
}

/// Profile confidence from the index scan and metadata hits, capped at 1.0.
pub fn profile_confidence(toc: &TocScan, metadata: &BTreeMap<String, MetadataValue>) -> f64 {
    let mut score: f64 = 0.0;
    if toc.header_found {
        score += 0.3;
    }
    if !toc.relevant_pages().is_empty() {
        score += 0.3;
        if toc.has_sheet_references() {
            score += 0.1;
        }
    }
    if metadata.contains_key("roof_area") {
        score += 0.15;
    }
    if metadata.contains_key("project_name") || metadata.contains_key("project_number") {
        score += 0.15;
    }
    score.min(1.0)
}

// =============================================================================
// Analysis stage
// =============================================================================

#[derive(Debug, Clone)]
pub struct Analysis {
    pub profile: DocumentProfile,
    /// Document downstream stages should work on; reduced when routed.
    pub working_document: DocumentRef,
    /// Degraded conditions that did not stop the stage.
    pub warnings: Vec<String>,
}

/// Classify a document and decide which pages matter.
#[instrument(skip_all, fields(document_id = %document.document_id))]
pub async fn analyze(
    document: &DocumentRef,
    options: &JobOptions,
    services: &PipelineServices,
    config: &RoutingConfig,
) -> Result<Analysis, PipelineError> {
    let mut warnings = Vec::new();
    let total_pages = document.page_count.unwrap_or(1).max(1);

    let first_page = match first_page_text(document, services).await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "First page text unavailable; classifying from filename only");
            warnings.push(format!("analysis: first page text unavailable: {}", e));
            String::new()
        }
    };

    let toc = scan_toc(&first_page);
    let metadata = extract_metadata(&first_page);

    let classification = match options.document_type {
        Some(declared) => Classification {
            document_type: declared,
            confidence: 1.0,
            classifier: "declared".to_string(),
        },
        None => classify(document, &first_page, services, &mut warnings).await,
    };

    let relevant_pages = toc.relevant_pages();
    let mut working_document = document.clone();
    let mut routed = false;

    if let Some(pages) = plan_routing(&relevant_pages, total_pages, config) {
        match &services.page_splitter {
            Some(splitter) => match splitter.extract_pages(document, &pages).await {
                Ok(reduced) => {
                    info!(pages = ?pages, total_pages, "Routed to reduced working document");
                    working_document = reduced;
                    routed = true;
                }
                Err(e) => {
                    warn!(error = %e, "Page split failed; using full document");
                    warnings.push(format!("analysis: page split failed: {}", e));
                }
            },
            None => warnings.push("analysis: page splitter unavailable; using full document".to_string()),
        }
    }

    let confidence = profile_confidence(&toc, &metadata);
    debug!(
        document_type = %classification.document_type,
        classifier = %classification.classifier,
        relevant_pages = relevant_pages.len(),
        confidence,
        "Document analyzed"
    );

    Ok(Analysis {
        profile: DocumentProfile {
            document_type: classification.document_type,
            classification_confidence: classification.confidence,
            classifier: classification.classifier,
            relevant_pages,
            extracted_metadata: metadata,
            toc_entries: toc.entries,
            total_pages,
            confidence,
            routed,
        },
        working_document,
        warnings,
    })
}

async fn classify(
    document: &DocumentRef,
    first_page: &str,
    services: &PipelineServices,
    warnings: &mut Vec<String>,
) -> Classification {
    let mut chain = FallbackChain::<ClassificationInput, Classification>::new();
    if let Some(language) = &services.language {
        chain = chain.push(AiClassifier::new(language.clone()));
    }
    let chain = chain.push(RuleTableClassifier);

    let input = ClassificationInput {
        filename: document.filename.clone(),
        text: first_page.to_string(),
    };

    match chain.run(&input).await {
        Ok(outcome) => {
            warnings.extend(
                outcome
                    .failures
                    .iter()
                    .map(|f| format!("analysis: {}", f)),
            );
            outcome.value
        }
        // The rule table cannot fail
        Err(_) => classify_by_rules(&document.filename, first_page),
    }
}

async fn first_page_text(
    document: &DocumentRef,
    services: &PipelineServices,
) -> Result<String, PipelineError> {
    let mut last_error = PipelineError::Degraded("no text extractors configured".to_string());
    for extractor in &services.text_extractors {
        match extractor.extract(document, Some(PageRange::single(1))).await {
            Ok(extraction) if !extraction.text.trim().is_empty() => return Ok(extraction.text),
            Ok(_) => {
                last_error = PipelineError::Degraded(format!(
                    "{} returned no text for page 1",
                    extractor.method()
                ))
            }
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExtractionMethod;
    use crate::services::{PageSplitter, TextExtraction, TextExtractionService};
    use uuid::Uuid;

    const INDEX_PAGE: &str = "\
MAPLE COURT RESIDENCE
Project Name: Maple Court Residence
Project No: MC-2041
Address: 418 Maple Court, Springfield
Date: 03/14/2024
Roof Area: 2,450 sq ft

SHEET INDEX
G-1 COVER SHEET ......... 1
A-2.1 ROOF PLAN
A-3 EXTERIOR ELEVATIONS ......... 5
S-2 ROOF FRAMING
M-1 MECHANICAL PLAN
";

    struct StaticText(&'static str);

    #[async_trait]
    impl TextExtractionService for StaticText {
        fn method(&self) -> ExtractionMethod {
            ExtractionMethod::TextLayer
        }

        async fn extract(
            &self,
            _document: &DocumentRef,
            _pages: Option<PageRange>,
        ) -> Result<TextExtraction, PipelineError> {
            Ok(TextExtraction {
                text: self.0.to_string(),
                ..Default::default()
            })
        }
    }

    struct FailingSplitter;

    #[async_trait]
    impl PageSplitter for FailingSplitter {
        async fn extract_pages(
            &self,
            _document: &DocumentRef,
            _pages: &[u32],
        ) -> Result<DocumentRef, PipelineError> {
            Err(PipelineError::Transient("split service down".into()))
        }
    }

    struct ScriptedLanguage(&'static str);

    #[async_trait]
    impl LanguageInterpretationService for ScriptedLanguage {
        async fn interpret(&self, _content: &str, _schema: &str) -> Result<String, PipelineError> {
            Ok(self.0.to_string())
        }
    }

    fn document(filename: &str, pages: u32) -> DocumentRef {
        DocumentRef {
            document_id: Uuid::new_v4(),
            filename: filename.to_string(),
            file_path: format!("/tmp/{}", filename),
            page_count: Some(pages),
            source_pages: None,
        }
    }

    #[test]
    fn toc_scan_finds_required_and_topic_sheets() {
        let scan = scan_toc(INDEX_PAGE);
        assert!(scan.header_found);

        let roof_plan = scan.entries.iter().find(|e| e.title.contains("ROOF PLAN")).unwrap();
        assert!(roof_plan.required);
        assert_eq!(roof_plan.sheet_reference.as_deref(), Some("A-2.1"));
        // Architecture sheets start after the general sheets
        assert_eq!(roof_plan.page_number, Some(4));

        let elevations = scan.entries.iter().find(|e| e.title.contains("ELEVATIONS")).unwrap();
        assert_eq!(elevations.page_number, Some(5));

        let framing = scan.entries.iter().find(|e| e.title.contains("FRAMING")).unwrap();
        assert_eq!(framing.page_number, Some(12));

        assert!(!scan.entries.iter().any(|e| e.title.contains("MECHANICAL")));
        assert_eq!(scan.relevant_pages(), BTreeSet::from([4, 5, 12]));
    }

    #[test]
    fn metadata_first_match_wins() {
        let metadata = extract_metadata(INDEX_PAGE);
        assert_eq!(
            metadata.get("project_name").and_then(|v| v.as_str()),
            Some("Maple Court Residence")
        );
        assert_eq!(metadata.get("project_number").and_then(|v| v.as_str()), Some("MC-2041"));
        assert_eq!(metadata.get("roof_area").and_then(|v| v.as_f64()), Some(2450.0));
        assert_eq!(metadata.get("date").and_then(|v| v.as_str()), Some("03/14/2024"));
    }

    #[test]
    fn rule_table_order() {
        assert_eq!(
            classify_by_rules("EagleView_Report_123.pdf", "inspection").document_type,
            DocumentType::DomainVariant
        );
        let inspection = classify_by_rules("site.pdf", "Hail damage observed on north slope");
        assert_eq!(inspection.document_type, DocumentType::InspectionReport);
        assert_eq!(inspection.confidence, 0.7);
        assert_eq!(classify_by_rules("IMG_0042.JPG", "").document_type, DocumentType::Photo);
        let unknown = classify_by_rules("scan.pdf", "lorem ipsum");
        assert_eq!(unknown.document_type, DocumentType::Unknown);
        assert_eq!(unknown.confidence, 0.3);
    }

    #[test]
    fn routing_thresholds() {
        let config = RoutingConfig::default();
        let relevant = BTreeSet::from([4, 5]);

        // Long document: always routed, general notes page forced in
        assert_eq!(plan_routing(&relevant, 40, &config), Some(vec![2, 4, 5]));
        // Short document with dense relevant pages: not routed
        assert_eq!(plan_routing(&BTreeSet::from([1, 2, 3]), 6, &config), None);
        // Short document with sparse relevant pages: routed
        assert_eq!(plan_routing(&BTreeSet::from([9]), 12, &config), Some(vec![2, 9]));
        // Nothing relevant: nothing to route to
        assert_eq!(plan_routing(&BTreeSet::new(), 40, &config), None);
    }

    #[test]
    fn confidence_accumulates_and_caps() {
        let scan = scan_toc(INDEX_PAGE);
        let metadata = extract_metadata(INDEX_PAGE);
        // 0.3 + 0.3 + 0.1 + 0.15 + 0.15
        assert!((profile_confidence(&scan, &metadata) - 1.0).abs() < 1e-9);
        assert_eq!(profile_confidence(&TocScan::default(), &BTreeMap::new()), 0.0);
    }

    #[tokio::test]
    async fn declared_type_bypasses_classifier() {
        let services = PipelineServices::new()
            .with_text_extractor(Arc::new(StaticText("hail damage claim")))
            .with_language(Arc::new(ScriptedLanguage(r#"{"document_type":"photo","confidence":0.9}"#)));
        let options = JobOptions {
            document_type: Some(DocumentType::Blueprint),
            ..Default::default()
        };

        let analysis = analyze(&document("plans.pdf", 3), &options, &services, &RoutingConfig::default())
            .await
            .unwrap();
        assert_eq!(analysis.profile.document_type, DocumentType::Blueprint);
        assert_eq!(analysis.profile.classification_confidence, 1.0);
    }

    #[tokio::test]
    async fn invalid_ai_label_falls_back_to_rules() {
        let services = PipelineServices::new()
            .with_text_extractor(Arc::new(StaticText("Adjuster inspection notes")))
            .with_language(Arc::new(ScriptedLanguage(r#"{"document_type":"invoice","confidence":0.99}"#)));

        let analysis = analyze(
            &document("notes.pdf", 2),
            &JobOptions::default(),
            &services,
            &RoutingConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(analysis.profile.document_type, DocumentType::InspectionReport);
        assert_eq!(analysis.profile.classifier, RuleTableClassifier::NAME);
        assert_eq!(analysis.warnings.len(), 1);
    }

    #[tokio::test]
    async fn split_failure_keeps_full_document() {
        let services = PipelineServices::new()
            .with_text_extractor(Arc::new(StaticText(INDEX_PAGE)))
            .with_page_splitter(Arc::new(FailingSplitter));
        let doc = document("plans.pdf", 40);

        let analysis = analyze(&doc, &JobOptions::default(), &services, &RoutingConfig::default())
            .await
            .unwrap();
        assert!(!analysis.profile.routed);
        assert_eq!(analysis.working_document, doc);
        assert!(analysis.warnings.iter().any(|w| w.contains("page split failed")));
    }
}
