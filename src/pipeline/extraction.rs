//! Text extraction with fallback from layout-aware OCR to the plain text layer.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::domain::{DocumentRef, ExtractedContent, ExtractionMethod, RawMeasurement};
use crate::error::PipelineError;
use crate::pipeline::strategy::{FallbackChain, Strategy};
use crate::services::{PipelineServices, TextExtraction, TextExtractionService};

static AREA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([\d,]*\d(?:\.\d+)?)\s*(?:sq\.?\s*ft\.?|sqft|square\s+f(?:ee|oo)t|sf)\b").unwrap()
});
static SQUARES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*squares?\b").unwrap());
/// A unit word after "square" makes it an area, not a count of squares.
static LENGTH_UNIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:feet|foot|ft)\b").unwrap());
static PITCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})\s*(?:/|:|\s+in\s+)\s*12\b").unwrap());

const MAX_LABEL_LEN: usize = 40;
/// One roofing square covers 100 square feet.
const SQFT_PER_SQUARE: f64 = 100.0;

struct ExtractorStrategy {
    service: Arc<dyn TextExtractionService>,
}

#[async_trait]
impl Strategy<DocumentRef, (ExtractionMethod, TextExtraction)> for ExtractorStrategy {
    fn name(&self) -> &str {
        self.service.method().as_str()
    }

    async fn attempt(
        &self,
        document: &DocumentRef,
    ) -> Result<(ExtractionMethod, TextExtraction), PipelineError> {
        let extraction = self.service.extract(document, None).await?;
        if extraction.text.trim().is_empty() {
            return Err(PipelineError::Degraded("extractor returned no text".to_string()));
        }
        Ok((self.service.method(), extraction))
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub content: ExtractedContent,
    pub warnings: Vec<String>,
}

/// Run the text extractors in order and normalize the first usable output.
///
/// When every extractor comes back empty the stage still succeeds with empty
/// content; any other exhausted chain is an error.
#[instrument(skip_all, fields(document_id = %document.document_id))]
pub async fn extract_content(
    document: &DocumentRef,
    services: &PipelineServices,
) -> Result<ExtractionOutcome, PipelineError> {
    let chain = services
        .text_extractors
        .iter()
        .fold(FallbackChain::<DocumentRef, (ExtractionMethod, TextExtraction)>::new(), |chain, service| {
            chain.push(ExtractorStrategy { service: service.clone() })
        });

    match chain.run(document).await {
        Ok(outcome) => {
            let (method, extraction) = outcome.value;
            let content = normalize(method, extraction);
            info!(
                method = %method,
                chars = content.text.len(),
                measurements = content.raw_measurements.len(),
                "Text extracted"
            );
            Ok(ExtractionOutcome {
                content,
                warnings: outcome
                    .failures
                    .iter()
                    .map(|f| format!("extraction: {}", f))
                    .collect(),
            })
        }
        Err(exhausted) if exhausted.all_degraded() || exhausted.failures.is_empty() => {
            warn!("No extractor produced text; continuing with empty content");
            let mut warnings: Vec<String> = exhausted
                .messages()
                .into_iter()
                .map(|m| format!("extraction: {}", m))
                .collect();
            warnings.push("extraction: no text could be extracted".to_string());
            Ok(ExtractionOutcome {
                content: ExtractedContent::empty(),
                warnings,
            })
        }
        Err(exhausted) => Err(exhausted.into_error("extraction")),
    }
}

fn normalize(method: ExtractionMethod, extraction: TextExtraction) -> ExtractedContent {
    let confidence = extraction.confidence.clamp(0.0, 1.0);
    let raw_measurements = parse_measurements(&extraction.text, method, confidence);

    ExtractedContent {
        text: extraction.text,
        tables: extraction.tables,
        entities: extraction.entities,
        raw_measurements,
        extraction_method: method,
        confidence,
    }
}

/// Read areas, roofing squares and pitches out of free text.
pub fn parse_measurements(
    text: &str,
    method: ExtractionMethod,
    confidence: f64,
) -> Vec<RawMeasurement> {
    let mut measurements = Vec::new();
    let source_method = method.as_str().to_string();

    for line in text.lines() {
        let mut area_spans = Vec::new();
        for caps in AREA.captures_iter(line) {
            let Some(whole) = caps.get(0) else { continue };
            area_spans.push(whole.range());
            let Some(value) = parse_number(&caps[1]) else { continue };
            let start = whole.start();
            measurements.push(RawMeasurement {
                label: label_before(line, start).unwrap_or_else(|| "area".to_string()),
                value,
                unit: "sqft".to_string(),
                confidence,
                source_method: source_method.clone(),
            });
        }

        for caps in SQUARES.captures_iter(line) {
            let Some(whole) = caps.get(0) else { continue };
            let overlaps_area = area_spans
                .iter()
                .any(|span| whole.start() < span.end && span.start < whole.end());
            if overlaps_area
                || follows_number(line, whole.start())
                || LENGTH_UNIT.is_match(&line[whole.end()..])
            {
                continue;
            }
            let Some(squares) = parse_number(&caps[1]) else { continue };
            measurements.push(RawMeasurement {
                label: "squares".to_string(),
                value: squares * SQFT_PER_SQUARE,
                unit: "sqft".to_string(),
                confidence,
                source_method: source_method.clone(),
            });
        }

        for caps in PITCH.captures_iter(line) {
            let Some(whole) = caps.get(0) else { continue };
            if is_date_fragment(line, whole.start(), whole.end()) {
                continue;
            }
            let Some(rise) = parse_number(&caps[1]) else { continue };
            measurements.push(RawMeasurement {
                label: "pitch".to_string(),
                value: rise,
                unit: "in/12".to_string(),
                confidence,
                source_method: source_method.clone(),
            });
        }
    }

    measurements
}

/// True when the match continues a number such as the "800" in "1,800".
fn follows_number(line: &str, start: usize) -> bool {
    line[..start]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_digit() || c == ',' || c == '.')
}

/// "11/12/2024" and "2024/11/12" contain an `N/12` that is not a pitch.
fn is_date_fragment(line: &str, start: usize, end: usize) -> bool {
    let date_char = |c: char| c.is_ascii_digit() || c == '/' || c == '-' || c == '.';
    let before = line[..start].chars().next_back().is_some_and(date_char);
    let after = line[end..].chars().next().is_some_and(date_char);
    before || after
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok().filter(|v| v.is_finite())
}

/// The words preceding a measurement on its line, used as its label.
fn label_before(line: &str, end: usize) -> Option<String> {
    let prefix = line[..end].trim_end_matches(|c: char| c.is_whitespace() || ":=-".contains(c));
    let words: Vec<&str> = prefix.split_whitespace().collect();
    let mut label = String::new();
    for word in words.iter().rev() {
        if label.len() + word.len() + 1 > MAX_LABEL_LEN {
            break;
        }
        label = if label.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", word, label)
        };
    }
    let label = label.to_lowercase();
    (!label.is_empty()).then_some(label)
}
