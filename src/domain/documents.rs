use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed label set for document classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Blueprint,
    InspectionReport,
    Photo,
    Estimate,
    /// Vendor measurement report (aerial roof report products).
    DomainVariant,
    Unknown,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::Blueprint,
        DocumentType::InspectionReport,
        DocumentType::Photo,
        DocumentType::Estimate,
        DocumentType::DomainVariant,
        DocumentType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Blueprint => "blueprint",
            DocumentType::InspectionReport => "inspection_report",
            DocumentType::Photo => "photo",
            DocumentType::Estimate => "estimate",
            DocumentType::DomainVariant => "domain_variant",
            DocumentType::Unknown => "unknown",
        }
    }

    /// Parse a label from the closed set. Anything else is rejected.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
    }
}

impl Default for DocumentType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document registered by the upload layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: Uuid,
    pub filename: String,
    pub file_path: String,
    pub mime_type: String,
    pub page_count: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl StoredDocument {
    pub fn to_ref(&self) -> DocumentRef {
        DocumentRef {
            document_id: self.id,
            filename: self.filename.clone(),
            file_path: self.file_path.clone(),
            page_count: self.page_count.and_then(|n| u32::try_from(n).ok()),
            source_pages: None,
        }
    }
}

/// Working-document handle passed to collaborators.
///
/// After page routing `file_path` points at the reduced document and
/// `source_pages` maps its pages back to the original page numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRef {
    pub document_id: Uuid,
    pub filename: String,
    pub file_path: String,
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pages: Option<Vec<u32>>,
}

/// One entry found by the sheet index scan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TocEntry {
    pub title: String,
    pub sheet_reference: Option<String>,
    pub page_number: Option<u32>,
    /// Matched a required sheet-code pattern rather than a topic keyword.
    pub required: bool,
}

/// Free-form metadata value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Number(n) => Some(*n),
            MetadataValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            MetadataValue::Number(_) => None,
        }
    }
}

/// Output of the analysis stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentProfile {
    pub document_type: DocumentType,
    pub classification_confidence: f64,
    /// Name of the classifier strategy that produced `document_type`.
    pub classifier: String,
    pub relevant_pages: BTreeSet<u32>,
    pub extracted_metadata: BTreeMap<String, MetadataValue>,
    pub toc_entries: Vec<TocEntry>,
    pub total_pages: u32,
    /// Profile confidence from the index scan and metadata hits.
    pub confidence: f64,
    /// Whether downstream stages work on a reduced document.
    pub routed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_outside_the_closed_set_are_rejected() {
        assert_eq!(
            DocumentType::from_label("Inspection Report"),
            Some(DocumentType::InspectionReport)
        );
        assert_eq!(DocumentType::from_label("blueprint"), Some(DocumentType::Blueprint));
        assert_eq!(DocumentType::from_label("invoice"), None);
    }

    #[test]
    fn metadata_values_serialize_untagged() {
        let json = serde_json::to_string(&MetadataValue::Number(2450.0)).unwrap();
        assert_eq!(json, "2450.0");
        let text: MetadataValue = serde_json::from_str("\"Maple Court\"").unwrap();
        assert_eq!(text.as_str(), Some("Maple Court"));
    }
}
