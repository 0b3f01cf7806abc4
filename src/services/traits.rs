//! Collaborator contracts used by the pipeline stages.
//!
//! Every OCR, vision and language provider sits behind one of these traits so
//! stages can be driven by the HTTP adapters in production and by mocks in
//! tests. Each trait carries `init`/`shutdown` hooks that default to no-ops;
//! `PipelineServices` drives them for the whole set.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tracing::{info, warn};
use serde::{Deserialize, Serialize};

use crate::domain::{
    DetectionThresholds, DetectorKind, DocumentRef, ExtractedEntity, ExtractedTable,
    ExtractionMethod, VisionDetection,
};
use crate::error::PipelineError;

/// Inclusive, 1-based page range
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    pub fn single(page: u32) -> Self {
        Self { first: page, last: page }
    }
}

/// Raw output of a text extraction provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextExtraction {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tables: Vec<ExtractedTable>,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub confidence: f64,
}

#[async_trait]
pub trait TextExtractionService: Send + Sync {
    /// Which extraction path this provider represents.
    fn method(&self) -> ExtractionMethod;

    async fn extract(
        &self,
        document: &DocumentRef,
        pages: Option<PageRange>,
    ) -> Result<TextExtraction, PipelineError>;

    async fn init(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[async_trait]
pub trait VisionDetectionService: Send + Sync {
    fn kind(&self) -> DetectorKind;

    async fn detect(
        &self,
        document: &DocumentRef,
        thresholds: &DetectionThresholds,
    ) -> Result<VisionDetection, PipelineError>;

    async fn init(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[async_trait]
pub trait LanguageInterpretationService: Send + Sync {
    /// Returns free text that is expected to embed a JSON object.
    async fn interpret(&self, content: &str, schema_hint: &str) -> Result<String, PipelineError>;

    async fn init(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[async_trait]
pub trait PageSplitter: Send + Sync {
    /// Produce a reduced document holding only `pages` of the original.
    async fn extract_pages(
        &self,
        document: &DocumentRef,
        pages: &[u32],
    ) -> Result<DocumentRef, PipelineError>;

    async fn init(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Explicitly constructed collaborator set handed to the pipeline.
///
/// Text extractors are tried in order; the first is the high-fidelity path.
#[derive(Clone, Default)]
pub struct PipelineServices {
    pub text_extractors: Vec<Arc<dyn TextExtractionService>>,
    pub language: Option<Arc<dyn LanguageInterpretationService>>,
    pub vision_primary: Option<Arc<dyn VisionDetectionService>>,
    pub vision_secondary: Option<Arc<dyn VisionDetectionService>>,
    pub page_splitter: Option<Arc<dyn PageSplitter>>,
}

impl PipelineServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text_extractor(mut self, extractor: Arc<dyn TextExtractionService>) -> Self {
        self.text_extractors.push(extractor);
        self
    }

    pub fn with_language(mut self, language: Arc<dyn LanguageInterpretationService>) -> Self {
        self.language = Some(language);
        self
    }

    pub fn with_vision(
        mut self,
        primary: Arc<dyn VisionDetectionService>,
        secondary: Option<Arc<dyn VisionDetectionService>>,
    ) -> Self {
        self.vision_primary = Some(primary);
        self.vision_secondary = secondary;
        self
    }

    pub fn with_page_splitter(mut self, splitter: Arc<dyn PageSplitter>) -> Self {
        self.page_splitter = Some(splitter);
        self
    }

    /// Run every collaborator's `init` concurrently. Returns one message per
    /// failure; a service that failed to start still stays in the set, since
    /// its calls fail transiently and fall back like any other outage.
    pub async fn init(&self) -> Vec<String> {
        let (labels, hooks): (Vec<String>, Vec<BoxFuture<'_, Result<(), PipelineError>>>) = self
            .members()
            .into_iter()
            .map(|(label, member)| (label, member.init()))
            .unzip();

        let failures: Vec<String> = labels
            .into_iter()
            .zip(join_all(hooks).await)
            .filter_map(|(label, result)| result.err().map(|e| format!("{}: {}", label, e)))
            .collect();
        for failure in &failures {
            warn!(failure = %failure, "Pipeline service failed to initialise");
        }
        if failures.is_empty() {
            info!("Pipeline services initialised");
        }
        failures
    }

    pub async fn shutdown(&self) {
        join_all(self.members().into_iter().map(|(_, member)| member.shutdown())).await;
        info!("Pipeline services shut down");
    }

    fn members(&self) -> Vec<(String, Member<'_>)> {
        let mut members: Vec<(String, Member<'_>)> = self
            .text_extractors
            .iter()
            .map(|e| (format!("text extractor {}", e.method()), Member::Text(e.as_ref())))
            .collect();
        if let Some(language) = &self.language {
            members.push(("language model".to_string(), Member::Language(language.as_ref())));
        }
        for (slot, vision) in [("primary", &self.vision_primary), ("secondary", &self.vision_secondary)] {
            if let Some(vision) = vision {
                members.push((format!("{} detector", slot), Member::Vision(vision.as_ref())));
            }
        }
        if let Some(splitter) = &self.page_splitter {
            members.push(("page splitter".to_string(), Member::Splitter(splitter.as_ref())));
        }
        members
    }
}

/// Borrowed view over one collaborator, for driving lifecycle hooks.
enum Member<'a> {
    Text(&'a dyn TextExtractionService),
    Language(&'a dyn LanguageInterpretationService),
    Vision(&'a dyn VisionDetectionService),
    Splitter(&'a dyn PageSplitter),
}

impl<'a> Member<'a> {
    fn init(self) -> BoxFuture<'a, Result<(), PipelineError>> {
        match self {
            Member::Text(s) => s.init(),
            Member::Language(s) => s.init(),
            Member::Vision(s) => s.init(),
            Member::Splitter(s) => s.init(),
        }
    }

    fn shutdown(self) -> BoxFuture<'a, ()> {
        match self {
            Member::Text(s) => s.shutdown(),
            Member::Language(s) => s.shutdown(),
            Member::Vision(s) => s.shutdown(),
            Member::Splitter(s) => s.shutdown(),
        }
    }
}

impl std::fmt::Debug for PipelineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineServices")
            .field("text_extractors", &self.text_extractors.len())
            .field("language", &self.language.is_some())
            .field("vision_primary", &self.vision_primary.is_some())
            .field("vision_secondary", &self.vision_secondary.is_some())
            .field("page_splitter", &self.page_splitter.is_some())
            .finish()
    }
}
