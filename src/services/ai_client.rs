//! AI service client for the OCR, vision and language endpoints.
//!
//! `AiClient` owns the HTTP plumbing; the adapter structs below implement the
//! pipeline collaborator traits on top of it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::domain::{
    DetectionThresholds, DetectorKind, DocumentRef, ExtractionMethod, VisionDetection,
};
use crate::error::PipelineError;
use crate::services::traits::{
    LanguageInterpretationService, PageRange, PageSplitter, PipelineServices, TextExtraction,
    TextExtractionService, VisionDetectionService,
};

/// Client for the AI service.
#[derive(Clone)]
pub struct AiClient {
    client: Client,
    base_url: String,
    token: String,
}

/// Error response from AI service.
#[derive(Debug, Deserialize)]
struct AiErrorResponse {
    message: String,
}

impl AiClient {
    /// Create a new AI service client.
    pub fn new(base_url: &str, token: &str, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        tracing::info!(base_url = base_url, "AI client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Make a POST request to the AI service.
    async fn post<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, PipelineError> {
        let url = format!("{}{}", self.base_url, path);

        debug!(url = %url, "AI service request");

        let response = self
            .client
            .post(&url)
            .header("X-Internal-Token", &self.token)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "AI service request failed");
                // Connection failures and timeouts are worth another attempt
                PipelineError::Transient(format!("AI service unavailable: {}", e))
            })?;

        let status = response.status();

        if status.is_success() {
            return response.json::<R>().await.map_err(|e| {
                error!(error = %e, "Failed to parse AI service response");
                PipelineError::Stage(format!("Invalid AI service response: {}", e))
            });
        }

        let message = response
            .json::<AiErrorResponse>()
            .await
            .ok()
            .map(|e| e.message)
            .unwrap_or_else(|| format!("AI service error: {}", status));

        Err(classify_status(status, message))
    }

    /// Check AI service health.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);

        self.client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("AI service health check failed")?
            .error_for_status()
            .context("AI service unhealthy")?;

        Ok(())
    }

    /// `init` hook shared by the adapters: the service must answer its
    /// health endpoint. Failures are transient since the service may come up
    /// after this process.
    async fn ready(&self) -> Result<(), PipelineError> {
        self.health_check()
            .await
            .map_err(|e| PipelineError::Transient(format!("{:#}", e)))
    }

    /// Build the collaborator set backed by this client.
    ///
    /// Document AI extraction is tried before the plain text layer, and the
    /// geometric detector before the AI detector.
    pub fn pipeline_services(&self) -> PipelineServices {
        let client = Arc::new(self.clone());
        PipelineServices::new()
            .with_text_extractor(Arc::new(AiTextExtractor::new(
                client.clone(),
                ExtractionMethod::DocumentAi,
            )))
            .with_text_extractor(Arc::new(AiTextExtractor::new(
                client.clone(),
                ExtractionMethod::TextLayer,
            )))
            .with_language(Arc::new(AiLanguageModel { client: client.clone() }))
            .with_vision(
                Arc::new(AiVisionDetector { client: client.clone(), kind: DetectorKind::Geometric }),
                Some(Arc::new(AiVisionDetector { client: client.clone(), kind: DetectorKind::Ai })),
            )
            .with_page_splitter(Arc::new(AiPageSplitter { client }))
    }
}

/// Map a non-success status onto the pipeline error taxonomy.
fn classify_status(status: StatusCode, message: String) -> PipelineError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            PipelineError::Validation(message)
        }
        StatusCode::NOT_FOUND => PipelineError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            error!("AI service authentication failed");
            PipelineError::Fatal("AI service auth error".to_string())
        }
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => {
            warn!(status = %status, message = %message, "AI service temporarily unavailable");
            PipelineError::Transient(message)
        }
        s if s.is_server_error() => {
            error!(status = %s, message = %message, "AI service error");
            PipelineError::Transient(message)
        }
        _ => {
            error!(status = %status, message = %message, "AI service error");
            PipelineError::Stage(message)
        }
    }
}

// =========================================================================
// Text extraction
// =========================================================================

pub struct AiTextExtractor {
    client: Arc<AiClient>,
    method: ExtractionMethod,
}

impl AiTextExtractor {
    pub fn new(client: Arc<AiClient>, method: ExtractionMethod) -> Self {
        Self { client, method }
    }
}

#[async_trait]
impl TextExtractionService for AiTextExtractor {
    fn method(&self) -> ExtractionMethod {
        self.method
    }

    #[instrument(skip(self, document), fields(document_id = %document.document_id, method = %self.method))]
    async fn extract(
        &self,
        document: &DocumentRef,
        pages: Option<PageRange>,
    ) -> Result<TextExtraction, PipelineError> {
        #[derive(Serialize)]
        struct Request<'a> {
            document_id: String,
            file_path: &'a str,
            method: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            pages: Option<PageRange>,
        }

        self.client
            .post(
                "/v1/extract",
                &Request {
                    document_id: document.document_id.to_string(),
                    file_path: &document.file_path,
                    method: self.method.as_str(),
                    pages,
                },
            )
            .await
    }

    async fn init(&self) -> Result<(), PipelineError> {
        self.client.ready().await
    }
}

// =========================================================================
// Vision detection
// =========================================================================

pub struct AiVisionDetector {
    client: Arc<AiClient>,
    kind: DetectorKind,
}

#[async_trait]
impl VisionDetectionService for AiVisionDetector {
    fn kind(&self) -> DetectorKind {
        self.kind
    }

    #[instrument(skip(self, document, thresholds), fields(document_id = %document.document_id))]
    async fn detect(
        &self,
        document: &DocumentRef,
        thresholds: &DetectionThresholds,
    ) -> Result<VisionDetection, PipelineError> {
        #[derive(Serialize)]
        struct Request<'a> {
            file_path: &'a str,
            detector: DetectorKind,
            min_confidence: f64,
            nms_iou: f64,
        }

        self.client
            .post(
                "/v1/vision/detect",
                &Request {
                    file_path: &document.file_path,
                    detector: self.kind,
                    min_confidence: thresholds.min_confidence,
                    nms_iou: thresholds.nms_iou,
                },
            )
            .await
    }

    async fn init(&self) -> Result<(), PipelineError> {
        self.client.ready().await
    }
}

// =========================================================================
// Language interpretation
// =========================================================================

pub struct AiLanguageModel {
    client: Arc<AiClient>,
}

#[async_trait]
impl LanguageInterpretationService for AiLanguageModel {
    #[instrument(skip(self, content, schema_hint))]
    async fn interpret(&self, content: &str, schema_hint: &str) -> Result<String, PipelineError> {
        #[derive(Serialize)]
        struct Request<'a> {
            content: &'a str,
            schema_hint: &'a str,
        }

        #[derive(Deserialize)]
        struct Response {
            text: String,
        }

        let response: Response = self
            .client
            .post("/v1/interpret", &Request { content, schema_hint })
            .await?;

        Ok(response.text)
    }

    async fn init(&self) -> Result<(), PipelineError> {
        self.client.ready().await
    }
}

// =========================================================================
// Page splitting
// =========================================================================

pub struct AiPageSplitter {
    client: Arc<AiClient>,
}

#[async_trait]
impl PageSplitter for AiPageSplitter {
    #[instrument(skip(self, document), fields(document_id = %document.document_id))]
    async fn extract_pages(
        &self,
        document: &DocumentRef,
        pages: &[u32],
    ) -> Result<DocumentRef, PipelineError> {
        #[derive(Serialize)]
        struct Request<'a> {
            file_path: &'a str,
            pages: &'a [u32],
        }

        #[derive(Deserialize)]
        struct Response {
            file_path: String,
            page_count: u32,
        }

        let response: Response = self
            .client
            .post(
                "/v1/documents/split",
                &Request { file_path: &document.file_path, pages },
            )
            .await?;

        Ok(DocumentRef {
            document_id: document.document_id,
            filename: document.filename.clone(),
            file_path: response.file_path,
            page_count: Some(response.page_count),
            source_pages: Some(pages.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_outages_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            assert!(classify_status(status, "x".into()).is_transient(), "{status}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad".into()),
            PipelineError::Validation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "gone".into()),
            PipelineError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT, "odd".into()),
            PipelineError::Stage(_)
        ));
    }
}
