//! Bounded text extraction.
//!
//! Extraction is an externally billed call, so it is gated by configuration,
//! refused for objects above a size bound, limited in time, and its output is
//! truncated to a bounded number of lines before it reaches the record.

use crate::config::OcrConfig;
use crate::record::OcrStatus;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_textract::error::SdkError;
use aws_sdk_textract::operation::detect_document_text::DetectDocumentTextError;
use aws_sdk_textract::primitives::Blob;
use aws_sdk_textract::types::{BlockType, Document};
use aws_sdk_textract::Client as TextractClient;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Failures reported by the extraction service
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Extraction quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Image rejected by extraction service: {0}")]
    InvalidInput(String),

    #[error("Extraction service error: {0}")]
    Service(String),
}

/// Granularity of a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    Page,
    Line,
    Word,
    Other,
}

/// One text fragment returned by the extraction service
#[derive(Debug, Clone, PartialEq)]
pub struct TextDetection {
    pub kind: DetectionKind,
    pub text: Option<String>,
    /// Confidence in percent (0-100)
    pub confidence: Option<f32>,
}

/// Detects text in raw image bytes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn detect(&self, bytes: &[u8]) -> Result<Vec<TextDetection>, ExtractionError>;
}

/// Amazon Textract `DetectDocumentText` client
pub struct TextractExtractor {
    client: TextractClient,
}

impl TextractExtractor {
    pub async fn new(region: &str) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        info!(region = %region, "Textract extractor initialized");

        Ok(Self {
            client: TextractClient::new(&aws_config),
        })
    }
}

#[async_trait]
impl TextExtractor for TextractExtractor {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn detect(&self, bytes: &[u8]) -> Result<Vec<TextDetection>, ExtractionError> {
        let document = Document::builder().bytes(Blob::new(bytes.to_vec())).build();

        let output = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await
            .map_err(classify_textract_error)?;

        let detections = output
            .blocks()
            .iter()
            .map(|block| TextDetection {
                kind: match block.block_type() {
                    Some(BlockType::Page) => DetectionKind::Page,
                    Some(BlockType::Line) => DetectionKind::Line,
                    Some(BlockType::Word) => DetectionKind::Word,
                    _ => DetectionKind::Other,
                },
                text: block.text().map(String::from),
                confidence: block.confidence(),
            })
            .collect();

        Ok(detections)
    }
}

fn classify_textract_error(err: SdkError<DetectDocumentTextError>) -> ExtractionError {
    let message = err.to_string();
    match err.as_service_error() {
        Some(
            DetectDocumentTextError::ProvisionedThroughputExceededException(_)
            | DetectDocumentTextError::ThrottlingException(_),
        ) => ExtractionError::QuotaExceeded(message),
        Some(
            DetectDocumentTextError::BadDocumentException(_)
            | DetectDocumentTextError::DocumentTooLargeException(_)
            | DetectDocumentTextError::UnsupportedDocumentException(_)
            | DetectDocumentTextError::InvalidParameterException(_),
        ) => ExtractionError::InvalidInput(message),
        _ => ExtractionError::Service(message),
    }
}

/// Text fields derived from a successful extraction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrSummary {
    pub text: Option<String>,
    pub line_count: Option<u32>,
    pub avg_confidence_pct: Option<i64>,
}

/// Result of the extraction step for one object
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    pub status: OcrStatus,
    pub summary: OcrSummary,
}

impl OcrOutcome {
    fn without_text(status: OcrStatus) -> Self {
        Self {
            status,
            summary: OcrSummary::default(),
        }
    }
}

/// Keep non-empty line detections, truncate to `max_lines`, and average their confidences
pub fn summarize(detections: &[TextDetection], max_lines: usize) -> OcrSummary {
    let lines: Vec<(&str, Option<f32>)> = detections
        .iter()
        .filter(|d| d.kind == DetectionKind::Line)
        .filter_map(|d| match d.text.as_deref() {
            Some(text) if !text.is_empty() => Some((text, d.confidence)),
            _ => None,
        })
        .take(max_lines)
        .collect();

    if lines.is_empty() {
        return OcrSummary::default();
    }

    let scores: Vec<f64> = lines
        .iter()
        .filter_map(|(_, confidence)| confidence.map(f64::from))
        .collect();
    let avg_confidence_pct = if scores.is_empty() {
        None
    } else {
        Some((scores.iter().sum::<f64>() / scores.len() as f64).round() as i64)
    };

    let text = lines
        .iter()
        .map(|(text, _)| *text)
        .collect::<Vec<_>>()
        .join("\n");

    OcrSummary {
        text: Some(text),
        line_count: Some(lines.len() as u32),
        avg_confidence_pct,
    }
}

/// Applies the enable flag, size bound and timeout around a `TextExtractor`
pub struct OcrStage {
    extractor: Option<Arc<dyn TextExtractor>>,
    config: OcrConfig,
}

impl OcrStage {
    /// `extractor` is only consulted when `config.enabled` is set
    pub fn new(extractor: Option<Arc<dyn TextExtractor>>, config: OcrConfig) -> Self {
        Self { extractor, config }
    }

    /// Stage that never extracts
    pub fn disabled() -> Self {
        Self {
            extractor: None,
            config: OcrConfig::default(),
        }
    }

    /// Run extraction for one object. Never fails: errors become `OcrStatus::Failed`.
    #[instrument(skip(self, bytes))]
    pub async fn run(&self, bytes: &[u8], size_bytes: u64) -> OcrOutcome {
        let extractor = match (&self.extractor, self.config.enabled) {
            (Some(extractor), true) => extractor,
            _ => return OcrOutcome::without_text(OcrStatus::Skipped),
        };

        if size_bytes > self.config.max_bytes {
            debug!(
                size_bytes = size_bytes,
                max_bytes = self.config.max_bytes,
                "Object too large for text extraction"
            );
            return OcrOutcome::without_text(OcrStatus::SkippedTooLarge);
        }

        let detections =
            match tokio::time::timeout(self.config.timeout(), extractor.detect(bytes)).await {
                Ok(Ok(detections)) => detections,
                Ok(Err(e)) => {
                    warn!(error = %e, "Text extraction failed");
                    return OcrOutcome::without_text(OcrStatus::Failed);
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.config.timeout_secs,
                        "Text extraction timed out"
                    );
                    return OcrOutcome::without_text(OcrStatus::Failed);
                }
            };

        let summary = summarize(&detections, self.config.max_lines);

        debug!(
            detections = detections.len(),
            line_count = ?summary.line_count,
            avg_confidence_pct = ?summary.avg_confidence_pct,
            "Text extraction succeeded"
        );

        OcrOutcome {
            status: OcrStatus::Success,
            summary,
        }
    }
}
