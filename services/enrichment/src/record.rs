//! The persisted unit of the enrichment pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content type stored when the object store does not report one
pub const UNKNOWN_CONTENT_TYPE: &str = "unknown";

/// Outcome of the text extraction step for one object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcrStatus {
    /// Extraction is disabled
    Skipped,
    /// Object exceeded the extraction size bound
    SkippedTooLarge,
    /// Extraction ran and returned a result
    Success,
    /// Extraction was attempted and failed
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Skipped => "SKIPPED",
            OcrStatus::SkippedTooLarge => "SKIPPED_TOO_LARGE",
            OcrStatus::Success => "SUCCESS",
            OcrStatus::Failed => "FAILED",
        }
    }
}

/// Metadata derived from one stored image
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRecord {
    /// `{container_id}:{object_key}`
    pub image_id: String,
    /// Bucket holding the object
    pub container_id: String,
    /// Decoded object key
    pub object_key: String,
    /// Lowercase hex SHA-256 of the object bytes
    pub content_hash: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub processed_at: DateTime<Utc>,
    pub ocr_status: OcrStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_line_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_avg_confidence_pct: Option<i64>,
}

/// Record key for an object. Reprocessing the same object always lands on the same key.
pub fn image_id(container_id: &str, object_key: &str) -> String {
    format!("{}:{}", container_id, object_key)
}

/// Hex-encoded SHA-256 of the full content
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_image_id_is_deterministic() {
        assert_eq!(image_id("uploads", "a/b c.png"), "uploads:a/b c.png");
        assert_eq!(
            image_id("uploads", "a/b c.png"),
            image_id("uploads", "a/b c.png")
        );
        assert_ne!(image_id("uploads", "a.png"), image_id("archive", "a.png"));
    }

    #[test]
    fn test_content_hash_known_vectors() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_ocr_status_serialization() {
        assert_eq!(
            serde_json::to_string(&OcrStatus::SkippedTooLarge).unwrap(),
            "\"SKIPPED_TOO_LARGE\""
        );
        assert_eq!(
            serde_json::to_string(&OcrStatus::Success).unwrap(),
            format!("\"{}\"", OcrStatus::Success.as_str())
        );
    }

    #[test]
    fn test_record_omits_absent_ocr_fields() {
        let record = EnrichedRecord {
            image_id: image_id("uploads", "cat.png"),
            container_id: "uploads".to_string(),
            object_key: "cat.png".to_string(),
            content_hash: content_hash(b"cat"),
            size_bytes: 3,
            content_type: UNKNOWN_CONTENT_TYPE.to_string(),
            processed_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap(),
            ocr_status: OcrStatus::Skipped,
            ocr_text: None,
            ocr_line_count: None,
            ocr_avg_confidence_pct: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["imageId"], "uploads:cat.png");
        assert_eq!(json["ocrStatus"], "SKIPPED");
        assert_eq!(json["processedAt"], "2024-01-15T10:30:45Z");
        assert!(json.get("ocrText").is_none());
        assert!(json.get("ocrLineCount").is_none());
        assert!(json.get("ocrAvgConfidencePct").is_none());
    }
}
