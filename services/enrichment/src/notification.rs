//! Decoding of S3-format bucket notifications into `(bucket, key)` pairs.
//!
//! A batch is the `Records` array of one notification document. Entries from
//! foreign origins or with a broken shape are skipped without failing the
//! batch; only an empty or missing batch is an error.

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors for a batch that cannot be processed at all
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Notification batch is empty")]
    EmptyBatch,

    #[error("Notification payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Raw notification document as delivered by the object store
#[derive(Debug, Deserialize)]
pub struct NotificationBatch {
    #[serde(rename = "Records", default)]
    pub records: Option<Vec<serde_json::Value>>,
}

/// One arrival notification, still carrying the encoded key
#[derive(Debug, Clone, Deserialize)]
pub struct ArrivalNotification {
    /// Origin tag, e.g. `aws:s3`
    #[serde(rename = "eventSource")]
    pub source: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Object {
    /// Form-encoded object key
    pub key: String,
}

/// A decoded `(bucket, key)` pair ready for enrichment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub container_id: String,
    pub object_key: String,
}

/// Turns notification batches into object references
#[derive(Debug, Clone)]
pub struct NotificationDecoder {
    accepted_sources: Vec<String>,
}

impl NotificationDecoder {
    pub fn new(accepted_sources: Vec<String>) -> Self {
        Self { accepted_sources }
    }

    /// Parse a JSON notification document and decode its records
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Vec<ObjectRef>, DecodeError> {
        let batch: NotificationBatch = serde_json::from_slice(payload)?;
        self.decode_batch(batch)
    }

    /// Decode every record of a batch, skipping foreign or malformed entries
    pub fn decode_batch(&self, batch: NotificationBatch) -> Result<Vec<ObjectRef>, DecodeError> {
        let records = match batch.records {
            Some(records) if !records.is_empty() => records,
            _ => return Err(DecodeError::EmptyBatch),
        };

        let total = records.len();
        let refs: Vec<ObjectRef> = records
            .into_iter()
            .enumerate()
            .filter_map(|(index, raw)| self.decode_record(index, raw))
            .collect();

        debug!(
            total = total,
            accepted = refs.len(),
            "Decoded notification batch"
        );

        Ok(refs)
    }

    fn decode_record(&self, index: usize, raw: serde_json::Value) -> Option<ObjectRef> {
        let source = raw.get("eventSource").and_then(|s| s.as_str());
        if !source.is_some_and(|s| self.is_accepted(s)) {
            debug!(index = index, source = ?source, "Skipping foreign-origin notification");
            metrics::counter!("enrichment.notifications.foreign").increment(1);
            return None;
        }

        let notification: ArrivalNotification = match serde_json::from_value(raw) {
            Ok(n) => n,
            Err(e) => {
                warn!(index = index, error = %e, "Skipping malformed notification");
                metrics::counter!("enrichment.notifications.malformed").increment(1);
                return None;
            }
        };

        Some(ObjectRef {
            container_id: notification.s3.bucket.name,
            object_key: decode_object_key(&notification.s3.object.key),
        })
    }

    fn is_accepted(&self, source: &str) -> bool {
        self.accepted_sources.iter().any(|s| s == source)
    }
}

/// Percent-decode an object key, treating `+` as a space.
/// Invalid UTF-8 sequences become U+FFFD.
pub fn decode_object_key(encoded: &str) -> String {
    let spaced = encoded.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> NotificationDecoder {
        NotificationDecoder::new(vec!["aws:s3".to_string()])
    }

    fn s3_record(bucket: &str, key: &str) -> serde_json::Value {
        json!({
            "eventSource": "aws:s3",
            "eventName": "ObjectCreated:Put",
            "s3": {
                "bucket": { "name": bucket },
                "object": { "key": key, "size": 1024 }
            }
        })
    }

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("photos/cat.png"), "photos/cat.png");
        assert_eq!(decode_object_key("my+holiday+photo.jpg"), "my holiday photo.jpg");
        assert_eq!(decode_object_key("a%2Bb%20c.png"), "a+b c.png");
        assert_eq!(decode_object_key("caf%C3%A9.png"), "café.png");
        assert_eq!(decode_object_key("bad%FF.png"), "bad\u{FFFD}.png");
    }

    #[test]
    fn test_decode_payload() {
        let payload = json!({ "Records": [s3_record("uploads", "scans/receipt+1.png")] });
        let refs = decoder()
            .decode_payload(payload.to_string().as_bytes())
            .unwrap();

        assert_eq!(
            refs,
            vec![ObjectRef {
                container_id: "uploads".to_string(),
                object_key: "scans/receipt 1.png".to_string(),
            }]
        );
    }

    #[test]
    fn test_foreign_origin_is_skipped() {
        let payload = json!({
            "Records": [
                { "eventSource": "aws:sqs", "body": "{}" },
                s3_record("uploads", "a.png")
            ]
        });
        let refs = decoder()
            .decode_payload(payload.to_string().as_bytes())
            .unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].object_key, "a.png");
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let payload = json!({
            "Records": [
                { "eventSource": "aws:s3", "s3": { "bucket": { "name": "uploads" } } },
                s3_record("uploads", "b.png")
            ]
        });
        let refs = decoder()
            .decode_payload(payload.to_string().as_bytes())
            .unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].object_key, "b.png");
    }

    #[test]
    fn test_empty_batch_is_an_error() {
        for payload in [json!({ "Records": [] }), json!({}), json!({ "Records": null })] {
            let result = decoder().decode_payload(payload.to_string().as_bytes());
            assert!(matches!(result, Err(DecodeError::EmptyBatch)));
        }
    }

    #[test]
    fn test_only_foreign_entries_yield_no_pairs() {
        let payload = json!({ "Records": [{ "eventSource": "aws:sns" }] });
        let refs = decoder()
            .decode_payload(payload.to_string().as_bytes())
            .unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let result = decoder().decode_payload(b"not json");
        assert!(matches!(result, Err(DecodeError::InvalidPayload(_))));
    }

    #[test]
    fn test_additional_accepted_source() {
        let decoder = NotificationDecoder::new(vec!["aws:s3".to_string(), "minio:s3".to_string()]);
        let mut record = s3_record("uploads", "c.png");
        record["eventSource"] = json!("minio:s3");
        let payload = json!({ "Records": [record] });

        let refs = decoder.decode_payload(payload.to_string().as_bytes()).unwrap();
        assert_eq!(refs.len(), 1);
    }
}
