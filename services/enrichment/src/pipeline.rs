//! Enrichment of decoded object references.
//!
//! Every pair of a batch is fetched, hashed, optionally run through text
//! extraction and written as one whole record. Pairs are independent: a pair
//! that cannot be fetched or runs out of time is reported as skipped and the
//! rest of the batch carries on. Only persistence failures fail the batch, so
//! that redelivery reprocesses it.

use crate::config::PipelineConfig;
use crate::notification::{DecodeError, NotificationDecoder, ObjectRef};
use crate::object_store::{FetchError, ObjectFetcher};
use crate::record::{content_hash, image_id, EnrichedRecord, OcrStatus, UNKNOWN_CONTENT_TYPE};
use crate::record_store::{record_to_item, RecordStore, StoreError, StoreItem};
use crate::text_extraction::OcrStage;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that fail a whole batch
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Invalid notification batch: {0}")]
    InvalidInput(#[from] DecodeError),

    #[error("{failed} record(s) could not be persisted: {source}")]
    Persistence {
        failed: usize,
        #[source]
        source: StoreError,
    },
}

/// Why a pair was left out of the batch without failing it
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// A pair that was enriched and persisted
#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    pub ocr_status: OcrStatus,
}

#[derive(Debug)]
enum PairError {
    Skipped(SkipReason),
    Persistence(StoreError),
}

/// Per-pair entry of a batch report
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairReport {
    pub image_id: String,
    pub outcome: PairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_status: Option<OcrStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Persisted,
    Skipped,
}

/// Result of a batch that was accepted
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Pairs attempted
    pub processed: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub items: Vec<PairReport>,
}

impl BatchReport {
    pub fn from_results(results: Vec<(String, Result<PairOutcome, SkipReason>)>) -> Self {
        let mut report = BatchReport {
            processed: results.len(),
            ..Default::default()
        };

        for (image_id, result) in results {
            let entry = match result {
                Ok(outcome) => {
                    report.persisted += 1;
                    PairReport {
                        image_id,
                        outcome: PairStatus::Persisted,
                        ocr_status: Some(outcome.ocr_status),
                        reason: None,
                    }
                }
                Err(reason) => {
                    report.skipped += 1;
                    PairReport {
                        image_id,
                        outcome: PairStatus::Skipped,
                        ocr_status: None,
                        reason: Some(reason.to_string()),
                    }
                }
            };
            report.items.push(entry);
        }

        report
    }
}

/// Turns notification batches into persisted records
pub struct EnrichmentPipeline {
    decoder: NotificationDecoder,
    fetcher: Arc<dyn ObjectFetcher>,
    store: Arc<dyn RecordStore>,
    ocr: OcrStage,
    config: PipelineConfig,
}

impl EnrichmentPipeline {
    pub fn new(
        fetcher: Arc<dyn ObjectFetcher>,
        store: Arc<dyn RecordStore>,
        ocr: OcrStage,
        config: PipelineConfig,
    ) -> Self {
        Self {
            decoder: NotificationDecoder::new(config.accepted_sources.clone()),
            fetcher,
            store,
            ocr,
            config,
        }
    }

    /// Decode a raw notification document and process its records
    pub async fn process_payload(&self, payload: &[u8]) -> Result<BatchReport, BatchError> {
        let refs = self.decoder.decode_payload(payload).map_err(|e| {
            warn!(error = %e, "Rejecting notification batch");
            metrics::counter!("enrichment.batch.rejected").increment(1);
            e
        })?;
        self.process_batch(refs).await
    }

    /// Process already decoded pairs concurrently
    #[instrument(skip(self, refs), fields(pairs = refs.len()))]
    pub async fn process_batch(&self, refs: Vec<ObjectRef>) -> Result<BatchReport, BatchError> {
        let results: Vec<(String, Result<PairOutcome, PairError>)> = stream::iter(refs)
            .map(|object| self.run_pair(object))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let mut persistence_failure = None;
        let mut failed = 0;
        let mut pair_results = Vec::with_capacity(results.len());

        for (image_id, result) in results {
            match result {
                Ok(outcome) => pair_results.push((image_id, Ok(outcome))),
                Err(PairError::Skipped(reason)) => pair_results.push((image_id, Err(reason))),
                Err(PairError::Persistence(e)) => {
                    failed += 1;
                    persistence_failure.get_or_insert(e);
                }
            }
        }

        if let Some(source) = persistence_failure {
            error!(failed = failed, "Batch failed to persist records");
            metrics::counter!("enrichment.batch.failed").increment(1);
            return Err(BatchError::Persistence { failed, source });
        }

        let report = BatchReport::from_results(pair_results);

        if report.processed > 0 && report.persisted == 0 {
            warn!(
                processed = report.processed,
                "Every pair in the batch was skipped"
            );
        }

        info!(
            processed = report.processed,
            persisted = report.persisted,
            skipped = report.skipped,
            "Batch processed"
        );
        metrics::counter!("enrichment.batch.processed").increment(1);

        Ok(report)
    }

    /// The pair timeout bounds fetch and extraction only. Persistence runs
    /// outside it so a slow store surfaces as a persistence failure.
    async fn run_pair(&self, object: ObjectRef) -> (String, Result<PairOutcome, PairError>) {
        let key = image_id(&object.container_id, &object.object_key);
        let started = Instant::now();
        let timeout = self.config.pair_timeout();

        let result = match tokio::time::timeout(timeout, self.enrich(&key, &object)).await {
            Ok(Ok(record)) => self.persist(&key, record).await,
            Ok(Err(reason)) => Err(PairError::Skipped(reason)),
            Err(_) => Err(PairError::Skipped(SkipReason::TimedOut(timeout))),
        };

        metrics::histogram!("enrichment.pair.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                metrics::counter!("enrichment.pairs.persisted").increment(1);
                metrics::counter!("enrichment.ocr.status", "status" => outcome.ocr_status.as_str())
                    .increment(1);
            }
            Err(PairError::Skipped(reason)) => {
                warn!(
                    image_id = %key,
                    reason = %reason,
                    "Skipping object"
                );
                metrics::counter!("enrichment.pairs.skipped").increment(1);
            }
            Err(PairError::Persistence(e)) => {
                error!(image_id = %key, error = %e, "Failed to persist record");
                metrics::counter!("enrichment.pairs.persist_failed").increment(1);
            }
        }

        (key, result)
    }

    #[instrument(skip(self, object), fields(bucket = %object.container_id, key = %object.object_key))]
    async fn enrich(&self, image_id: &str, object: &ObjectRef) -> Result<EnrichedRecord, SkipReason> {
        let fetched = self
            .fetcher
            .get(&object.container_id, &object.object_key)
            .await?;

        let measured_size = fetched.bytes.len() as u64;
        let size_bytes = fetched.declared_size.unwrap_or(measured_size);
        let content_type = fetched
            .content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| UNKNOWN_CONTENT_TYPE.to_string());
        let hash = content_hash(&fetched.bytes);

        let ocr = self.ocr.run(&fetched.bytes, size_bytes).await;

        Ok(EnrichedRecord {
            image_id: image_id.to_string(),
            container_id: object.container_id.clone(),
            object_key: object.object_key.clone(),
            content_hash: hash,
            size_bytes,
            content_type,
            processed_at: Utc::now(),
            ocr_status: ocr.status,
            ocr_text: ocr.summary.text,
            ocr_line_count: ocr.summary.line_count,
            ocr_avg_confidence_pct: ocr.summary.avg_confidence_pct,
        })
    }

    async fn persist(&self, image_id: &str, record: EnrichedRecord) -> Result<PairOutcome, PairError> {
        let item = record_to_item(&record).map_err(PairError::Persistence)?;

        self.upsert_with_retry(image_id, item)
            .await
            .map_err(PairError::Persistence)?;

        debug!(
            image_id = %image_id,
            size_bytes = record.size_bytes,
            ocr_status = record.ocr_status.as_str(),
            "Record persisted"
        );

        Ok(PairOutcome {
            ocr_status: record.ocr_status,
        })
    }

    /// Upserts replace the whole item, so retrying is safe
    async fn upsert_with_retry(&self, key: &str, item: StoreItem) -> Result<(), StoreError> {
        let base = self.config.upsert_retry_base();
        let mut backoff = ExponentialBackoff {
            current_interval: base,
            initial_interval: base,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.store.upsert(key, item.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts < self.config.upsert_max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(base);
                    warn!(
                        image_id = %key,
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Upsert failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
