//! Image Enrichment Service
//!
//! Turns "object created" notifications from an object store into enriched
//! image records. Each notified object is fetched, hashed, measured and
//! optionally run through text extraction, then written to the record store
//! under the key `{bucket}:{objectKey}`.
//!
//! ## Features
//!
//! - **Notification Decoding**: Accepts S3-style notification batches and
//!   drops entries from foreign sources or with missing fields
//! - **Bounded OCR**: Text extraction is gated by size, time and line count,
//!   and its failures never block a record
//! - **Idempotent Persistence**: Records are whole-item upserts, so
//!   redelivered notifications converge on the same stored state
//! - **Query API**: Record lookup and presigned download/upload links
//!
//! ## Architecture
//!
//! ```text
//! Kafka topic / Webhook         S3 Bucket                 PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Notification │           │ {bucket}/    │          │ image_records│
//! │ Batches      │           │   {key}      │          │  (JSONB)     │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          │                         ▲
//!        ▼                          ▼                         │
//! ┌──────────────┐           ┌──────────────┐                │
//! │ Notification │──────────▶│ Enrichment   │────────────────┤
//! │ Decoder      │           │ Pipeline     │                │
//! └──────────────┘           └──────────────┘                │
//!                                   │                         │
//!                                   ▼                         │
//!                            ┌──────────────┐          ┌──────────────┐
//!                            │ Textract     │          │ Query/Link   │
//!                            │ (optional)   │          │ API          │
//!                            └──────────────┘          └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod kafka_consumer;
pub mod notification;
pub mod object_store;
pub mod pipeline;
pub mod record;
pub mod record_store;
pub mod text_extraction;

#[cfg(test)]
mod test_utils;

pub use api::{start_api_server, AppState};
pub use config::Config;
pub use kafka_consumer::NotificationKafkaConsumer;
pub use notification::{NotificationDecoder, ObjectRef};
pub use object_store::{LinkSigner, ObjectFetcher, S3ObjectStore};
pub use pipeline::{BatchError, BatchReport, EnrichmentPipeline};
pub use record::{EnrichedRecord, OcrStatus};
pub use record_store::{PgRecordStore, RecordStore, StoreValue};
pub use text_extraction::{OcrStage, TextExtractor, TextractExtractor};
