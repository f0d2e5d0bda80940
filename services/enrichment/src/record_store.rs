//! Key-value record store holding one item per image id.

use crate::config::{is_plain_identifier, DatabaseConfig};
use crate::record::EnrichedRecord;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors returned by the record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Stored item for {key} is malformed: {message}")]
    Malformed { key: String, message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// A value as held by the record store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Integer(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
    List(Vec<StoreValue>),
    Map(BTreeMap<String, StoreValue>),
}

/// One stored item, keyed by attribute name
pub type StoreItem = BTreeMap<String, StoreValue>;

impl StoreValue {
    /// Convert to the JSON sent to API clients. Integral floats become integers,
    /// non-finite floats become `null`.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            StoreValue::Integer(i) => serde_json::Value::from(*i),
            StoreValue::Float(f) => float_to_wire(*f),
            StoreValue::String(s) => serde_json::Value::String(s.clone()),
            StoreValue::Bool(b) => serde_json::Value::Bool(*b),
            StoreValue::Null => serde_json::Value::Null,
            StoreValue::List(items) => {
                serde_json::Value::Array(items.iter().map(StoreValue::to_wire).collect())
            }
            StoreValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_wire())).collect(),
            ),
        }
    }
}

fn float_to_wire(f: f64) -> serde_json::Value {
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0; // 2^63

    if !f.is_finite() {
        return serde_json::Value::Null;
    }
    if f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f) {
        return serde_json::Value::from(f as i64);
    }
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Numbers that fit in i64 become `Integer`, all others (fractional, or
/// unsigned above `i64::MAX`) become `Float`.
impl From<serde_json::Value> for StoreValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StoreValue::Null,
            serde_json::Value::Bool(b) => StoreValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => StoreValue::Integer(i),
                None => StoreValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => StoreValue::String(s),
            serde_json::Value::Array(items) => {
                StoreValue::List(items.into_iter().map(StoreValue::from).collect())
            }
            serde_json::Value::Object(map) => StoreValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, StoreValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Build a store item from a record. Integers are held as i64, so a
/// `size_bytes` above `i64::MAX` is rejected rather than stored lossily.
pub fn record_to_item(record: &EnrichedRecord) -> Result<StoreItem, StoreError> {
    let malformed = |message: String| StoreError::Malformed {
        key: record.image_id.clone(),
        message,
    };

    if i64::try_from(record.size_bytes).is_err() {
        return Err(malformed(format!(
            "sizeBytes {} is out of the integer range",
            record.size_bytes
        )));
    }

    let value = serde_json::to_value(record).map_err(|e| malformed(e.to_string()))?;
    match StoreValue::from(value) {
        StoreValue::Map(map) => Ok(map),
        other => Err(malformed(format!("expected an object, found {:?}", other))),
    }
}

/// Read a record back from a store item
pub fn item_to_record(key: &str, item: &StoreItem) -> Result<EnrichedRecord, StoreError> {
    serde_json::from_value(item_to_wire(item)).map_err(|e| StoreError::Malformed {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Wire JSON object for a whole item
pub fn item_to_wire(item: &StoreItem) -> serde_json::Value {
    serde_json::Value::Object(item.iter().map(|(k, v)| (k.clone(), v.to_wire())).collect())
}

/// Key-value record store with whole-item replacement
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or fully replace the item stored under `key`
    async fn upsert(&self, key: &str, item: StoreItem) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<StoreItem>, StoreError>;

    /// Up to `limit` items, most recently written first
    async fn scan(&self, limit: usize) -> Result<Vec<StoreItem>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed record store. One row per key, the item as JSONB.
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if !is_plain_identifier(&config.table_name) {
            bail!("Invalid table name '{}'", config.table_name);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!(table = %config.table_name, "Connected to PostgreSQL record store");

        Ok(Self {
            pool,
            table: config.table_name.clone(),
        })
    }

    /// Create the records table if it does not exist
    pub async fn run_migrations(&self) -> Result<()> {
        info!(table = %self.table, "Ensuring record table exists");

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                image_id   TEXT PRIMARY KEY,
                item       JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await
        .context("Failed to create record table")?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_updated_at_idx ON {table} (updated_at DESC)",
            table = self.table
        ))
        .execute(&self.pool)
        .await
        .context("Failed to create record table index")?;

        info!("Record table ready");
        Ok(())
    }
}

fn item_to_json(item: &StoreItem) -> serde_json::Value {
    serde_json::Value::Object(
        item.iter()
            .map(|(k, v)| (k.clone(), store_value_to_json(v)))
            .collect(),
    )
}

// Lossless: floats stay floats in the stored document
fn store_value_to_json(value: &StoreValue) -> serde_json::Value {
    match value {
        StoreValue::Integer(i) => serde_json::Value::from(*i),
        StoreValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        StoreValue::String(s) => serde_json::Value::String(s.clone()),
        StoreValue::Bool(b) => serde_json::Value::Bool(*b),
        StoreValue::Null => serde_json::Value::Null,
        StoreValue::List(items) => {
            serde_json::Value::Array(items.iter().map(store_value_to_json).collect())
        }
        StoreValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), store_value_to_json(v)))
                .collect(),
        ),
    }
}

fn json_to_item(key: &str, value: serde_json::Value) -> Result<StoreItem, StoreError> {
    match StoreValue::from(value) {
        StoreValue::Map(map) => Ok(map),
        other => Err(StoreError::Malformed {
            key: key.to_string(),
            message: format!("expected an object, found {:?}", other),
        }),
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, item))]
    async fn upsert(&self, key: &str, item: StoreItem) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (image_id, item, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (image_id)
            DO UPDATE SET item = EXCLUDED.item, updated_at = EXCLUDED.updated_at
            "#,
            table = self.table
        ))
        .bind(key)
        .bind(Json(item_to_json(&item)))
        .execute(&self.pool)
        .await?;

        debug!("Record upserted");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoreItem>, StoreError> {
        let row: Option<(Json<serde_json::Value>,)> = sqlx::query_as(&format!(
            "SELECT item FROM {table} WHERE image_id = $1",
            table = self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(Json(value),)| json_to_item(key, value))
            .transpose()
    }

    async fn scan(&self, limit: usize) -> Result<Vec<StoreItem>, StoreError> {
        let rows: Vec<(String, Json<serde_json::Value>)> = sqlx::query_as(&format!(
            "SELECT image_id, item FROM {table} ORDER BY updated_at DESC LIMIT $1",
            table = self.table
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, Json(value))| json_to_item(&key, value))
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{content_hash, image_id, OcrStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn sample_record() -> EnrichedRecord {
        EnrichedRecord {
            image_id: image_id("uploads", "receipt.png"),
            container_id: "uploads".to_string(),
            object_key: "receipt.png".to_string(),
            content_hash: content_hash(b"receipt"),
            size_bytes: 7,
            content_type: "image/png".to_string(),
            processed_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap(),
            ocr_status: OcrStatus::Success,
            ocr_text: Some("TOTAL\n12.50".to_string()),
            ocr_line_count: Some(2),
            ocr_avg_confidence_pct: Some(92),
        }
    }

    #[test]
    fn test_to_wire_integral_float_becomes_integer() {
        assert_eq!(StoreValue::Float(92.0).to_wire(), json!(92));
        assert!(StoreValue::Float(92.0).to_wire().is_i64());
        assert_eq!(StoreValue::Float(-3.0).to_wire(), json!(-3));
    }

    #[test]
    fn test_to_wire_fractional_float_stays_float() {
        assert_eq!(StoreValue::Float(91.5).to_wire(), json!(91.5));
    }

    #[test]
    fn test_to_wire_non_finite_is_null() {
        assert_eq!(StoreValue::Float(f64::NAN).to_wire(), json!(null));
        assert_eq!(StoreValue::Float(f64::INFINITY).to_wire(), json!(null));
    }

    #[test]
    fn test_to_wire_out_of_range_integral_float_stays_float() {
        let wire = StoreValue::Float(1e20).to_wire();
        assert!(wire.is_f64());
    }

    #[test]
    fn test_to_wire_nested() {
        let mut map = BTreeMap::new();
        map.insert("count".to_string(), StoreValue::Float(3.0));
        map.insert(
            "scores".to_string(),
            StoreValue::List(vec![StoreValue::Float(1.5), StoreValue::Integer(2)]),
        );
        map.insert("ok".to_string(), StoreValue::Bool(true));
        map.insert("none".to_string(), StoreValue::Null);

        assert_eq!(
            StoreValue::Map(map).to_wire(),
            json!({ "count": 3, "scores": [1.5, 2], "ok": true, "none": null })
        );
    }

    #[test]
    fn test_from_json_classifies_numbers() {
        assert_eq!(StoreValue::from(json!(7)), StoreValue::Integer(7));
        assert_eq!(StoreValue::from(json!(7.25)), StoreValue::Float(7.25));
        assert_eq!(StoreValue::from(json!("x")), StoreValue::String("x".to_string()));
    }

    #[test]
    fn test_record_item_conversion() {
        let record = sample_record();
        let item = record_to_item(&record).unwrap();

        assert_eq!(
            item.get("imageId"),
            Some(&StoreValue::String("uploads:receipt.png".to_string()))
        );
        assert_eq!(item.get("sizeBytes"), Some(&StoreValue::Integer(7)));
        assert_eq!(item_to_record("uploads:receipt.png", &item).unwrap(), record);
    }

    #[test]
    fn test_record_reads_back_from_decimal_store_values() {
        let mut item = record_to_item(&sample_record()).unwrap();
        item.insert("sizeBytes".to_string(), StoreValue::Float(7.0));
        item.insert("ocrAvgConfidencePct".to_string(), StoreValue::Float(92.0));

        let record = item_to_record("uploads:receipt.png", &item).unwrap();
        assert_eq!(record.size_bytes, 7);
        assert_eq!(record.ocr_avg_confidence_pct, Some(92));
    }

    #[test]
    fn test_record_with_oversized_length_is_rejected() {
        let record = EnrichedRecord {
            size_bytes: u64::MAX,
            ..sample_record()
        };

        assert!(matches!(
            record_to_item(&record),
            Err(StoreError::Malformed { ref key, .. }) if key == "uploads:receipt.png"
        ));

        let at_bound = EnrichedRecord {
            size_bytes: i64::MAX as u64,
            ..sample_record()
        };
        assert_eq!(
            record_to_item(&at_bound).unwrap().get("sizeBytes"),
            Some(&StoreValue::Integer(i64::MAX))
        );
    }

    #[test]
    fn test_from_json_large_unsigned_is_float() {
        assert!(matches!(
            StoreValue::from(json!(u64::MAX)),
            StoreValue::Float(_)
        ));
    }

    #[test]
    fn test_malformed_item() {
        let mut item = StoreItem::new();
        item.insert("imageId".to_string(), StoreValue::Integer(1));

        assert!(matches!(
            item_to_record("k", &item),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_json_to_item_rejects_non_objects() {
        assert!(json_to_item("k", json!([1, 2])).is_err());
        assert_eq!(json_to_item("k", json!({ "a": 1 })).unwrap().len(), 1);
    }
}
