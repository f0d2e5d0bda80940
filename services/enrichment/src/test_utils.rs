//! Test doubles shared by the unit tests.

use crate::object_store::FetchedObject;
use crate::record::EnrichedRecord;
use crate::record_store::{item_to_record, RecordStore, StoreError, StoreItem};
use async_trait::async_trait;
use std::sync::Mutex;

/// Record store kept in memory, most recent write last
#[derive(Default)]
pub struct MemoryRecordStore {
    items: Mutex<Vec<(String, StoreItem)>>,
    upserts: Mutex<usize>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Number of upsert calls received, including overwrites
    pub fn upsert_count(&self) -> usize {
        *self.upserts.lock().unwrap()
    }

    pub fn record(&self, key: &str) -> Option<EnrichedRecord> {
        let items = self.items.lock().unwrap();
        items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(k, item)| item_to_record(k, item).unwrap())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, key: &str, item: StoreItem) -> Result<(), StoreError> {
        *self.upserts.lock().unwrap() += 1;
        let mut items = self.items.lock().unwrap();
        items.retain(|(k, _)| k != key);
        items.push((key.to_string(), item));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoreItem>, StoreError> {
        let items = self.items.lock().unwrap();
        Ok(items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, item)| item.clone()))
    }

    async fn scan(&self, limit: usize) -> Result<Vec<StoreItem>, StoreError> {
        let items = self.items.lock().unwrap();
        Ok(items
            .iter()
            .rev()
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub fn fetched(bytes: &[u8], content_type: Option<&str>) -> FetchedObject {
    FetchedObject {
        bytes: bytes.to_vec(),
        declared_size: Some(bytes.len() as u64),
        content_type: content_type.map(String::from),
    }
}

pub fn s3_payload(entries: &[(&str, &str, &str)]) -> Vec<u8> {
    let records: Vec<serde_json::Value> = entries
        .iter()
        .map(|(source, bucket, key)| {
            serde_json::json!({
                "eventSource": source,
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": bucket },
                    "object": { "key": key }
                }
            })
        })
        .collect();

    serde_json::json!({ "Records": records }).to_string().into_bytes()
}
