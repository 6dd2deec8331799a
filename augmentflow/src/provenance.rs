//! Append-only provenance tracking.
//!
//! Every terminal item outcome leaves a record describing where its value
//! came from (or why it failed): source name, attempt counts, cache hits,
//! timings. Records are never mutated or deleted; chunks executing
//! concurrently append without coordination and per-item arrival order is
//! preserved. No ordering is defined across items or chunks.

use crate::errors::AugmentError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Canonical keys used in record details.
pub mod detail_keys {
    /// The value was served from the cache (`true`).
    pub const CACHE_HIT: &str = "cache_hit";
    /// Total fetch attempts made for the item.
    pub const ATTEMPTS: &str = "attempts";
    /// Retries performed (attempts minus one).
    pub const RETRIES: &str = "retries";
    /// Final error text for failed items.
    pub const ERROR: &str = "error";
    /// Failure kind for failed items.
    pub const FAILURE_KIND: &str = "failure_kind";
    /// Batch job that produced the value.
    pub const JOB_ID: &str = "job_id";
    /// Wall-clock time spent resolving the item, in milliseconds.
    pub const ELAPSED_MS: &str = "elapsed_ms";
}

/// Builds a detail map from key/value pairs.
#[must_use]
pub fn details<K, I>(pairs: I) -> HashMap<String, serde_json::Value>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, serde_json::Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// One provenance record: how a single item outcome came to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Unique id of this record.
    pub record_id: Uuid,
    /// The item the record describes.
    pub item_id: String,
    /// Name of the fetch source (or subsystem) that produced the outcome.
    pub source: String,
    /// Structured details; see [`detail_keys`].
    pub details: HashMap<String, serde_json::Value>,
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
}

impl ProvenanceRecord {
    /// Creates a record with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(item_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            item_id: item_id.into(),
            source: source.into(),
            details: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds one detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Replaces the detail map.
    #[must_use]
    pub fn with_details(mut self, details: HashMap<String, serde_json::Value>) -> Self {
        self.details = details;
        self
    }
}

/// Storage seam for provenance records.
///
/// Implementations must be safe under concurrent appends and reads. The
/// engine ships an in-memory store; external backends implement this trait
/// and are injected into the orchestrator.
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    /// Appends a new record for an item and returns its id.
    ///
    /// Fails only when the backing store is unavailable.
    async fn append(
        &self,
        item_id: &str,
        source: &str,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, AugmentError>;

    /// Returns a point-in-time snapshot of an item's records, in the order
    /// they were appended for that item.
    async fn query(&self, item_id: &str) -> Vec<ProvenanceRecord>;

    /// Appends pre-built records, preserving their given order per item.
    ///
    /// Used to union chunk-local records produced by batch jobs that had no
    /// access to the shared store while running.
    async fn extend(&self, records: Vec<ProvenanceRecord>) -> Result<(), AugmentError>;

    /// Returns the total number of stored records.
    async fn record_count(&self) -> usize;
}

/// In-memory provenance store backed by a concurrent map.
///
/// Per-item appends are atomic (one shard lock per append), so concurrent
/// chunk executors interleave safely. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvenanceStore {
    records: Arc<DashMap<String, Vec<ProvenanceRecord>>>,
}

impl InMemoryProvenanceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of items with at least one record.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl ProvenanceStore for InMemoryProvenanceStore {
    async fn append(
        &self,
        item_id: &str,
        source: &str,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid, AugmentError> {
        let record = ProvenanceRecord::new(item_id, source).with_details(details);
        let record_id = record.record_id;
        self.records
            .entry(item_id.to_string())
            .or_default()
            .push(record);
        Ok(record_id)
    }

    async fn query(&self, item_id: &str) -> Vec<ProvenanceRecord> {
        self.records
            .get(item_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    async fn extend(&self, records: Vec<ProvenanceRecord>) -> Result<(), AugmentError> {
        for record in records {
            self.records
                .entry(record.item_id.clone())
                .or_default()
                .push(record);
        }
        Ok(())
    }

    async fn record_count(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_then_query() {
        let store = InMemoryProvenanceStore::new();

        let id = store
            .append(
                "item-1",
                "geo",
                details([(detail_keys::ATTEMPTS, json!(1))]),
            )
            .await
            .unwrap();

        let records = store.query("item-1").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, id);
        assert_eq!(records[0].source, "geo");
        assert_eq!(records[0].details[detail_keys::ATTEMPTS], json!(1));
    }

    #[tokio::test]
    async fn test_query_unknown_item_is_empty() {
        let store = InMemoryProvenanceStore::new();
        assert!(store.query("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_per_item_order_preserved() {
        let store = InMemoryProvenanceStore::new();

        for attempt in 1..=5 {
            store
                .append(
                    "item-1",
                    "geo",
                    details([(detail_keys::ATTEMPTS, json!(attempt))]),
                )
                .await
                .unwrap();
        }

        let records = store.query("item-1").await;
        let attempts: Vec<_> = records
            .iter()
            .map(|r| r.details[detail_keys::ATTEMPTS].clone())
            .collect();
        assert_eq!(attempts, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let store = InMemoryProvenanceStore::new();

        let mut handles = Vec::new();
        for task in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store
                        .append(
                            &format!("item-{task}"),
                            "geo",
                            details([(detail_keys::ATTEMPTS, json!(i))]),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.record_count().await, 80);
        assert_eq!(store.item_count(), 8);
        for task in 0..8 {
            assert_eq!(store.query(&format!("item-{task}")).await.len(), 10);
        }
    }

    #[tokio::test]
    async fn test_extend_unions_in_given_order() {
        let store = InMemoryProvenanceStore::new();
        store
            .append("item-1", "geo", HashMap::new())
            .await
            .unwrap();

        let batch = vec![
            ProvenanceRecord::new("item-1", "geo").with_detail(detail_keys::JOB_ID, json!("j-1")),
            ProvenanceRecord::new("item-2", "geo").with_detail(detail_keys::JOB_ID, json!("j-1")),
            ProvenanceRecord::new("item-1", "geo").with_detail(detail_keys::JOB_ID, json!("j-2")),
        ];
        store.extend(batch).await.unwrap();

        let one = store.query("item-1").await;
        assert_eq!(one.len(), 3);
        assert_eq!(one[1].details[detail_keys::JOB_ID], json!("j-1"));
        assert_eq!(one[2].details[detail_keys::JOB_ID], json!("j-2"));
        assert_eq!(store.query("item-2").await.len(), 1);
        assert_eq!(store.record_count().await, 4);
    }

    #[tokio::test]
    async fn test_record_ids_unique() {
        let store = InMemoryProvenanceStore::new();
        let a = store.append("x", "geo", HashMap::new()).await.unwrap();
        let b = store.append("x", "geo", HashMap::new()).await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_record_builder() {
        let record = ProvenanceRecord::new("item-1", "weather")
            .with_detail(detail_keys::CACHE_HIT, json!(true));

        assert_eq!(record.item_id, "item-1");
        assert_eq!(record.source, "weather");
        assert_eq!(record.details[detail_keys::CACHE_HIT], json!(true));
    }
}
