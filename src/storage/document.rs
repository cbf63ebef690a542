//! The adapter-level envelope wrapping any cached or logged value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::SaveOptions;

/// Current wall clock as unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Envelope persisted by every backend.
///
/// `expires_at_ms` is `created_at_ms + ttl * 1000` when a TTL was supplied
/// at save time. A document past `expires_at_ms` is logically absent even
/// if the backend has not physically removed it yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDocument {
    pub key: String,
    pub data: Value,
    pub created_at_ms: i64,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub last_accessed_ms: Option<i64>,
}

impl StorageDocument {
    pub fn new(key: &str, data: Value, options: &SaveOptions) -> Self {
        let created_at_ms = now_millis();
        Self {
            key: key.to_string(),
            data,
            created_at_ms,
            expires_at_ms: options.ttl.map(|ttl| created_at_ms + (ttl as i64) * 1_000),
            tags: options.tags.clone(),
            metadata: options.metadata.clone(),
            access_count: 0,
            last_accessed_ms: None,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms > at)
    }

    /// Record one read for recency-based eviction.
    pub fn touch(&mut self, now_ms: i64) {
        self.access_count += 1;
        self.last_accessed_ms = Some(now_ms);
    }

    /// Timestamp used for LRU ordering: last access, falling back to creation.
    pub fn recency_ms(&self) -> i64 {
        self.last_accessed_ms.unwrap_or(self.created_at_ms)
    }

    /// Serialized payload size in bytes, for stats and size conditions.
    pub fn payload_size(&self) -> u64 {
        serde_json::to_vec(&self.data)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }

    pub fn has_all_tags(&self, wanted: &[String]) -> bool {
        match &self.tags {
            Some(tags) => wanted.iter().all(|tag| tags.contains(tag)),
            None => wanted.is_empty(),
        }
    }
}
