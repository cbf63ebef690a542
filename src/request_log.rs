//! Proxied-request audit log.
//!
//! Each proxied request is persisted as one document in a storage
//! backend, tagged by method so `find` can slice the log without a
//! scan. Recording is best-effort: a failed write warns and the request
//! carries on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{FilterOptions, SaveOptions, StorageAdapter, StorageError, now_millis};

const LOG_TAG: &str = "request-log";

/// One proxied request, as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    /// `hit`, `miss` or `bypass`.
    pub cache_outcome: String,
    pub tier: Option<String>,
    pub duration_ms: u64,
    pub recorded_at_ms: i64,
}

pub struct RequestLogService {
    adapter: Arc<dyn StorageAdapter>,
    ttl: Duration,
    // Disambiguates records sharing a millisecond.
    sequence: AtomicU64,
}

impl RequestLogService {
    pub fn new(adapter: Arc<dyn StorageAdapter>, ttl: Duration) -> Self {
        Self {
            adapter,
            ttl,
            sequence: AtomicU64::new(0),
        }
    }

    /// Persist one record; failures are logged and swallowed.
    pub async fn record(&self, record: RequestRecord) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let key = format!("log:{}:{sequence}", record.recorded_at_ms);
        let method_tag = record.method.to_ascii_uppercase();

        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "request record not serializable");
                return;
            }
        };

        let options = SaveOptions {
            ttl: Some(self.ttl.as_secs()),
            tags: Some(vec![LOG_TAG.to_string(), method_tag]),
            metadata: None,
        };
        if let Err(err) = self.adapter.save(&key, value, options).await {
            warn!(error = %err, "failed to persist request record");
        }
    }

    /// Recent records, optionally narrowed to one method.
    pub async fn recent(
        &self,
        method: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StorageError> {
        let mut tags = vec![LOG_TAG.to_string()];
        if let Some(method) = method {
            tags.push(method.to_ascii_uppercase());
        }

        let mut documents = self
            .adapter
            .find(FilterOptions {
                tags: Some(tags),
                ..FilterOptions::default()
            })
            .await?;
        documents.sort_by_key(|doc| std::cmp::Reverse(doc.created_at_ms));

        Ok(documents
            .into_iter()
            .take(limit)
            .filter_map(|doc| serde_json::from_value(doc.data).ok())
            .collect())
    }
}

impl RequestRecord {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        status: u16,
        cache_outcome: impl Into<String>,
        tier: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            status,
            cache_outcome: cache_outcome.into(),
            tier,
            duration_ms,
            recorded_at_ms: now_millis(),
        }
    }
}
