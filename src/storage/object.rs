//! Object-storage backend (S3-compatible).
//!
//! Documents are JSON objects under a key prefix. There is no server-side
//! index, so `find`, `count`, `cleanup` and `stats` are list-based scans;
//! this backend is meant for durable, low-traffic tiers and log archival,
//! not as a hot cache tier.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::{
    BatchEntry, BatchOutcome, CleanupOptions, FilterOptions, SaveOptions, StorageAdapter,
    StorageDocument, StorageError, StorageKind, StorageStats, compile_glob, now_millis, paginate,
};

const NAME_FRAGMENT_LEN: usize = 48;

/// Connection settings consumed by [`ObjectAdapter::connect`].
#[derive(Debug, Clone)]
pub struct ObjectSettings {
    pub bucket: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub key_prefix: String,
}

/// Object-store [`StorageAdapter`].
pub struct ObjectAdapter {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectAdapter {
    /// Wrap an existing store; used directly by tests with the in-memory
    /// implementation.
    pub fn new(store: Arc<dyn ObjectStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: key_prefix.into(),
        }
    }

    pub fn connect(settings: &ObjectSettings) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region);
        if let Some(access_key_id) = &settings.access_key_id {
            builder = builder.with_access_key_id(access_key_id);
        }
        if let Some(secret) = &settings.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        let store = builder
            .build()
            .map_err(|err| StorageError::configuration(err.to_string()))?;
        Ok(Self::new(Arc::new(store), settings.key_prefix.clone()))
    }

    /// One cheap listing round trip so bad credentials fail at startup.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        let prefix = ObjectPath::from(self.prefix.trim_end_matches('/'));
        self.store.list_with_delimiter(Some(&prefix)).await?;
        Ok(())
    }

    fn path_for(&self, key: &str) -> ObjectPath {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let fragment: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(NAME_FRAGMENT_LEN)
            .collect();
        ObjectPath::from(format!(
            "{}{fragment}-{}.json",
            self.prefix,
            &digest[..16]
        ))
    }

    async fn read_document(
        &self,
        path: &ObjectPath,
    ) -> Result<Option<StorageDocument>, StorageError> {
        let result = match self.store.get(path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let bytes = result.bytes().await?;

        let doc: StorageDocument = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %path, error = %err, "removing corrupt object document");
                let _ = self.store.delete(path).await;
                return Ok(None);
            }
        };
        if doc.is_expired(now_millis()) {
            let _ = self.store.delete(path).await;
            return Ok(None);
        }
        Ok(Some(doc))
    }

    async fn write_document(
        &self,
        path: &ObjectPath,
        doc: &StorageDocument,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(doc)?;
        self.store.put(path, PutPayload::from(bytes)).await?;
        Ok(())
    }

    async fn document_paths(&self) -> Result<Vec<ObjectPath>, StorageError> {
        let prefix = ObjectPath::from(self.prefix.trim_end_matches('/'));
        let mut listing = self.store.list(Some(&prefix));
        let mut paths = Vec::new();
        while let Some(meta) = listing.next().await {
            paths.push(meta?.location);
        }
        paths.sort();
        Ok(paths)
    }

    async fn filtered(&self, filter: &FilterOptions) -> Result<Vec<StorageDocument>, StorageError> {
        let pattern = filter.pattern.as_deref().and_then(compile_glob);
        let mut matched = Vec::new();
        for path in self.document_paths().await? {
            let Some(doc) = self.read_document(&path).await? else {
                continue;
            };
            if let Some(tags) = filter.tags.as_ref().filter(|tags| !tags.is_empty()) {
                if !doc.has_all_tags(tags) {
                    continue;
                }
            } else if let Some(re) = &pattern {
                if !re.is_match(&doc.key) {
                    continue;
                }
            }
            matched.push(doc);
        }
        matched.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matched)
    }
}

#[async_trait]
impl StorageAdapter for ObjectAdapter {
    fn kind(&self) -> StorageKind {
        StorageKind::Object
    }

    async fn save(
        &self,
        key: &str,
        data: Value,
        options: SaveOptions,
    ) -> Result<(), StorageError> {
        let doc = StorageDocument::new(key, data, &options);
        self.write_document(&self.path_for(key), &doc).await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(key);
        match self.read_document(&path).await? {
            Some(mut doc) => {
                doc.touch(now_millis());
                if let Err(err) = self.write_document(&path, &doc).await {
                    warn!(key, error = %err, "failed to persist access stats");
                }
                Ok(Some(doc.data))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match self.store.delete(&self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.read_document(&self.path_for(key)).await?.is_some())
    }

    async fn save_batch(&self, entries: Vec<BatchEntry>) -> Result<BatchOutcome, StorageError> {
        let mut outcome = BatchOutcome::default();
        for entry in entries {
            match self.save(&entry.key, entry.data, entry.options).await {
                Ok(()) => outcome.saved += 1,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "batch save entry failed");
                    outcome.failed.push(entry.key);
                }
            }
        }
        Ok(outcome)
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await.unwrap_or(None));
        }
        Ok(results)
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await.unwrap_or(false) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn find(&self, filter: FilterOptions) -> Result<Vec<StorageDocument>, StorageError> {
        let matched = self.filtered(&filter).await?;
        Ok(paginate(matched, filter.limit, filter.offset))
    }

    async fn count(&self, filter: Option<FilterOptions>) -> Result<usize, StorageError> {
        Ok(self.filtered(&filter.unwrap_or_default()).await?.len())
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<usize, StorageError> {
        let now = now_millis();
        let mut affected = 0;
        for path in self.document_paths().await? {
            let expired = match self.store.get(&path).await {
                Ok(result) => match result.bytes().await {
                    Ok(bytes) => match serde_json::from_slice::<StorageDocument>(&bytes) {
                        Ok(doc) => doc.is_expired(now),
                        Err(_) => true,
                    },
                    Err(_) => continue,
                },
                Err(_) => continue,
            };
            if options.expired_only && !expired {
                continue;
            }
            affected += 1;
            if !options.dry_run {
                let _ = self.store.delete(&path).await;
            }
        }
        Ok(affected)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let now = now_millis();
        let mut stats = StorageStats {
            storage_type: self.kind().to_string(),
            ..StorageStats::default()
        };
        for path in self.document_paths().await? {
            let Ok(result) = self.store.get(&path).await else {
                continue;
            };
            let Ok(bytes) = result.bytes().await else {
                continue;
            };
            let Ok(doc) = serde_json::from_slice::<StorageDocument>(&bytes) else {
                continue;
            };
            stats.total_items += 1;
            if doc.is_expired(now) {
                stats.expired_items += 1;
            } else {
                stats.active_items += 1;
            }
            stats.total_size += doc.payload_size();
            stats.oldest_item_ms = Some(
                stats
                    .oldest_item_ms
                    .map_or(doc.created_at_ms, |v| v.min(doc.created_at_ms)),
            );
            stats.newest_item_ms = Some(
                stats
                    .newest_item_ms
                    .map_or(doc.created_at_ms, |v| v.max(doc.created_at_ms)),
            );
        }
        if stats.total_items > 0 {
            stats.avg_item_size = stats.total_size / stats.total_items as u64;
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use serde_json::json;

    use super::*;

    fn adapter() -> ObjectAdapter {
        ObjectAdapter::new(Arc::new(InMemory::new()), "sosta/")
    }

    #[tokio::test]
    async fn roundtrip_through_object_paths() {
        let adapter = adapter();
        adapter
            .save("GET|/api/items", json!({"items": []}), SaveOptions::default())
            .await
            .expect("save");

        assert_eq!(
            adapter.get("GET|/api/items").await.expect("get"),
            Some(json!({"items": []}))
        );
        assert!(adapter.delete("GET|/api/items").await.expect("delete"));
        assert!(!adapter.exists("GET|/api/items").await.expect("exists"));
    }

    #[tokio::test]
    async fn list_scoped_to_prefix() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let ours = ObjectAdapter::new(store.clone(), "sosta/");
        let theirs = ObjectAdapter::new(store, "other/");

        ours.save("k", json!(1), SaveOptions::default())
            .await
            .expect("save ours");
        theirs
            .save("k", json!(2), SaveOptions::default())
            .await
            .expect("save theirs");

        assert_eq!(ours.count(None).await.expect("count"), 1);
        let docs = ours.find(FilterOptions::default()).await.expect("find");
        assert_eq!(docs[0].data, json!(1));
    }

    #[tokio::test]
    async fn corrupt_object_self_heals() {
        let adapter = adapter();
        adapter
            .save("broken", json!(1), SaveOptions::default())
            .await
            .expect("save");

        let path = adapter.path_for("broken");
        adapter
            .store
            .put(&path, PutPayload::from_static(b"{ nope"))
            .await
            .expect("corrupt");

        assert_eq!(adapter.get("broken").await.expect("get"), None);
        assert!(!adapter.exists("broken").await.expect("exists"));
    }

    #[tokio::test]
    async fn cleanup_flush_and_dry_run() {
        let adapter = adapter();
        for i in 0..3 {
            adapter
                .save(&format!("k{i}"), json!(i), SaveOptions::default())
                .await
                .expect("save");
        }

        let would = adapter
            .cleanup(CleanupOptions {
                expired_only: false,
                dry_run: true,
            })
            .await
            .expect("dry run");
        assert_eq!(would, 3);
        assert_eq!(adapter.count(None).await.expect("count"), 3);

        let removed = adapter
            .cleanup(CleanupOptions::default())
            .await
            .expect("flush");
        assert_eq!(removed, 3);
        assert_eq!(adapter.count(None).await.expect("count"), 0);
    }
}
