//! Durable file-backed storage backend.
//!
//! One JSON document per key under a configured directory. Filenames are a
//! sanitized key fragment plus a digest suffix so arbitrary keys map to
//! unique, filesystem-safe names. Corrupt files are deleted on read.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;

use super::{
    BatchEntry, BatchOutcome, CleanupOptions, FilterOptions, SaveOptions, StorageAdapter,
    StorageDocument, StorageError, StorageKind, StorageStats, compile_glob, now_millis, paginate,
};

const DOC_EXTENSION: &str = "json";
const NAME_FRAGMENT_LEN: usize = 48;

/// File-backed [`StorageAdapter`].
pub struct FileAdapter {
    directory: PathBuf,
    key_prefix: String,
}

impl FileAdapter {
    pub fn new(directory: impl Into<PathBuf>, key_prefix: Option<String>) -> Self {
        Self {
            directory: directory.into(),
            key_prefix: key_prefix.unwrap_or_default(),
        }
    }

    /// Creates the backing directory; fails fast on an unwritable path.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let full_key = format!("{}{}", self.key_prefix, key);
        let digest = hex::encode(Sha256::digest(full_key.as_bytes()));
        let fragment: String = full_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(NAME_FRAGMENT_LEN)
            .collect();
        self.directory
            .join(format!("{fragment}-{}.{DOC_EXTENSION}", &digest[..16]))
    }

    /// Read a document; expired or unparseable files are deleted and
    /// reported absent.
    async fn read_document(&self, path: &Path) -> Result<Option<StorageDocument>, StorageError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let doc: StorageDocument = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "removing corrupt storage document");
                let _ = fs::remove_file(path).await;
                return Ok(None);
            }
        };

        if doc.is_expired(now_millis()) {
            let _ = fs::remove_file(path).await;
            return Ok(None);
        }
        Ok(Some(doc))
    }

    async fn write_document(&self, path: &Path, doc: &StorageDocument) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(doc)?;
        fs::write(path, bytes).await?;
        Ok(())
    }

    async fn document_paths(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut paths = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == DOC_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Full scan with lazy expiry; the file store has no tag index, so tag
    /// filters walk every live document.
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
impl StorageAdapter for FileAdapter {
    fn kind(&self) -> StorageKind {
        StorageKind::File
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
                // Access stats are best-effort; a failed write-back must not
                // turn a hit into an error.
                if let Err(err) = self.write_document(&path, &doc).await {
                    warn!(key, error = %err, "failed to persist access stats");
                }
                Ok(Some(doc.data))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
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
                Err(_) => outcome.failed.push(entry.key),
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
        let filter = filter.unwrap_or_default();
        Ok(self.filtered(&filter).await?.len())
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<usize, StorageError> {
        let now = now_millis();
        let mut affected = 0;
        for path in self.document_paths().await? {
            let expired = match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<StorageDocument>(&bytes) {
                    Ok(doc) => doc.is_expired(now),
                    // Corrupt files count as removable regardless of mode.
                    Err(_) => true,
                },
                Err(_) => continue,
            };

            if options.expired_only && !expired {
                continue;
            }
            affected += 1;
            if !options.dry_run {
                let _ = fs::remove_file(&path).await;
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
            let Ok(bytes) = fs::read(&path).await else {
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
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    async fn adapter() -> (TempDir, FileAdapter) {
        let dir = TempDir::new().expect("temp dir");
        let adapter = FileAdapter::new(dir.path(), None);
        adapter.initialize().await.expect("initialize");
        (dir, adapter)
    }

    #[tokio::test]
    async fn roundtrip_and_persistence_across_reopen() {
        let (dir, adapter) = adapter().await;
        adapter
            .save("k1", json!({"v": "durable"}), SaveOptions::default())
            .await
            .expect("save");

        // A fresh adapter over the same directory sees the document.
        let reopened = FileAdapter::new(dir.path(), None);
        assert_eq!(
            reopened.get("k1").await.expect("get"),
            Some(json!({"v": "durable"}))
        );
    }

    #[tokio::test]
    async fn keys_with_awkward_characters_are_safe() {
        let (_dir, adapter) = adapter().await;
        let key = "GET|https://origin/api?b=2&a=1|h:x";
        adapter
            .save(key, json!(1), SaveOptions::default())
            .await
            .expect("save");
        assert!(adapter.exists(key).await.expect("exists"));
        assert!(adapter.delete(key).await.expect("delete"));
    }

    #[tokio::test]
    async fn distinct_keys_with_same_sanitized_fragment_do_not_collide() {
        let (_dir, adapter) = adapter().await;
        adapter
            .save("a/b", json!("one"), SaveOptions::default())
            .await
            .expect("save a/b");
        adapter
            .save("a?b", json!("two"), SaveOptions::default())
            .await
            .expect("save a?b");

        assert_eq!(adapter.get("a/b").await.expect("get"), Some(json!("one")));
        assert_eq!(adapter.get("a?b").await.expect("get"), Some(json!("two")));
    }

    #[tokio::test]
    async fn corrupt_file_is_self_healed() {
        let (_dir, adapter) = adapter().await;
        adapter
            .save("broken", json!(1), SaveOptions::default())
            .await
            .expect("save");

        let path = adapter.path_for("broken");
        fs::write(&path, b"{ not json").await.expect("corrupt");

        assert_eq!(adapter.get("broken").await.expect("get"), None);
        assert!(!adapter.exists("broken").await.expect("exists"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn expired_document_removed_on_read() {
        let (_dir, adapter) = adapter().await;
        adapter
            .save("stale", json!(1), SaveOptions::with_ttl(300))
            .await
            .expect("save");

        let path = adapter.path_for("stale");
        let bytes = fs::read(&path).await.expect("read raw");
        let mut doc: StorageDocument = serde_json::from_slice(&bytes).expect("parse");
        doc.expires_at_ms = Some(now_millis() - 1);
        fs::write(&path, serde_json::to_vec(&doc).expect("encode"))
            .await
            .expect("rewrite");

        assert_eq!(adapter.get("stale").await.expect("get"), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cleanup_expired_only_spares_live_documents() {
        let (_dir, adapter) = adapter().await;
        adapter
            .save("live", json!(1), SaveOptions::default())
            .await
            .expect("save live");
        adapter
            .save("dead", json!(2), SaveOptions::with_ttl(300))
            .await
            .expect("save dead");

        let path = adapter.path_for("dead");
        let bytes = fs::read(&path).await.expect("read raw");
        let mut doc: StorageDocument = serde_json::from_slice(&bytes).expect("parse");
        doc.expires_at_ms = Some(now_millis() - 1);
        fs::write(&path, serde_json::to_vec(&doc).expect("encode"))
            .await
            .expect("rewrite");

        let dry = adapter
            .cleanup(CleanupOptions {
                expired_only: true,
                dry_run: true,
            })
            .await
            .expect("dry run");
        assert_eq!(dry, 1);

        let removed = adapter.cleanup(CleanupOptions::expired()).await.expect("cleanup");
        assert_eq!(removed, 1);
        assert_eq!(adapter.count(None).await.expect("count"), 1);
        assert!(adapter.exists("live").await.expect("live exists"));
    }

    #[tokio::test]
    async fn find_by_tags_without_index() {
        let (_dir, adapter) = adapter().await;
        adapter
            .save(
                "tagged",
                json!(1),
                SaveOptions {
                    tags: Some(vec!["x".into(), "y".into()]),
                    ..SaveOptions::default()
                },
            )
            .await
            .expect("save");
        adapter
            .save("plain", json!(2), SaveOptions::default())
            .await
            .expect("save plain");

        let hits = adapter
            .find(FilterOptions {
                tags: Some(vec!["x".into()]),
                ..FilterOptions::default()
            })
            .await
            .expect("find");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "tagged");
    }
}
