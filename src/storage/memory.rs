//! In-process storage backend.
//!
//! The default tier: a map behind an async `RwLock` plus a tag index.
//! Fast, optionally bounded by `max_items`, and gone on restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    BatchEntry, BatchOutcome, CleanupOptions, FilterOptions, SaveOptions, StorageAdapter,
    StorageDocument, StorageError, StorageKind, StorageStats, compile_glob, now_millis, paginate,
};

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, StorageDocument>,
    /// tag -> keys carrying it
    tag_index: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn index_tags(&mut self, key: &str, tags: Option<&Vec<String>>) {
        if let Some(tags) = tags {
            for tag in tags {
                self.tag_index
                    .entry(tag.clone())
                    .or_default()
                    .insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, tags: Option<&Vec<String>>) {
        if let Some(tags) = tags {
            for tag in tags {
                if let Some(keys) = self.tag_index.get_mut(tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.tag_index.remove(tag);
                    }
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<StorageDocument> {
        let doc = self.documents.remove(key)?;
        let tags = doc.tags.clone();
        self.unindex(key, tags.as_ref());
        Some(doc)
    }
}

/// In-memory [`StorageAdapter`].
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<RwLock<MemoryState>>,
    max_items: Option<usize>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounded variant: inserts past `max_items` evict the least
    /// recently used document.
    pub fn with_capacity(max_items: usize) -> Self {
        Self {
            max_items: Some(max_items),
            ..Self::default()
        }
    }

    /// Test hook: backdate an entry's expiry so lazy-expiry paths can be
    /// exercised without sleeping.
    #[cfg(test)]
    pub(crate) async fn force_expire(&self, key: &str) {
        let mut state = self.state.write().await;
        if let Some(doc) = state.documents.get_mut(key) {
            doc.expires_at_ms = Some(now_millis() - 1);
        }
    }

    /// Keys whose tag sets intersect to a non-empty result for `tags`.
    async fn keys_for_tags(&self, tags: &[String]) -> Vec<String> {
        let state = self.state.read().await;
        let mut sets = tags.iter().map(|tag| {
            state
                .tag_index
                .get(tag)
                .cloned()
                .unwrap_or_default()
        });

        let Some(mut intersection) = sets.next() else {
            return Vec::new();
        };
        for set in sets {
            intersection.retain(|key| set.contains(key));
        }
        let mut keys: Vec<String> = intersection.into_iter().collect();
        keys.sort();
        keys
    }

    async fn filtered(&self, filter: &FilterOptions) -> Vec<StorageDocument> {
        let now = now_millis();
        let mut matched = Vec::new();

        if let Some(tags) = filter.tags.as_ref().filter(|tags| !tags.is_empty()) {
            let keys = self.keys_for_tags(tags).await;
            let state = self.state.read().await;
            for key in keys {
                if let Some(doc) = state.documents.get(&key) {
                    if !doc.is_expired(now) {
                        matched.push(doc.clone());
                    }
                }
            }
        } else {
            let pattern = filter.pattern.as_deref().and_then(compile_glob);
            let state = self.state.read().await;
            let mut keys: Vec<&String> = state.documents.keys().collect();
            keys.sort();
            for key in keys {
                if let Some(re) = &pattern {
                    if !re.is_match(key) {
                        continue;
                    }
                }
                let doc = &state.documents[key];
                if !doc.is_expired(now) {
                    matched.push(doc.clone());
                }
            }
        }

        matched
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn save(
        &self,
        key: &str,
        data: Value,
        options: SaveOptions,
    ) -> Result<(), StorageError> {
        let doc = StorageDocument::new(key, data, &options);
        let mut state = self.state.write().await;
        if let Some(previous) = state.documents.remove(key) {
            let tags = previous.tags.clone();
            state.unindex(key, tags.as_ref());
        }
        state.index_tags(key, doc.tags.as_ref());
        state.documents.insert(key.to_string(), doc);
        if let Some(max) = self.max_items {
            while state.documents.len() > max {
                let victim = state
                    .documents
                    .values()
                    .min_by_key(|doc| (doc.recency_ms(), doc.key.clone()))
                    .map(|doc| doc.key.clone());
                let Some(victim) = victim else { break };
                state.remove(&victim);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let expired = matches!(state.documents.get(key), Some(doc) if doc.is_expired(now));
        if expired {
            state.remove(key);
            return Ok(None);
        }
        let Some(doc) = state.documents.get_mut(key) else {
            return Ok(None);
        };
        doc.touch(now);
        Ok(Some(doc.data.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut state = self.state.write().await;
        Ok(state.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let expired = matches!(state.documents.get(key), Some(doc) if doc.is_expired(now));
        if expired {
            state.remove(key);
            return Ok(false);
        }
        Ok(state.documents.contains_key(key))
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
        let mut state = self.state.write().await;
        for key in keys {
            if state.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn find(&self, filter: FilterOptions) -> Result<Vec<StorageDocument>, StorageError> {
        let matched = self.filtered(&filter).await;
        Ok(paginate(matched, filter.limit, filter.offset))
    }

    async fn count(&self, filter: Option<FilterOptions>) -> Result<usize, StorageError> {
        match filter {
            Some(filter) => Ok(self.filtered(&filter).await.len()),
            None => {
                let now = now_millis();
                let state = self.state.read().await;
                Ok(state
                    .documents
                    .values()
                    .filter(|doc| !doc.is_expired(now))
                    .count())
            }
        }
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<usize, StorageError> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let victims: Vec<String> = state
            .documents
            .values()
            .filter(|doc| !options.expired_only || doc.is_expired(now))
            .map(|doc| doc.key.clone())
            .collect();

        if !options.dry_run {
            for key in &victims {
                state.remove(key);
            }
        }
        Ok(victims.len())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let now = now_millis();
        let state = self.state.read().await;

        let mut stats = StorageStats {
            storage_type: self.kind().to_string(),
            ..StorageStats::default()
        };
        for doc in state.documents.values() {
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
        stats.custom = Some(serde_json::json!({ "tags": state.tag_index.len() }));
        Ok(stats)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn save_get_delete_roundtrip() {
        let adapter = MemoryAdapter::new();

        adapter
            .save("k1", json!({"v": 1}), SaveOptions::default())
            .await
            .expect("save");

        assert_eq!(adapter.get("k1").await.expect("get"), Some(json!({"v": 1})));
        assert!(adapter.exists("k1").await.expect("exists"));

        assert!(adapter.delete("k1").await.expect("delete"));
        assert!(!adapter.delete("k1").await.expect("second delete"));
        assert_eq!(adapter.get("k1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn expired_entry_is_absent_and_self_healed() {
        let adapter = MemoryAdapter::new();
        adapter
            .save("short", json!("v"), SaveOptions::with_ttl(1))
            .await
            .expect("save");

        // Force expiry without sleeping.
        {
            let mut state = adapter.state.write().await;
            let doc = state.documents.get_mut("short").expect("doc");
            doc.expires_at_ms = Some(now_millis() - 1);
        }

        assert_eq!(adapter.get("short").await.expect("get"), None);
        // get() removed the expired entry entirely
        assert_eq!(adapter.state.read().await.documents.len(), 0);
        assert_eq!(adapter.count(None).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn tag_intersection_find() {
        let adapter = MemoryAdapter::new();
        adapter
            .save(
                "k1",
                json!(1),
                SaveOptions {
                    tags: Some(vec!["x".into()]),
                    ..SaveOptions::default()
                },
            )
            .await
            .expect("save k1");
        adapter
            .save(
                "k2",
                json!(2),
                SaveOptions {
                    tags: Some(vec!["y".into()]),
                    ..SaveOptions::default()
                },
            )
            .await
            .expect("save k2");

        let only_x = adapter
            .find(FilterOptions {
                tags: Some(vec!["x".into()]),
                ..FilterOptions::default()
            })
            .await
            .expect("find x");
        assert_eq!(only_x.len(), 1);
        assert_eq!(only_x[0].key, "k1");

        let both = adapter
            .find(FilterOptions {
                tags: Some(vec!["x".into(), "y".into()]),
                ..FilterOptions::default()
            })
            .await
            .expect("find x+y");
        assert!(both.is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_tag_index() {
        let adapter = MemoryAdapter::new();
        adapter
            .save(
                "k",
                json!(1),
                SaveOptions {
                    tags: Some(vec!["old".into()]),
                    ..SaveOptions::default()
                },
            )
            .await
            .expect("first save");
        adapter
            .save(
                "k",
                json!(2),
                SaveOptions {
                    tags: Some(vec!["new".into()]),
                    ..SaveOptions::default()
                },
            )
            .await
            .expect("second save");

        let stale = adapter
            .find(FilterOptions {
                tags: Some(vec!["old".into()]),
                ..FilterOptions::default()
            })
            .await
            .expect("find old");
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn cleanup_dry_run_counts_without_deleting() {
        let adapter = MemoryAdapter::new();
        adapter
            .save("a", json!(1), SaveOptions::with_ttl(1))
            .await
            .expect("save a");
        adapter
            .save("b", json!(2), SaveOptions::default())
            .await
            .expect("save b");

        {
            let mut state = adapter.state.write().await;
            state.documents.get_mut("a").expect("a").expires_at_ms = Some(now_millis() - 1);
        }

        let would = adapter
            .cleanup(CleanupOptions {
                expired_only: true,
                dry_run: true,
            })
            .await
            .expect("dry run");
        assert_eq!(would, 1);
        assert_eq!(adapter.state.read().await.documents.len(), 2);

        let removed = adapter.cleanup(CleanupOptions::expired()).await.expect("cleanup");
        assert_eq!(removed, 1);
        assert_eq!(adapter.count(None).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn full_flush_removes_everything() {
        let adapter = MemoryAdapter::new();
        for i in 0..3 {
            adapter
                .save(&format!("k{i}"), json!(i), SaveOptions::default())
                .await
                .expect("save");
        }
        let removed = adapter
            .cleanup(CleanupOptions::default())
            .await
            .expect("flush");
        assert_eq!(removed, 3);
        assert_eq!(adapter.count(None).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn batch_results_are_per_key() {
        let adapter = MemoryAdapter::new();
        let outcome = adapter
            .save_batch(vec![
                BatchEntry {
                    key: "a".into(),
                    data: json!(1),
                    options: SaveOptions::default(),
                },
                BatchEntry {
                    key: "b".into(),
                    data: json!(2),
                    options: SaveOptions::default(),
                },
            ])
            .await
            .expect("batch save");
        assert_eq!(outcome.saved, 2);
        assert!(outcome.failed.is_empty());

        let values = adapter
            .get_batch(&["a".into(), "missing".into(), "b".into()])
            .await
            .expect("batch get");
        assert_eq!(values, vec![Some(json!(1)), None, Some(json!(2))]);

        let removed = adapter
            .delete_batch(&["a".into(), "missing".into()])
            .await
            .expect("batch delete");
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn stats_reflect_contents() {
        let adapter = MemoryAdapter::new();
        adapter
            .save("a", json!({"payload": "xxxx"}), SaveOptions::default())
            .await
            .expect("save");

        let stats = adapter.stats().await.expect("stats");
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.active_items, 1);
        assert_eq!(stats.expired_items, 0);
        assert!(stats.total_size > 0);
        assert_eq!(stats.storage_type, "memory");
        assert_eq!(stats.custom, Some(json!({ "tags": 0 })));
    }

    #[tokio::test]
    async fn bounded_adapter_evicts_least_recently_used() {
        let adapter = MemoryAdapter::with_capacity(2);
        adapter
            .save("a", json!(1), SaveOptions::default())
            .await
            .expect("save a");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        adapter
            .save("b", json!(2), SaveOptions::default())
            .await
            .expect("save b");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Touch "a" so "b" is the least recently used.
        assert!(adapter.get("a").await.expect("get a").is_some());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        adapter
            .save("c", json!(3), SaveOptions::default())
            .await
            .expect("save c");

        assert_eq!(adapter.count(None).await.expect("count"), 2);
        assert!(adapter.exists("a").await.expect("a"));
        assert!(!adapter.exists("b").await.expect("b"));
        assert!(adapter.exists("c").await.expect("c"));
    }

    #[tokio::test]
    async fn find_pattern_scan_with_pagination() {
        let adapter = MemoryAdapter::new();
        for i in 0..5 {
            adapter
                .save(&format!("cache:{i}"), json!(i), SaveOptions::default())
                .await
                .expect("save");
        }
        adapter
            .save("log:0", json!(0), SaveOptions::default())
            .await
            .expect("save log");

        let page = adapter
            .find(FilterOptions {
                pattern: Some("cache:*".into()),
                limit: Some(2),
                offset: Some(1),
                ..FilterOptions::default()
            })
            .await
            .expect("find");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].key, "cache:1");
        assert_eq!(page[1].key, "cache:2");
    }
}
