//! Size-bound eviction.
//!
//! Runs after a successful tier write: when the tier's live item count
//! exceeds its bound, evict just enough entries to return to it. LRU
//! orders by last access (falling back to creation for never-read
//! entries), FIFO by creation alone.

use serde::Deserialize;

use crate::storage::{FilterOptions, StorageAdapter, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Fifo,
}

/// Capacity enforcement for one tier.
#[derive(Debug, Clone, Copy)]
pub struct EvictionManager {
    max_size: usize,
    policy: EvictionPolicy,
}

impl EvictionManager {
    pub fn new(max_size: usize, policy: EvictionPolicy) -> Self {
        Self { max_size, policy }
    }

    /// Evict the oldest entries until the live count is back at the bound.
    /// Returns the number of evicted entries.
    pub async fn enforce(&self, adapter: &dyn StorageAdapter) -> Result<usize, StorageError> {
        let count = adapter.count(None).await?;
        if count <= self.max_size {
            return Ok(0);
        }
        let excess = count - self.max_size;

        let mut documents = adapter.find(FilterOptions::default()).await?;
        documents.sort_by_key(|doc| match self.policy {
            EvictionPolicy::Lru => doc.recency_ms(),
            EvictionPolicy::Fifo => doc.created_at_ms,
        });

        let victims: Vec<String> = documents
            .into_iter()
            .take(excess)
            .map(|doc| doc.key)
            .collect();
        adapter.delete_batch(&victims).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::storage::{MemoryAdapter, SaveOptions};

    use super::*;

    async fn save(adapter: &MemoryAdapter, key: &str) {
        adapter
            .save(key, json!(key), SaveOptions::default())
            .await
            .expect("save");
        // Keep creation timestamps strictly ordered.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn lru_prefers_recently_read_entries() {
        let adapter = MemoryAdapter::new();
        let manager = EvictionManager::new(2, EvictionPolicy::Lru);

        save(&adapter, "a").await;
        save(&adapter, "b").await;

        // Touch `a`, making `b` the least recently used.
        let _ = adapter.get("a").await.expect("get a");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        save(&adapter, "c").await;

        let evicted = manager.enforce(&adapter).await.expect("enforce");
        assert_eq!(evicted, 1);
        assert!(adapter.exists("a").await.expect("a"));
        assert!(!adapter.exists("b").await.expect("b"));
        assert!(adapter.exists("c").await.expect("c"));
    }

    #[tokio::test]
    async fn fifo_ignores_access_recency() {
        let adapter = MemoryAdapter::new();
        let manager = EvictionManager::new(2, EvictionPolicy::Fifo);

        save(&adapter, "a").await;
        save(&adapter, "b").await;
        let _ = adapter.get("a").await.expect("get a");
        save(&adapter, "c").await;

        let evicted = manager.enforce(&adapter).await.expect("enforce");
        assert_eq!(evicted, 1);
        // `a` is oldest by creation; reading it does not save it under FIFO.
        assert!(!adapter.exists("a").await.expect("a"));
        assert!(adapter.exists("b").await.expect("b"));
        assert!(adapter.exists("c").await.expect("c"));
    }

    #[tokio::test]
    async fn under_capacity_evicts_nothing() {
        let adapter = MemoryAdapter::new();
        let manager = EvictionManager::new(10, EvictionPolicy::Lru);
        save(&adapter, "a").await;

        assert_eq!(manager.enforce(&adapter).await.expect("enforce"), 0);
        assert!(adapter.exists("a").await.expect("a"));
    }

    #[tokio::test]
    async fn evicts_exactly_down_to_the_bound() {
        let adapter = MemoryAdapter::new();
        let manager = EvictionManager::new(2, EvictionPolicy::Fifo);
        for key in ["a", "b", "c", "d", "e"] {
            save(&adapter, key).await;
        }

        let evicted = manager.enforce(&adapter).await.expect("enforce");
        assert_eq!(evicted, 3);
        assert_eq!(adapter.count(None).await.expect("count"), 2);
        assert!(adapter.exists("d").await.expect("d"));
        assert!(adapter.exists("e").await.expect("e"));
    }
}
