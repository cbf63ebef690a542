//! Multi-tier cache coordination.
//!
//! Tiers are independent address spaces tried in priority order; there is
//! no promotion between them. Every tier operation is fail-open: an
//! erroring adapter is a miss on that tier only, and a failed tier write
//! never stops the others.

use metrics::counter;
use tracing::{debug, warn};

use crate::storage::{CleanupOptions, SaveOptions, StorageAdapter, StorageError, StorageStats};

use super::entry::CacheEntry;
use super::eviction::{EvictionManager, EvictionPolicy};

/// One backing store of the multi-level cache.
pub struct CacheTier {
    pub name: String,
    pub adapter: Box<dyn StorageAdapter>,
    pub eviction: Option<EvictionManager>,
}

impl CacheTier {
    pub fn new(
        name: impl Into<String>,
        adapter: Box<dyn StorageAdapter>,
        max_size: Option<usize>,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            adapter,
            eviction: max_size.map(|max| EvictionManager::new(max, policy)),
        }
    }
}

/// A cache hit, annotated with the tier that served it.
pub struct TierHit {
    pub entry: CacheEntry,
    pub tier: String,
}

/// Lookup and write-through across all configured tiers.
pub struct TierCoordinator {
    tiers: Vec<CacheTier>,
}

impl TierCoordinator {
    pub fn new(tiers: Vec<CacheTier>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &[CacheTier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// First tier with a live entry wins; errors and undecodable values
    /// count as a miss on that tier only.
    pub async fn lookup(&self, key: &str) -> Option<TierHit> {
        for tier in &self.tiers {
            let value = match tier.adapter.get(key).await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    counter!("sosta_cache_tier_miss_total", "tier" => tier.name.clone())
                        .increment(1);
                    continue;
                }
                Err(err) => {
                    warn!(tier = %tier.name, error = %err, "tier lookup failed, treating as miss");
                    counter!("sosta_cache_tier_error_total", "tier" => tier.name.clone())
                        .increment(1);
                    continue;
                }
            };
            match CacheEntry::from_value(value) {
                Some(entry) => {
                    debug!(tier = %tier.name, "cache hit");
                    counter!("sosta_cache_tier_hit_total", "tier" => tier.name.clone())
                        .increment(1);
                    return Some(TierHit {
                        entry,
                        tier: tier.name.clone(),
                    });
                }
                None => {
                    // Not a cache entry: self-heal and move on.
                    let _ = tier.adapter.delete(key).await;
                    continue;
                }
            }
        }
        None
    }

    /// Write the entry to every tier; each write is independent, and a
    /// failure is logged, counted and otherwise ignored.
    pub async fn write_through(&self, key: &str, entry: &CacheEntry, tags: Option<Vec<String>>) {
        let value = match entry.to_value() {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "cache entry not serializable, skipping write");
                return;
            }
        };

        for tier in &self.tiers {
            let options = SaveOptions {
                ttl: entry.ttl_seconds,
                tags: tags.clone(),
                metadata: None,
            };
            if let Err(err) = tier.adapter.save(key, value.clone(), options).await {
                warn!(tier = %tier.name, error = %err, "tier write failed, continuing");
                counter!("sosta_cache_write_failure_total", "tier" => tier.name.clone())
                    .increment(1);
                continue;
            }
            if let Some(eviction) = &tier.eviction {
                match eviction.enforce(tier.adapter.as_ref()).await {
                    Ok(evicted) if evicted > 0 => {
                        counter!("sosta_cache_evict_total", "tier" => tier.name.clone())
                            .increment(evicted as u64);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(tier = %tier.name, error = %err, "eviction pass failed");
                    }
                }
            }
        }
    }

    /// Remove the key from every tier; used by admin invalidation.
    pub async fn invalidate(&self, key: &str) -> usize {
        let mut removed = 0;
        for tier in &self.tiers {
            match tier.adapter.delete(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(tier = %tier.name, error = %err, "tier delete failed"),
            }
        }
        removed
    }

    /// Run a cleanup pass on every tier, collecting per-tier counts.
    pub async fn cleanup_all(&self, options: CleanupOptions) -> Vec<(String, usize)> {
        let mut results = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            match tier.adapter.cleanup(options).await {
                Ok(affected) => results.push((tier.name.clone(), affected)),
                Err(err) => {
                    warn!(tier = %tier.name, error = %err, "tier cleanup failed");
                    results.push((tier.name.clone(), 0));
                }
            }
        }
        results
    }

    pub async fn stats_all(&self) -> Vec<(String, Result<StorageStats, StorageError>)> {
        let mut results = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            results.push((tier.name.clone(), tier.adapter.stats().await));
        }
        results
    }

    pub async fn close_all(&self) {
        for tier in &self.tiers {
            if let Err(err) = tier.adapter.close().await {
                warn!(tier = %tier.name, error = %err, "tier close failed");
            }
        }
    }
}
