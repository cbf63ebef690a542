//! Sosta cache subsystem.
//!
//! The pipeline for one request: the [`key::KeyBuilder`] names it, the
//! [`rules::RuleEngine`] decides whether and how long to cache it, the
//! [`tiers::TierCoordinator`] reads and writes it across the configured
//! storage tiers, and the [`sweeper`] reclaims expired entries in the
//! background.
//!
//! Tiers and eviction are configured in `sosta.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! default_ttl = 300
//!
//! [[cache.rules]]
//! pattern = "/api/*"
//! ttl = 60
//!
//! [[cache.tiers]]
//! name = "memory"
//! max_size = 10000
//! eviction_policy = "lru"
//! storage = { type = "memory" }
//! ```

pub mod entry;
pub mod eviction;
pub mod key;
pub mod middleware;
pub mod rules;
pub mod sweeper;
pub mod tiers;

pub use entry::CacheEntry;
pub use eviction::{EvictionManager, EvictionPolicy};
pub use key::{GeneratedKey, KeyBuilder, KeyError, KeyOptions};
pub use middleware::{CachePlan, CacheService, CacheState, response_cache_layer};
pub use rules::{CacheRule, Decision, RuleConditions, RuleEngine, RuleError};
pub use sweeper::{spawn_sweeper, sweep_once};
pub use tiers::{CacheTier, TierCoordinator, TierHit};
