//! Startup wiring: configuration into live tiers and services.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{
    CacheService, CacheTier, EvictionPolicy, KeyBuilder, RuleEngine, TierCoordinator,
};
use crate::config::{CacheSettings, TierSettings};
use crate::storage::{MemoryAdapter, StorageAdapter, StorageRegistry};

use super::error::InfraError;

/// Build every configured tier. Optional tiers whose backend cannot be
/// reached degrade to in-process memory; required tiers abort startup.
pub async fn build_tiers(
    registry: &StorageRegistry,
    settings: &CacheSettings,
) -> Result<TierCoordinator, InfraError> {
    let mut tiers = Vec::with_capacity(settings.tiers.len());
    for tier in &settings.tiers {
        let adapter = build_tier_adapter(registry, tier).await?;
        info!(
            tier = %tier.name,
            backend = %adapter.kind(),
            max_size = tier.max_size,
            "cache tier ready"
        );
        tiers.push(CacheTier::new(
            tier.name.clone(),
            adapter,
            tier.max_size,
            tier.eviction_policy,
        ));
    }
    Ok(TierCoordinator::new(tiers))
}

async fn build_tier_adapter(
    registry: &StorageRegistry,
    tier: &TierSettings,
) -> Result<Box<dyn StorageAdapter>, InfraError> {
    match registry
        .create_adapter(tier.storage.kind(), &tier.storage)
        .await
    {
        Ok(adapter) => Ok(adapter),
        Err(err) if tier.required => Err(InfraError::configuration(format!(
            "required tier `{}` failed to initialize: {err}",
            tier.name
        ))),
        Err(err) => {
            warn!(
                tier = %tier.name,
                backend = %tier.storage.kind(),
                error = %err,
                "tier backend unavailable, degrading to memory"
            );
            Ok(Box::new(MemoryAdapter::new()))
        }
    }
}

/// Assemble the cache service from validated settings.
pub fn build_cache_service(
    settings: &CacheSettings,
    tiers: Arc<TierCoordinator>,
) -> Result<CacheService, InfraError> {
    let rules = RuleEngine::new(
        settings.rules.clone(),
        settings.default_ttl,
        default_cacheable_methods(),
    )?;
    Ok(CacheService::new(
        KeyBuilder::new(settings.key.clone()),
        rules,
        tiers,
        settings.enabled,
    ))
}

fn default_cacheable_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}
