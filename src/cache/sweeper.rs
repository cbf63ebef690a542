//! Background expiry sweeper.
//!
//! Lazy expiry already keeps reads correct; the sweeper exists so expired
//! entries do not pile up in tiers that are rarely read. It runs a
//! `cleanup(expired_only)` pass over every tier on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::storage::CleanupOptions;

use super::tiers::TierCoordinator;

/// One sweep over every tier. Returns the total number of removed entries.
pub async fn sweep_once(tiers: &TierCoordinator) -> usize {
    let mut removed = 0;
    for (tier, affected) in tiers.cleanup_all(CleanupOptions::expired()).await {
        if affected > 0 {
            debug!(tier = %tier, removed = affected, "swept expired entries");
            counter!("sosta_cache_sweep_removed_total", "tier" => tier).increment(affected as u64);
        }
        removed += affected;
    }
    removed
}

/// Spawn the periodic sweeper. The task runs until the process exits;
/// dropping the handle detaches it.
pub fn spawn_sweeper(tiers: Arc<TierCoordinator>, interval: Duration) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "starting cache sweeper");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sweep_once(&tiers).await;
            if removed > 0 {
                info!(removed, "cache sweep finished");
            }
        }
    })
}
