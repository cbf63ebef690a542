use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "sosta_cache_hit_total",
            Unit::Count,
            "Total number of responses served from cache."
        );
        describe_counter!(
            "sosta_cache_miss_total",
            Unit::Count,
            "Total number of cacheable requests forwarded upstream."
        );
        describe_counter!(
            "sosta_cache_tier_hit_total",
            Unit::Count,
            "Cache hits broken down by tier."
        );
        describe_counter!(
            "sosta_cache_tier_miss_total",
            Unit::Count,
            "Cache misses broken down by tier."
        );
        describe_counter!(
            "sosta_cache_tier_error_total",
            Unit::Count,
            "Tier lookups that failed and degraded to a miss."
        );
        describe_counter!(
            "sosta_cache_write_failure_total",
            Unit::Count,
            "Tier writes that failed during write-through."
        );
        describe_counter!(
            "sosta_cache_evict_total",
            Unit::Count,
            "Entries evicted to enforce a tier's size bound."
        );
        describe_counter!(
            "sosta_cache_sweep_removed_total",
            Unit::Count,
            "Expired entries removed by the background sweeper."
        );
        describe_counter!(
            "sosta_proxy_upstream_error_total",
            Unit::Count,
            "Upstream requests that failed."
        );
        describe_histogram!(
            "sosta_proxy_request_ms",
            Unit::Milliseconds,
            "End-to-end proxied request latency in milliseconds."
        );
    });
}
