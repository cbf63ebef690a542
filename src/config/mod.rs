//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Parser, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheRule, EvictionPolicy, KeyOptions};
use crate::storage::{StorageConfig, StorageKind};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sosta";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_UPSTREAM_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_LOG_TTL_SECS: u64 = 24 * 60 * 60;

/// Command-line arguments for the Sosta binary.
#[derive(Debug, Parser, Default)]
#[command(name = "sosta", version, about = "Sosta caching reverse proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SOSTA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the upstream origin URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the default TTL for cached responses.
    #[arg(long = "cache-default-ttl", value_name = "SECONDS")]
    pub cache_default_ttl: Option<u64>,

    /// Override the expiry sweep cadence.
    #[arg(long = "cache-cleanup-interval-seconds", value_name = "SECONDS")]
    pub cleanup_interval_seconds: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub request_log: RequestLogSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: Url,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl: u64,
    pub cleanup_interval: Duration,
    pub key: KeyOptions,
    pub rules: Vec<CacheRule>,
    pub tiers: Vec<TierSettings>,
}

/// One configured cache tier, in priority order.
#[derive(Debug, Clone)]
pub struct TierSettings {
    pub name: String,
    pub storage: StorageConfig,
    pub max_size: Option<usize>,
    pub eviction_policy: EvictionPolicy,
    /// A required tier aborts startup when its backend is unreachable;
    /// otherwise the tier degrades to in-process memory.
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct RequestLogSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub storage: StorageConfig,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("SOSTA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli_overrides(cli);
    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
    request_log: RawRequestLogSettings,
}

impl RawSettings {
    fn apply_cli_overrides(&mut self, cli: &CliArgs) {
        if let Some(host) = cli.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = cli.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = cli.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = cli.upstream_url.as_ref() {
            self.upstream.url = Some(url.clone());
        }
        if let Some(enabled) = cli.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(ttl) = cli.cache_default_ttl {
            self.cache.default_ttl = Some(ttl);
        }
        if let Some(interval) = cli.cleanup_interval_seconds {
            self.cache.cleanup_interval_seconds = Some(interval);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            cache,
            request_log,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            upstream: build_upstream_settings(upstream)?,
            cache: build_cache_settings(cache)?,
            request_log: build_request_log_settings(request_log),
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let candidate = format!("{host}:{port}");
    let addr = candidate
        .parse()
        .map_err(|err| LoadError::invalid("server.addr", format!("invalid `{candidate}`: {err}")))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("upstream.url", "an upstream origin is required"))?;

    let url = Url::parse(raw_url)
        .map_err(|err| LoadError::invalid("upstream.url", format!("failed to parse: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.url",
            format!("unsupported scheme `{}`", url.scheme()),
        ));
    }

    let connect_ms = upstream
        .connect_timeout_ms
        .unwrap_or(DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS);
    let request_ms = upstream
        .request_timeout_ms
        .unwrap_or(DEFAULT_UPSTREAM_REQUEST_TIMEOUT_MS);
    if connect_ms == 0 || request_ms == 0 {
        return Err(LoadError::invalid(
            "upstream.timeouts",
            "timeouts must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        url,
        connect_timeout: Duration::from_millis(connect_ms),
        request_timeout: Duration::from_millis(request_ms),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let cleanup_secs = cache
        .cleanup_interval_seconds
        .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS);
    if cleanup_secs == 0 {
        return Err(LoadError::invalid(
            "cache.cleanup_interval_seconds",
            "must be greater than zero",
        ));
    }

    let mut tiers = Vec::with_capacity(cache.tiers.len());
    for (index, tier) in cache.tiers.into_iter().enumerate() {
        tiers.push(build_tier_settings(index, tier)?);
    }

    // An enabled cache with no tiers gets a single unbounded memory tier.
    if tiers.is_empty() {
        tiers.push(TierSettings {
            name: StorageKind::Memory.to_string(),
            storage: crate::storage::default_config(StorageKind::Memory),
            max_size: None,
            eviction_policy: EvictionPolicy::default(),
            required: false,
        });
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        default_ttl: cache.default_ttl.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        cleanup_interval: Duration::from_secs(cleanup_secs),
        key: cache.key,
        rules: cache.rules,
        tiers,
    })
}

fn build_tier_settings(index: usize, tier: RawTierSettings) -> Result<TierSettings, LoadError> {
    let storage = tier.storage.ok_or_else(|| {
        LoadError::invalid("cache.tiers", format!("tier {index} is missing `storage`"))
    })?;
    if tier.max_size == Some(0) {
        return Err(LoadError::invalid(
            "cache.tiers",
            format!("tier {index}: max_size must be greater than zero"),
        ));
    }

    let name = tier
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| storage.kind().to_string());

    Ok(TierSettings {
        name,
        storage,
        max_size: tier.max_size,
        eviction_policy: tier.eviction_policy.unwrap_or_default(),
        required: tier.required.unwrap_or(false),
    })
}

fn build_request_log_settings(request_log: RawRequestLogSettings) -> RequestLogSettings {
    RequestLogSettings {
        enabled: request_log.enabled.unwrap_or(false),
        ttl: Duration::from_secs(
            request_log
                .ttl_seconds
                .unwrap_or(DEFAULT_REQUEST_LOG_TTL_SECS),
        ),
        storage: request_log
            .storage
            .unwrap_or_else(|| crate::storage::default_config(StorageKind::Memory)),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    default_ttl: Option<u64>,
    cleanup_interval_seconds: Option<u64>,
    key: KeyOptions,
    rules: Vec<CacheRule>,
    tiers: Vec<RawTierSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTierSettings {
    name: Option<String>,
    storage: Option<StorageConfig>,
    max_size: Option<usize>,
    eviction_policy: Option<EvictionPolicy>,
    required: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRequestLogSettings {
    enabled: Option<bool>,
    ttl_seconds: Option<u64>,
    storage: Option<StorageConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_upstream() -> RawSettings {
        let mut raw = RawSettings::default();
        raw.upstream.url = Some("http://origin.internal:8080".to_string());
        raw
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = raw_with_upstream();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());

        let cli = CliArgs {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_cli_overrides(&cli);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn upstream_url_is_required() {
        let raw = RawSettings::default();
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid {
                key: "upstream.url",
                ..
            })
        ));
    }

    #[test]
    fn upstream_scheme_must_be_http() {
        let mut raw = RawSettings::default();
        raw.upstream.url = Some("ftp://origin".to_string());
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn missing_tiers_default_to_memory() {
        let raw = raw_with_upstream();
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.cache.tiers.len(), 1);
        assert_eq!(settings.cache.tiers[0].name, "memory");
        assert_eq!(settings.cache.tiers[0].storage.kind(), StorageKind::Memory);
        assert!(settings.cache.enabled);
        assert_eq!(settings.cache.default_ttl, DEFAULT_CACHE_TTL_SECS);
    }

    #[test]
    fn tier_without_storage_is_rejected() {
        let mut raw = raw_with_upstream();
        raw.cache.tiers.push(RawTierSettings {
            name: Some("broken".to_string()),
            ..Default::default()
        });
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn tier_name_defaults_to_the_storage_kind() {
        let mut raw = raw_with_upstream();
        raw.cache.tiers.push(RawTierSettings {
            storage: Some(crate::storage::default_config(StorageKind::File)),
            max_size: Some(100),
            ..Default::default()
        });

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.cache.tiers[0].name, "file");
        assert_eq!(settings.cache.tiers[0].max_size, Some(100));
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = raw_with_upstream();
        let cli = CliArgs {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_cli_overrides(&cli);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn tier_config_parses_from_toml() {
        let raw: RawSettings = toml::from_str(
            r#"
            [upstream]
            url = "http://origin:8080"

            [cache]
            default_ttl = 120

            [[cache.rules]]
            pattern = "/api/*"
            ttl = 60

            [[cache.tiers]]
            name = "hot"
            max_size = 1000
            eviction_policy = "lru"
            storage = { type = "memory" }

            [[cache.tiers]]
            storage = { type = "file", directory = "/var/cache/sosta" }
            "#,
        )
        .expect("toml parses");

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.cache.default_ttl, 120);
        assert_eq!(settings.cache.rules.len(), 1);
        assert_eq!(settings.cache.tiers.len(), 2);
        assert_eq!(settings.cache.tiers[0].name, "hot");
        assert_eq!(settings.cache.tiers[1].name, "file");
        assert_eq!(settings.cache.tiers[1].storage.kind(), StorageKind::File);
    }

    #[test]
    fn request_log_defaults_off_with_day_ttl() {
        let settings = Settings::from_raw(raw_with_upstream()).expect("valid settings");
        assert!(!settings.request_log.enabled);
        assert_eq!(settings.request_log.ttl, Duration::from_secs(86_400));
        assert_eq!(settings.request_log.storage.kind(), StorageKind::Memory);
    }

    #[test]
    fn parse_cli_flags() {
        let args = CliArgs::parse_from([
            "sosta",
            "--server-host",
            "0.0.0.0",
            "--upstream-url",
            "http://origin:9000",
            "--cache-enabled",
            "false",
        ]);

        assert_eq!(args.server_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(args.upstream_url.as_deref(), Some("http://origin:9000"));
        assert_eq!(args.cache_enabled, Some(false));
    }
}
