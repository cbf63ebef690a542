//! Storage plugin registry.
//!
//! The catalog of backends this process can instantiate. Plugins are
//! registered once at startup and the registry is then shared read-only
//! behind an `Arc`; `create_adapter` always builds a fresh adapter so two
//! tiers of the same kind (e.g. two Redis prefixes) never share state.

use std::collections::HashMap;
use std::time::Duration;

use super::{StorageAdapter, StorageConfig, StorageError, StorageKind};
use super::{FileAdapter, MemoryAdapter, SqlAdapter};
use crate::storage::sql::SqlSettings;

#[cfg(feature = "object-store")]
use super::ObjectAdapter;
#[cfg(feature = "object-store")]
use crate::storage::object::ObjectSettings;
#[cfg(feature = "redis-store")]
use super::RedisAdapter;
#[cfg(feature = "redis-store")]
use crate::storage::redis::RedisSettings;

/// Catalog entry describing one registered backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoragePlugin {
    pub name: &'static str,
    pub kind: StorageKind,
    pub description: &'static str,
    /// External services the backend needs at runtime.
    pub dependencies: &'static [&'static str],
    /// Config fields that must be present and non-empty.
    pub required_config: &'static [&'static str],
}

/// Registry of storage plugins, built once in `main` and injected.
#[derive(Default)]
pub struct StorageRegistry {
    plugins: HashMap<StorageKind, StoragePlugin>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with every backend compiled into this build.
    pub fn with_builtin_plugins() -> Self {
        let mut registry = Self::new();
        for plugin in builtin_plugins() {
            // Built-ins are distinct by construction.
            let _ = registry.register(plugin);
        }
        registry
    }

    /// Re-registering an identical plugin is a no-op; a different plugin
    /// claiming an already-registered kind is a conflict.
    pub fn register(&mut self, plugin: StoragePlugin) -> Result<(), StorageError> {
        match self.plugins.get(&plugin.kind) {
            Some(existing) if *existing == plugin => Ok(()),
            Some(existing) => Err(StorageError::configuration(format!(
                "storage kind `{}` already registered by plugin `{}`",
                plugin.kind, existing.name
            ))),
            None => {
                self.plugins.insert(plugin.kind, plugin);
                Ok(())
            }
        }
    }

    pub fn plugin(&self, kind: StorageKind) -> Option<&StoragePlugin> {
        self.plugins.get(&kind)
    }

    /// The registered catalog, ordered by kind name for stable output.
    pub fn plugins(&self) -> Vec<&StoragePlugin> {
        let mut plugins: Vec<&StoragePlugin> = self.plugins.values().collect();
        plugins.sort_by_key(|plugin| plugin.kind.as_str());
        plugins
    }

    /// Validate `config` and build a new adapter for `kind`, awaiting its
    /// initialization so unreachable backends fail here, at startup.
    pub async fn create_adapter(
        &self,
        kind: StorageKind,
        config: &StorageConfig,
    ) -> Result<Box<dyn StorageAdapter>, StorageError> {
        let plugin = self.plugin(kind).ok_or_else(|| {
            StorageError::configuration(format!("unknown storage kind `{kind}`"))
        })?;
        if config.kind() != kind {
            return Err(StorageError::configuration(format!(
                "config of kind `{}` supplied for storage kind `{}`",
                config.kind(),
                kind
            )));
        }
        validate_required(plugin, config)?;
        build_adapter(config).await
    }
}

/// Pre-filled configuration used when a kind is selected without explicit
/// connection parameters.
pub fn default_config(kind: StorageKind) -> StorageConfig {
    match kind {
        StorageKind::Memory => StorageConfig::Memory { max_items: None },
        StorageKind::File => StorageConfig::File {
            directory: "./sosta-cache".to_string(),
            key_prefix: None,
        },
        StorageKind::Sql => StorageConfig::Sql {
            host: "localhost".to_string(),
            port: 5432,
            user: "sosta".to_string(),
            password: String::new(),
            database: "sosta".to_string(),
            pool_min: 1,
            pool_max: 8,
            pool_timeout_secs: 30,
        },
        StorageKind::Redis => StorageConfig::Redis {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: None,
            connect_timeout_ms: 5_000,
            key_prefix: Some("sosta:".to_string()),
        },
        StorageKind::Object => StorageConfig::Object {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            key_prefix: "sosta/".to_string(),
        },
    }
}

fn builtin_plugins() -> Vec<StoragePlugin> {
    let mut plugins = vec![
        StoragePlugin {
            name: "memory",
            kind: StorageKind::Memory,
            description: "In-process map with tag index; fastest tier, lost on restart.",
            dependencies: &[],
            required_config: &[],
        },
        StoragePlugin {
            name: "file",
            kind: StorageKind::File,
            description: "One JSON document per key under a local directory.",
            dependencies: &[],
            required_config: &["directory"],
        },
        StoragePlugin {
            name: "sql",
            kind: StorageKind::Sql,
            description: "Postgres table with GIN-indexed tags.",
            dependencies: &["postgres"],
            required_config: &["host", "user", "database"],
        },
    ];
    #[cfg(feature = "redis-store")]
    plugins.push(StoragePlugin {
        name: "redis",
        kind: StorageKind::Redis,
        description: "Redis strings with native TTL plus envelope expiry.",
        dependencies: &["redis"],
        required_config: &["host"],
    });
    #[cfg(feature = "object-store")]
    plugins.push(StoragePlugin {
        name: "object",
        kind: StorageKind::Object,
        description: "S3-compatible object storage under a key prefix.",
        dependencies: &["s3"],
        required_config: &["bucket", "region"],
    });
    plugins
}

/// Required fields must be present and non-empty before any I/O happens.
fn validate_required(plugin: &StoragePlugin, config: &StorageConfig) -> Result<(), StorageError> {
    let missing = |field: &str| {
        StorageError::configuration(format!(
            "storage kind `{}` requires config field `{field}`",
            plugin.kind
        ))
    };

    for field in plugin.required_config {
        let present = match (config, *field) {
            (StorageConfig::File { directory, .. }, "directory") => !directory.is_empty(),
            (StorageConfig::Sql { host, .. }, "host") => !host.is_empty(),
            (StorageConfig::Sql { user, .. }, "user") => !user.is_empty(),
            (StorageConfig::Sql { database, .. }, "database") => !database.is_empty(),
            (StorageConfig::Redis { host, .. }, "host") => !host.is_empty(),
            (StorageConfig::Object { bucket, .. }, "bucket") => !bucket.is_empty(),
            (StorageConfig::Object { region, .. }, "region") => !region.is_empty(),
            _ => true,
        };
        if !present {
            return Err(missing(field));
        }
    }
    Ok(())
}

/// Per-kind factory. Backends compiled out are a typed configuration-time
/// error, never a panicking placeholder.
async fn build_adapter(config: &StorageConfig) -> Result<Box<dyn StorageAdapter>, StorageError> {
    match config {
        StorageConfig::Memory { max_items } => {
            let adapter = match max_items {
                Some(max) => MemoryAdapter::with_capacity(*max),
                None => MemoryAdapter::new(),
            };
            Ok(Box::new(adapter))
        }
        StorageConfig::File {
            directory,
            key_prefix,
        } => {
            let adapter = FileAdapter::new(directory, key_prefix.clone());
            adapter.initialize().await?;
            Ok(Box::new(adapter))
        }
        StorageConfig::Sql {
            host,
            port,
            user,
            password,
            database,
            pool_min,
            pool_max,
            pool_timeout_secs,
        } => {
            let adapter = SqlAdapter::connect(&SqlSettings {
                host: host.clone(),
                port: *port,
                user: user.clone(),
                password: password.clone(),
                database: database.clone(),
                pool_min: *pool_min,
                pool_max: *pool_max,
                pool_timeout: Duration::from_secs(*pool_timeout_secs),
            })
            .await?;
            Ok(Box::new(adapter))
        }
        #[cfg(feature = "redis-store")]
        StorageConfig::Redis {
            host,
            port,
            password,
            db,
            connect_timeout_ms,
            key_prefix,
        } => {
            let adapter = RedisAdapter::connect(&RedisSettings {
                host: host.clone(),
                port: *port,
                password: password.clone(),
                db: *db,
                connect_timeout: Duration::from_millis(*connect_timeout_ms),
                key_prefix: key_prefix.clone(),
            })
            .await?;
            Ok(Box::new(adapter))
        }
        #[cfg(not(feature = "redis-store"))]
        StorageConfig::Redis { .. } => Err(StorageError::BackendUnavailable(StorageKind::Redis)),
        #[cfg(feature = "object-store")]
        StorageConfig::Object {
            bucket,
            region,
            access_key_id,
            secret_access_key,
            key_prefix,
        } => {
            let adapter = ObjectAdapter::connect(&ObjectSettings {
                bucket: bucket.clone(),
                region: region.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                key_prefix: key_prefix.clone(),
            })?;
            adapter.initialize().await?;
            Ok(Box::new(adapter))
        }
        #[cfg(not(feature = "object-store"))]
        StorageConfig::Object { .. } => Err(StorageError::BackendUnavailable(StorageKind::Object)),
    }
}
