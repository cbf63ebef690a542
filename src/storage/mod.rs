//! Pluggable storage layer.
//!
//! Every backend implements the same [`StorageAdapter`] contract with
//! identical external semantics: TTL with lazy expiry on read, optional tag
//! indexing, per-key-independent batches, filtered scans, dry-run cleanup
//! and a uniform stats envelope. The contract backs both the HTTP response
//! cache tiers and request-log persistence.

mod document;
mod file;
mod memory;
#[cfg(feature = "object-store")]
mod object;
#[cfg(feature = "redis-store")]
mod redis;
mod registry;
mod sql;

pub use document::{StorageDocument, now_millis};
pub use file::FileAdapter;
pub use memory::MemoryAdapter;
#[cfg(feature = "object-store")]
pub use object::ObjectAdapter;
#[cfg(feature = "redis-store")]
pub use redis::RedisAdapter;
pub use registry::{StoragePlugin, StorageRegistry, default_config};
pub use sql::SqlAdapter;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Discriminant for the storage backends this build knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    File,
    Sql,
    Redis,
    Object,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Memory => "memory",
            StorageKind::File => "file",
            StorageKind::Sql => "sql",
            StorageKind::Redis => "redis",
            StorageKind::Object => "object",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific connection settings, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory {
        #[serde(default)]
        max_items: Option<usize>,
    },
    File {
        directory: String,
        #[serde(default)]
        key_prefix: Option<String>,
    },
    Sql {
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
        #[serde(default = "default_pool_min")]
        pool_min: u32,
        #[serde(default = "default_pool_max")]
        pool_max: u32,
        #[serde(default = "default_pool_timeout_secs")]
        pool_timeout_secs: u64,
    },
    Redis {
        host: String,
        port: u16,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        db: Option<i64>,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
        #[serde(default)]
        key_prefix: Option<String>,
    },
    Object {
        bucket: String,
        region: String,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
        #[serde(default = "default_object_prefix")]
        key_prefix: String,
    },
}

fn default_pool_min() -> u32 {
    1
}

fn default_pool_max() -> u32 {
    8
}

fn default_pool_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_object_prefix() -> String {
    "sosta/".to_string()
}

impl StorageConfig {
    /// The backend kind this configuration targets.
    pub fn kind(&self) -> StorageKind {
        match self {
            StorageConfig::Memory { .. } => StorageKind::Memory,
            StorageConfig::File { .. } => StorageKind::File,
            StorageConfig::Sql { .. } => StorageKind::Sql,
            StorageConfig::Redis { .. } => StorageKind::Redis,
            StorageConfig::Object { .. } => StorageKind::Object,
        }
    }
}

/// Options accepted by [`StorageAdapter::save`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveOptions {
    /// Time-to-live in seconds; `None` means no expiry.
    pub ttl: Option<u64>,
    /// Secondary index keys for set-intersection queries.
    pub tags: Option<Vec<String>>,
    /// Free-form metadata stored alongside the document.
    pub metadata: Option<Value>,
}

impl SaveOptions {
    pub fn with_ttl(ttl: u64) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Filter accepted by [`StorageAdapter::find`] and [`StorageAdapter::count`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterOptions {
    /// Documents must carry every listed tag (set intersection).
    pub tags: Option<Vec<String>>,
    /// Glob (`*`) pattern matched against the document key.
    pub pattern: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Options accepted by [`StorageAdapter::cleanup`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CleanupOptions {
    /// Only remove documents past their `expires_at`; otherwise flush all.
    #[serde(default)]
    pub expired_only: bool,
    /// Compute the affected count without deleting anything.
    #[serde(default)]
    pub dry_run: bool,
}

impl CleanupOptions {
    pub fn expired() -> Self {
        Self {
            expired_only: true,
            dry_run: false,
        }
    }
}

/// Aggregate view of one backend, returned by [`StorageAdapter::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_items: usize,
    pub active_items: usize,
    pub expired_items: usize,
    /// Serialized payload bytes across all documents.
    pub total_size: u64,
    pub avg_item_size: u64,
    pub oldest_item_ms: Option<i64>,
    pub newest_item_ms: Option<i64>,
    pub storage_type: String,
    /// Backend-specific extras (table size, index counts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

/// One entry of a [`StorageAdapter::save_batch`] call.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub key: String,
    pub data: Value,
    pub options: SaveOptions,
}

/// Per-key outcome of a batch save; one key failing never aborts the rest.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub saved: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage configuration error: {0}")]
    Configuration(String),
    #[error("storage backend `{0}` is not available in this build")]
    BackendUnavailable(StorageKind),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[cfg(feature = "redis-store")]
impl From<::redis::RedisError> for StorageError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

#[cfg(feature = "object-store")]
impl From<::object_store::Error> for StorageError {
    fn from(err: ::object_store::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Uniform persistence contract implemented by every backend.
///
/// Semantics shared by all implementations:
///
/// - a document past `expires_at` is reported absent and removed when
///   observed (lazy expiry), even if the backend has a native TTL;
/// - a document that fails to deserialize is deleted and reported absent,
///   never surfaced as an error;
/// - batch operations are per-key independent with no cross-key atomicity.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> StorageKind;

    async fn save(
        &self,
        key: &str,
        data: Value,
        options: SaveOptions,
    ) -> Result<(), StorageError>;

    /// Returns the payload, or `None` if absent or logically expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Returns whether an entry was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Same expiry semantics as `get`, without materializing the payload.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn save_batch(&self, entries: Vec<BatchEntry>) -> Result<BatchOutcome, StorageError>;

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError>;

    /// Returns the number of entries actually removed.
    async fn delete_batch(&self, keys: &[String]) -> Result<usize, StorageError>;

    async fn find(&self, filter: FilterOptions) -> Result<Vec<StorageDocument>, StorageError>;

    async fn count(&self, filter: Option<FilterOptions>) -> Result<usize, StorageError>;

    /// Returns the number of documents affected (or that would be, on dry-run).
    async fn cleanup(&self, options: CleanupOptions) -> Result<usize, StorageError>;

    async fn stats(&self) -> Result<StorageStats, StorageError>;

    /// Releases connections and handles; idempotent.
    async fn close(&self) -> Result<(), StorageError>;
}

impl std::fmt::Debug for dyn StorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdapter")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Compile a `*` glob into an anchored regex, or `None` for invalid input.
pub(crate) fn compile_glob(pattern: &str) -> Option<regex::Regex> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    regex::Regex::new(&format!("^{escaped}$")).ok()
}

/// Apply pagination after filtering, shared by the scan-based backends.
pub(crate) fn paginate<T>(items: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> Vec<T> {
    let offset = offset.unwrap_or(0);
    items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_any_run() {
        let re = compile_glob("cache:*:v1").expect("valid glob");
        assert!(re.is_match("cache:GET|/api/users:v1"));
        assert!(!re.is_match("log:GET|/api/users:v1"));
        assert!(!re.is_match("cache:GET:v1:extra"));
    }

    #[test]
    fn glob_without_star_is_exact() {
        let re = compile_glob("exact-key").expect("valid glob");
        assert!(re.is_match("exact-key"));
        assert!(!re.is_match("exact-key-2"));
    }

    #[test]
    fn pagination_applies_offset_then_limit() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(paginate(items.clone(), Some(2), Some(1)), vec![2, 3]);
        assert_eq!(paginate(items.clone(), None, Some(4)), vec![5]);
        assert_eq!(paginate(items, Some(10), None), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn storage_config_kind_matches_variant() {
        let config = StorageConfig::Memory { max_items: None };
        assert_eq!(config.kind(), StorageKind::Memory);

        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "type": "file",
            "directory": "/tmp/sosta"
        }))
        .expect("file config");
        assert_eq!(config.kind(), StorageKind::File);
    }
}
