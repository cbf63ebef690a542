//! Redis-backed storage backend.
//!
//! Documents are JSON strings under `{prefix}doc:{key}` with a native
//! `EX` TTL, plus an explicit `expires_at_ms` check on every read. Both
//! enforcement paths are kept deliberately: the native TTL reaps storage,
//! the envelope check guarantees the contract even if the two drift.
//!
//! A key-registry set (`{prefix}keys`) and one set per tag
//! (`{prefix}tag:{tag}`) make scans and tag intersection possible without
//! `KEYS`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use tracing::warn;

use super::{
    BatchEntry, BatchOutcome, CleanupOptions, FilterOptions, SaveOptions, StorageAdapter,
    StorageDocument, StorageError, StorageKind, StorageStats, compile_glob, now_millis, paginate,
};

/// Connection settings consumed by [`RedisAdapter::connect`].
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: Option<i64>,
    pub connect_timeout: Duration,
    pub key_prefix: Option<String>,
}

impl RedisSettings {
    fn connection_url(&self) -> String {
        let auth = self
            .password
            .as_ref()
            .map(|password| format!(":{password}@"))
            .unwrap_or_default();
        let db = self.db.unwrap_or(0);
        format!("redis://{auth}{}:{}/{db}", self.host, self.port)
    }
}

/// Redis [`StorageAdapter`].
#[derive(Clone)]
pub struct RedisAdapter {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisAdapter {
    /// Connects eagerly so an unreachable backend fails at startup.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StorageError> {
        let client = Client::open(settings.connection_url())
            .map_err(|err| StorageError::configuration(err.to_string()))?;
        let manager = tokio::time::timeout(settings.connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StorageError::backend("redis connect timed out"))??;
        Ok(Self {
            manager,
            prefix: settings.key_prefix.clone().unwrap_or_default(),
        })
    }

    fn doc_key(&self, key: &str) -> String {
        format!("{}doc:{key}", self.prefix)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{tag}", self.prefix)
    }

    fn registry_key(&self) -> String {
        format!("{}keys", self.prefix)
    }

    async fn read_document(
        &self,
        con: &mut ConnectionManager,
        key: &str,
    ) -> Result<Option<StorageDocument>, StorageError> {
        let raw: Option<String> = con.get(self.doc_key(key)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let doc: StorageDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(key, error = %err, "removing corrupt redis document");
                self.remove_entry(con, key, &[]).await?;
                return Ok(None);
            }
        };

        // Second TTL check on top of the native EX expiry.
        if doc.is_expired(now_millis()) {
            let tags = doc.tags.clone().unwrap_or_default();
            self.remove_entry(con, key, &tags).await?;
            return Ok(None);
        }
        Ok(Some(doc))
    }

    async fn remove_entry(
        &self,
        con: &mut ConnectionManager,
        key: &str,
        tags: &[String],
    ) -> Result<bool, StorageError> {
        let removed: i64 = con.del(self.doc_key(key)).await?;
        let _: i64 = con.srem(self.registry_key(), key).await?;
        for tag in tags {
            let _: i64 = con.srem(self.tag_key(tag), key).await?;
        }
        Ok(removed > 0)
    }

    /// Persist updated access stats without disturbing the native TTL.
    async fn write_back(
        &self,
        con: &mut ConnectionManager,
        doc: &StorageDocument,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(doc)?;
        redis::cmd("SET")
            .arg(self.doc_key(&doc.key))
            .arg(raw)
            .arg("KEEPTTL")
            .query_async::<()>(con)
            .await?;
        Ok(())
    }

    async fn candidate_keys(
        &self,
        con: &mut ConnectionManager,
        tags: Option<&Vec<String>>,
    ) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = match tags.filter(|tags| !tags.is_empty()) {
            Some(tags) => {
                let sets: Vec<String> = tags.iter().map(|tag| self.tag_key(tag)).collect();
                con.sinter(sets).await?
            }
            None => con.smembers(self.registry_key()).await?,
        };
        keys.sort();
        Ok(keys)
    }

    /// Fetch live documents for `keys` in one round trip, dropping entries
    /// the native TTL has already reaped.
    async fn fetch_documents(
        &self,
        con: &mut ConnectionManager,
        keys: &[String],
    ) -> Result<Vec<StorageDocument>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let doc_keys: Vec<String> = keys.iter().map(|key| self.doc_key(key)).collect();
        let raws: Vec<Option<String>> = con.mget(doc_keys).await?;

        let now = now_millis();
        let mut documents = Vec::new();
        for (key, raw) in keys.iter().zip(raws) {
            let Some(raw) = raw else {
                // Index entry without a document: native TTL beat us to it.
                let _: i64 = con.srem(self.registry_key(), key).await?;
                continue;
            };
            match serde_json::from_str::<StorageDocument>(&raw) {
                Ok(doc) if !doc.is_expired(now) => documents.push(doc),
                Ok(doc) => {
                    let tags = doc.tags.clone().unwrap_or_default();
                    self.remove_entry(con, key, &tags).await?;
                }
                Err(err) => {
                    warn!(key, error = %err, "removing corrupt redis document");
                    self.remove_entry(con, key, &[]).await?;
                }
            }
        }
        Ok(documents)
    }
}

#[async_trait]
impl StorageAdapter for RedisAdapter {
    fn kind(&self) -> StorageKind {
        StorageKind::Redis
    }

    async fn save(
        &self,
        key: &str,
        data: Value,
        options: SaveOptions,
    ) -> Result<(), StorageError> {
        let doc = StorageDocument::new(key, data, &options);
        let raw = serde_json::to_string(&doc)?;
        let mut con = self.manager.clone();

        match options.ttl {
            Some(ttl) => con.set_ex::<_, _, ()>(self.doc_key(key), raw, ttl).await?,
            None => con.set::<_, _, ()>(self.doc_key(key), raw).await?,
        }
        let _: i64 = con.sadd(self.registry_key(), key).await?;
        if let Some(tags) = &doc.tags {
            for tag in tags {
                let _: i64 = con.sadd(self.tag_key(tag), key).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut con = self.manager.clone();
        match self.read_document(&mut con, key).await? {
            Some(mut doc) => {
                doc.touch(now_millis());
                if let Err(err) = self.write_back(&mut con, &doc).await {
                    warn!(key, error = %err, "failed to persist access stats");
                }
                Ok(Some(doc.data))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut con = self.manager.clone();
        let tags = match self.read_document(&mut con, key).await? {
            Some(doc) => doc.tags.unwrap_or_default(),
            None => Vec::new(),
        };
        self.remove_entry(&mut con, key, &tags).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut con = self.manager.clone();
        // The native TTL mirrors the envelope expiry set at save time,
        // so EXISTS is enough; no need to fetch the document.
        let live: bool = con.exists(self.doc_key(key)).await?;
        if !live {
            // Registry entries can outlive documents the TTL reaped.
            let _: i64 = con.srem(self.registry_key(), key).await?;
        }
        Ok(live)
    }

    async fn save_batch(&self, entries: Vec<BatchEntry>) -> Result<BatchOutcome, StorageError> {
        let mut outcome = BatchOutcome::default();
        for entry in entries {
            match self.save(&entry.key, entry.data, entry.options).await {
                Ok(()) => outcome.saved += 1,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "batch save entry failed");
                    outcome.failed.push(entry.key);
                }
            }
        }
        Ok(outcome)
    }

    async fn get_batch(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError> {
        let mut con = self.manager.clone();
        let documents = self.fetch_documents(&mut con, keys).await?;
        Ok(keys
            .iter()
            .map(|key| {
                documents
                    .iter()
                    .find(|doc| &doc.key == key)
                    .map(|doc| doc.data.clone())
            })
            .collect())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await.unwrap_or(false) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn find(&self, filter: FilterOptions) -> Result<Vec<StorageDocument>, StorageError> {
        let mut con = self.manager.clone();
        let mut keys = self.candidate_keys(&mut con, filter.tags.as_ref()).await?;
        if filter.tags.as_ref().is_none_or(|tags| tags.is_empty()) {
            if let Some(re) = filter.pattern.as_deref().and_then(compile_glob) {
                keys.retain(|key| re.is_match(key));
            }
        }
        let documents = self.fetch_documents(&mut con, &keys).await?;
        Ok(paginate(documents, filter.limit, filter.offset))
    }

    async fn count(&self, filter: Option<FilterOptions>) -> Result<usize, StorageError> {
        // Set cardinality alone would count lazily-expired members, so the
        // count goes through the same document fetch as `find`.
        Ok(self.find(filter.unwrap_or_default()).await?.len())
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<usize, StorageError> {
        let mut con = self.manager.clone();
        let keys = self.candidate_keys(&mut con, None).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let doc_keys: Vec<String> = keys.iter().map(|key| self.doc_key(key)).collect();
        let raws: Vec<Option<String>> = con.mget(doc_keys).await?;
        let now = now_millis();
        let mut affected = 0;

        for (key, raw) in keys.iter().zip(raws) {
            let Some(raw) = raw else {
                if !options.dry_run {
                    let _: i64 = con.srem(self.registry_key(), key).await?;
                }
                continue;
            };
            let (expired, tags) = match serde_json::from_str::<StorageDocument>(&raw) {
                Ok(doc) => (doc.is_expired(now), doc.tags.unwrap_or_default()),
                Err(_) => (true, Vec::new()),
            };
            if options.expired_only && !expired {
                continue;
            }
            affected += 1;
            if !options.dry_run {
                self.remove_entry(&mut con, key, &tags).await?;
            }
        }
        Ok(affected)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut con = self.manager.clone();
        let keys = self.candidate_keys(&mut con, None).await?;
        let now = now_millis();

        let mut stats = StorageStats {
            storage_type: self.kind().to_string(),
            ..StorageStats::default()
        };
        if keys.is_empty() {
            return Ok(stats);
        }

        let doc_keys: Vec<String> = keys.iter().map(|key| self.doc_key(key)).collect();
        let raws: Vec<Option<String>> = con.mget(doc_keys).await?;
        for raw in raws.into_iter().flatten() {
            let Ok(doc) = serde_json::from_str::<StorageDocument>(&raw) else {
                continue;
            };
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
        Ok(stats)
    }

    async fn close(&self) -> Result<(), StorageError> {
        // ConnectionManager drops its connections when the last clone goes.
        Ok(())
    }
}
