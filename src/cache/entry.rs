//! Cached HTTP response envelope.
//!
//! What actually gets stored in a tier: status, replayable headers and a
//! base64 body, serialized to JSON so every backend can hold it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::now_millis;

/// One cached upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body_b64: String,
    pub created_at_ms: i64,
    pub ttl_seconds: Option<u64>,
}

impl CacheEntry {
    pub fn new(
        status: u16,
        headers: Vec<(String, String)>,
        body: &[u8],
        ttl_seconds: Option<u64>,
    ) -> Self {
        Self {
            status,
            headers,
            body_b64: BASE64.encode(body),
            created_at_ms: now_millis(),
            ttl_seconds,
        }
    }

    pub fn body(&self) -> Bytes {
        BASE64
            .decode(&self.body_b64)
            .map(Bytes::from)
            .unwrap_or_default()
    }

    /// Seconds since this entry was written, for the `X-Cache-Age` header.
    pub fn age_seconds(&self) -> u64 {
        let elapsed_ms = now_millis().saturating_sub(self.created_at_ms);
        (elapsed_ms / 1_000).max(0) as u64
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// `None` means the stored value is not a cache entry; callers treat
    /// that exactly like a miss.
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_roundtrips_through_base64() {
        let entry = CacheEntry::new(200, vec![], b"hello world", Some(60));
        assert_eq!(entry.body(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn value_roundtrip_preserves_fields() {
        let entry = CacheEntry::new(
            201,
            vec![("content-type".into(), "application/json".into())],
            b"{}",
            None,
        );
        let value = entry.to_value().expect("encode");
        let back = CacheEntry::from_value(value).expect("decode");
        assert_eq!(back.status, 201);
        assert_eq!(back.headers.len(), 1);
        assert_eq!(back.body(), Bytes::from_static(b"{}"));
    }

    #[test]
    fn foreign_value_is_not_an_entry() {
        assert!(CacheEntry::from_value(serde_json::json!("just a string")).is_none());
    }

    #[test]
    fn fresh_entry_has_zero_age() {
        let entry = CacheEntry::new(200, vec![], b"", Some(60));
        assert_eq!(entry.age_seconds(), 0);
    }
}
