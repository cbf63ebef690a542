//! Response cache middleware.
//!
//! Serves cached upstream responses and stores fresh ones, strictly
//! fail-open: anything that goes wrong while keying, looking up or
//! storing degrades to "just proxy the request".
//! Served responses carry `X-Cache`, `X-Cache-Tier`, `X-Cache-TTL` and
//! `X-Cache-Age` headers.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::entry::CacheEntry;
use super::key::{GeneratedKey, KeyBuilder};
use super::rules::{Decision, RuleEngine};
use super::tiers::{TierCoordinator, TierHit};

/// Buffered request and response bodies are capped at this size; larger
/// payloads are proxied without caching.
const BODY_LIMIT_BYTES: usize = 1024 * 1024;

const RESPONSE_TAG: &str = "response";

/// Key and TTL decision for one request, computed before the upstream is
/// consulted and reused when the response comes back.
pub struct CachePlan {
    pub key: GeneratedKey,
    pub decision: Decision,
}

/// Cache policy and tier access shared by the middleware and the admin
/// endpoints.
pub struct CacheService {
    keys: KeyBuilder,
    rules: RuleEngine,
    tiers: Arc<TierCoordinator>,
    enabled: bool,
}

impl CacheService {
    pub fn new(
        keys: KeyBuilder,
        rules: RuleEngine,
        tiers: Arc<TierCoordinator>,
        enabled: bool,
    ) -> Self {
        Self {
            keys,
            rules,
            tiers,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled && !self.tiers.is_empty()
    }

    pub fn tiers(&self) -> &TierCoordinator {
        &self.tiers
    }

    /// Whether the request body must be buffered before the key can be
    /// built.
    pub fn wants_body(&self, method: &str) -> bool {
        self.keys.wants_body(method)
    }

    /// Key preview for the admin endpoint; same path the middleware takes.
    pub fn build_key(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<GeneratedKey, super::key::KeyError> {
        self.keys.generate(method, url, headers, body)
    }

    /// Resolve policy and key for a request. `None` means this request
    /// bypasses the cache entirely.
    pub fn plan(
        &self,
        method: &str,
        url: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Option<CachePlan> {
        if !self.enabled() {
            return None;
        }
        let decision = self.rules.resolve(method, path, headers);
        if !decision.cacheable {
            return None;
        }
        match self.keys.generate(method, url, headers, body) {
            Ok(key) => Some(CachePlan { key, decision }),
            Err(err) => {
                // Key failure disables caching for this request only.
                warn!(error = %err, "cache key unavailable, bypassing cache");
                None
            }
        }
    }

    pub async fn check_cache(&self, plan: &CachePlan) -> Option<TierHit> {
        self.tiers.lookup(plan.key.as_str()).await
    }

    /// Store an upstream response if the winning rule's write-time
    /// conditions allow it. Responses outside the rule's status list
    /// (or non-2xx when the rule names none) are never stored.
    pub async fn store_response(
        &self,
        plan: &CachePlan,
        status: u16,
        headers: Vec<(String, String)>,
        body: &[u8],
    ) -> bool {
        if !self
            .rules
            .write_allowed(&plan.decision, status, body.len() as u64)
        {
            debug!(status, "write-time conditions rejected response");
            return false;
        }
        if !self.rules.has_status_condition(&plan.decision) && !(200..300).contains(&status) {
            return false;
        }

        let entry = CacheEntry::new(status, headers, body, Some(plan.decision.ttl));
        self.tiers
            .write_through(
                plan.key.as_str(),
                &entry,
                Some(vec![RESPONSE_TAG.to_string()]),
            )
            .await;
        true
    }

    /// Remove one key from every tier.
    pub async fn invalidate(&self, key: &str) -> usize {
        self.tiers.invalidate(key).await
    }
}

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub service: Arc<CacheService>,
}

/// Middleware caching proxied responses across all configured tiers.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(state): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let service = &state.service;
    if !service.enabled() {
        return next.run(request).await;
    }

    let method = request.method().as_str().to_string();
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let path = request.uri().path().to_string();
    let headers = header_pairs(&request);

    // Body-keyed methods need the request body up front; rebuild the
    // request afterwards so the upstream still sees it.
    let (request, body_bytes) = if service.wants_body(&method) {
        let (parts, body) = request.into_parts();
        match buffer_body(body, BODY_LIMIT_BYTES).await {
            BufferedBody::Full(bytes) => {
                let rebuilt = Request::from_parts(parts, Body::from(bytes.clone()));
                (rebuilt, Some(bytes))
            }
            BufferedBody::Passthrough(body) => {
                warn!("request body too large to key, bypassing cache");
                return next.run(Request::from_parts(parts, body)).await;
            }
        }
    } else {
        (request, None)
    };

    let Some(plan) = service.plan(&method, &url, &path, &headers, body_bytes.as_deref()) else {
        return next.run(request).await;
    };

    if let Some(hit) = service.check_cache(&plan).await {
        counter!("sosta_cache_hit_total").increment(1);
        debug!(tier = %hit.tier, "serving cached response");
        return build_cached_response(hit);
    }
    counter!("sosta_cache_miss_total").increment(1);

    let response = next.run(request).await;
    let status = response.status();
    let (parts, body) = response.into_parts();
    let bytes = match buffer_body(body, BODY_LIMIT_BYTES).await {
        BufferedBody::Full(bytes) => bytes,
        BufferedBody::Passthrough(body) => {
            debug!("response too large to cache, passing through");
            let mut response = Response::from_parts(parts, body);
            response
                .headers_mut()
                .insert("x-cache", HeaderValue::from_static("MISS"));
            return response;
        }
    };

    let stored_headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();
    service
        .store_response(&plan, status.as_u16(), stored_headers, &bytes)
        .await;

    let mut response = Response::from_parts(parts, Body::from(bytes));
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static("MISS"));
    response
}

/// Outcome of buffering a body against the cache size limit.
enum BufferedBody {
    /// The whole body fits; callers may key on it or store it.
    Full(Bytes),
    /// Over the limit or the stream errored. Carries a body that replays
    /// everything already read followed by the untouched remainder, so
    /// callers forward it as-is and skip caching.
    Passthrough(Body),
}

async fn buffer_body(body: Body, limit: usize) -> BufferedBody {
    let mut stream = body.into_data_stream();
    let mut collected: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if collected.len() + bytes.len() > limit {
                    let replay = futures::stream::iter(vec![
                        Ok::<Bytes, axum::Error>(Bytes::from(collected)),
                        Ok(bytes),
                    ])
                    .chain(stream);
                    return BufferedBody::Passthrough(Body::from_stream(replay));
                }
                collected.extend_from_slice(&bytes);
            }
            Err(err) => {
                let replay = futures::stream::iter(vec![
                    Ok::<Bytes, axum::Error>(Bytes::from(collected)),
                    Err(err),
                ])
                .chain(stream);
                return BufferedBody::Passthrough(Body::from_stream(replay));
            }
        }
    }
    BufferedBody::Full(Bytes::from(collected))
}

fn header_pairs(request: &Request<Body>) -> Vec<(String, String)> {
    request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

/// Replay a cached entry, annotated with the cache headers.
fn build_cached_response(hit: TierHit) -> Response {
    let entry = hit.entry;
    let mut builder = Response::builder().status(entry.status);

    for (name, value) in &entry.headers {
        if name.eq_ignore_ascii_case("x-cache")
            || name.eq_ignore_ascii_case("x-cache-tier")
            || name.eq_ignore_ascii_case("x-cache-ttl")
            || name.eq_ignore_ascii_case("x-cache-age")
        {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), value);
        }
    }

    builder = builder.header("x-cache", "HIT");
    if let Ok(tier) = HeaderValue::from_str(&hit.tier) {
        builder = builder.header("x-cache-tier", tier);
    }
    if let Some(ttl) = entry.ttl_seconds {
        builder = builder.header("x-cache-ttl", ttl);
    }
    builder = builder.header("x-cache-age", entry.age_seconds());

    let body = entry.body();
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
