//! HTTP surface: admin endpoints plus the caching proxy fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::cache::{CacheState, response_cache_layer};
use crate::proxy::UpstreamClient;
use crate::request_log::{RequestLogService, RequestRecord};
use crate::storage::{CleanupOptions, StorageRegistry};

/// Request bodies forwarded upstream are buffered up to this size.
const PROXY_BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

const DEFAULT_RECENT_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub cache: CacheState,
    pub upstream: UpstreamClient,
    pub registry: Arc<StorageRegistry>,
    pub request_log: Option<Arc<RequestLogService>>,
}

/// JSON error envelope for the admin surface.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Build the full router: admin routes bypass the cache, everything else
/// falls through to the proxy wrapped in the cache and log layers.
pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/healthz", get(health))
        .route("/admin/cache/key", post(preview_key))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/cleanup", post(cache_cleanup))
        .route("/admin/cache/invalidate", post(cache_invalidate))
        .route("/admin/storage/plugins", get(storage_plugins))
        .route("/admin/requests", get(recent_requests))
        .with_state(state.clone());

    let proxy = Router::new()
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(
            state.cache.clone(),
            response_cache_layer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_log_layer,
        ))
        .with_state(state);

    admin.merge(proxy)
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct KeyPreviewRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Serialize)]
struct KeyPreviewResponse {
    key: String,
    hashed: bool,
}

async fn preview_key(
    State(state): State<AppState>,
    Json(request): Json<KeyPreviewRequest>,
) -> Result<Json<KeyPreviewResponse>, ApiError> {
    let headers: Vec<(String, String)> = request.headers.into_iter().collect();
    let body = request.body.as_deref().map(str::as_bytes);

    let key = state
        .cache
        .service
        .build_key(&request.method, &request.url, &headers, body)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    Ok(Json(KeyPreviewResponse {
        hashed: key.is_hashed(),
        key: key.into_string(),
    }))
}

async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut tiers = Vec::new();
    for (name, stats) in state.cache.service.tiers().stats_all().await {
        match stats {
            Ok(stats) => tiers.push(json!({ "name": name, "status": "ok", "stats": stats })),
            Err(err) => {
                tiers.push(json!({ "name": name, "status": "error", "error": err.to_string() }))
            }
        }
    }
    Json(json!({ "tiers": tiers }))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CleanupRequest {
    expired_only: Option<bool>,
    dry_run: bool,
}

async fn cache_cleanup(
    State(state): State<AppState>,
    request: Option<Json<CleanupRequest>>,
) -> Json<serde_json::Value> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let options = CleanupOptions {
        expired_only: request.expired_only.unwrap_or(true),
        dry_run: request.dry_run,
    };

    let results = state.cache.service.tiers().cleanup_all(options).await;
    let total: usize = results.iter().map(|(_, removed)| removed).sum();
    let tiers: Vec<_> = results
        .into_iter()
        .map(|(name, removed)| json!({ "name": name, "removed": removed }))
        .collect();

    Json(json!({ "dry_run": options.dry_run, "total": total, "tiers": tiers }))
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    key: String,
}

async fn cache_invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.key.is_empty() {
        return Err(ApiError::bad_request("key must not be empty"));
    }
    let removed = state.cache.service.invalidate(&request.key).await;
    Ok(Json(json!({ "removed": removed })))
}

async fn storage_plugins(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "plugins": state.registry.plugins() }))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RecentRequestsQuery {
    method: Option<String>,
    limit: Option<usize>,
}

async fn recent_requests(
    State(state): State<AppState>,
    Query(query): Query<RecentRequestsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(log) = state.request_log.as_ref() else {
        return Err(ApiError::unavailable("request log is disabled"));
    };

    let records = log
        .recent(
            query.method.as_deref(),
            query.limit.unwrap_or(DEFAULT_RECENT_LIMIT),
        )
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    Ok(Json(json!({ "requests": records })))
}

/// Outermost proxy layer: times the request and persists one audit record
/// with the cache outcome read back off the response headers.
async fn request_log_layer(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    histogram!("sosta_proxy_request_ms").record(elapsed_ms as f64);

    if let Some(log) = state.request_log.as_ref() {
        let outcome = match response
            .headers()
            .get("x-cache")
            .and_then(|value| value.to_str().ok())
        {
            Some("HIT") => "hit",
            Some("MISS") => "miss",
            _ => "bypass",
        };
        let tier = response
            .headers()
            .get("x-cache-tier")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        log.record(RequestRecord::new(
            method,
            path,
            response.status().as_u16(),
            outcome,
            tier,
            elapsed_ms,
        ))
        .await;
    }

    response
}

/// Fallback handler: everything not claimed by an admin route goes to the
/// origin.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let headers = request.headers().clone();

    let body = match axum::body::to_bytes(request.into_body(), PROXY_BODY_LIMIT_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    match state
        .upstream
        .forward(method, &path_and_query, &headers, body)
        .await
    {
        Ok(upstream) => {
            let mut response = Response::new(Body::from(upstream.body));
            *response.status_mut() = upstream.status;
            *response.headers_mut() = upstream.headers;
            response
        }
        Err(err) => {
            warn!(path = %path_and_query, error = %err, "upstream request failed");
            counter!("sosta_proxy_upstream_error_total").increment(1);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "upstream unavailable" })),
            )
                .into_response()
        }
    }
}

/// Bind and run the server until shutdown is requested.
pub async fn serve(
    addr: std::net::SocketAddr,
    router: Router,
) -> Result<(), super::error::InfraError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}
