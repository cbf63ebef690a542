//! Upstream forwarding.
//!
//! One shared `reqwest` client pointed at the configured origin. Requests
//! are replayed verbatim apart from hop-by-hop headers, which belong to
//! each connection and must not cross the proxy.

use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::UpstreamSettings;

/// Headers scoped to a single connection (RFC 9110 §7.6.1), plus `host`,
/// which the client rewrites for the origin.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to build upstream client: {0}")]
    Client(reqwest::Error),
    #[error("failed to join upstream url with `{path}`: {message}")]
    Url { path: String, message: String },
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// What came back from the origin, ready to be cached or replayed.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Shared client for the configured origin.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base: Url,
}

impl UpstreamClient {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProxyError::Client)?;

        Ok(Self {
            client,
            base: settings.url.clone(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Forward one request to the origin and buffer its response.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, ProxyError> {
        let target = self
            .base
            .join(path_and_query.trim_start_matches('/'))
            .map_err(|err| ProxyError::Url {
                path: path_and_query.to_string(),
                message: err.to_string(),
            })?;

        debug!(method = %method, target = %target, "forwarding to upstream");

        let mut request = self.client.request(method, target);
        for (name, value) in headers {
            if is_hop_by_hop(name) {
                continue;
            }
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name) {
                continue;
            }
            response_headers.append(name.clone(), value.clone());
        }
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|hop| name.as_str().eq_ignore_ascii_case(hop))
}
