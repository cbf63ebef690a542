//! Deterministic cache key generation.
//!
//! A key is `method|normalized-url|header-fragment[|body-hash]`. Equal
//! requests always produce equal keys; query-parameter order and header
//! name casing never change the result. Keys longer than the configured
//! bound collapse to `prefix#sha256`, where the `#` marks a hashed key for
//! debug tooling.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

const SHORT_PREFIX_CHARS: usize = 32;
const BODY_HASH_CHARS: usize = 32;

const DEFAULT_MAX_KEY_LENGTH: usize = 512;

fn default_include_headers() -> Vec<String> {
    vec!["authorization".to_string(), "x-tenant-id".to_string()]
}

fn default_body_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_max_key_length() -> usize {
    DEFAULT_MAX_KEY_LENGTH
}

/// Key generation options from `sosta.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyOptions {
    /// Strip trailing slash and sort query parameters.
    pub normalize_url: bool,
    /// Header allow-list contributing to the key (names case-folded).
    pub include_headers: Vec<String>,
    /// Headers dropped even if allow-listed.
    pub exclude_headers: Vec<String>,
    /// Methods whose body contributes a hash to the key.
    pub body_methods: Vec<String>,
    /// Collapse keys longer than `max_key_length` to `prefix#digest`.
    pub hash_long_keys: bool,
    pub max_key_length: usize,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            normalize_url: default_true(),
            include_headers: default_include_headers(),
            exclude_headers: Vec::new(),
            body_methods: default_body_methods(),
            hash_long_keys: default_true(),
            max_key_length: default_max_key_length(),
        }
    }
}

/// A generated cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey(String);

impl GeneratedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether the key was collapsed through the long-key hash.
    pub fn is_hashed(&self) -> bool {
        self.0.contains('#')
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("cannot build a cache key without a {0}")]
    MissingPart(&'static str),
}

/// Deterministic key builder; cheap to clone, no interior state.
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    options: KeyOptions,
}

impl KeyBuilder {
    pub fn new(options: KeyOptions) -> Self {
        Self { options }
    }

    /// Whether this method's body feeds into the key, meaning callers must
    /// buffer it before generating.
    pub fn wants_body(&self, method: &str) -> bool {
        self.options
            .body_methods
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(method))
    }

    /// Build the key for one request. Failure means "caching disabled for
    /// this request"; callers must never fail the request over it.
    pub fn generate(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<GeneratedKey, KeyError> {
        if method.is_empty() {
            return Err(KeyError::MissingPart("method"));
        }
        if url.is_empty() {
            return Err(KeyError::MissingPart("url"));
        }

        let method = method.to_ascii_uppercase();
        let url = if self.options.normalize_url {
            normalize_url(url)
        } else {
            url.to_string()
        };
        let header_fragment = self.header_fragment(headers);

        let mut raw = format!("{method}|{url}|{header_fragment}");
        if let Some(body) = body.filter(|body| !body.is_empty()) {
            if self
                .options
                .body_methods
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(&method))
            {
                let digest = hex::encode(Sha256::digest(body));
                raw.push('|');
                raw.push_str(&digest[..BODY_HASH_CHARS]);
            }
        }

        if self.options.hash_long_keys && raw.len() > self.options.max_key_length {
            let digest = hex::encode(Sha256::digest(raw.as_bytes()));
            let prefix: String = raw.chars().take(SHORT_PREFIX_CHARS).collect();
            return Ok(GeneratedKey(format!("{prefix}#{digest}")));
        }
        Ok(GeneratedKey(raw))
    }

    /// Allow-listed headers minus excludes, case-folded and sorted so the
    /// same semantic headers always yield the same fragment.
    fn header_fragment(&self, headers: &[(String, String)]) -> String {
        let mut selected: Vec<(String, &str)> = headers
            .iter()
            .filter_map(|(name, value)| {
                let folded = name.to_ascii_lowercase();
                let included = self
                    .options
                    .include_headers
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(&folded));
                let excluded = self
                    .options
                    .exclude_headers
                    .iter()
                    .any(|denied| denied.eq_ignore_ascii_case(&folded));
                (included && !excluded).then_some((folded, value.as_str()))
            })
            .collect();
        selected.sort();

        let mut fragment = String::new();
        for (name, value) in selected {
            if !fragment.is_empty() {
                fragment.push(';');
            }
            fragment.push_str(&name);
            fragment.push('=');
            fragment.push_str(value);
        }
        fragment
    }
}

/// Strip the trailing slash and sort query parameters lexicographically.
fn normalize_url(url: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };

    let base = if base.len() > 1 && base.ends_with('/') {
        &base[..base.len() - 1]
    } else {
        base
    };

    let Some(query) = query.filter(|query| !query.is_empty()) else {
        return base.to_string();
    };

    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    let sorted: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{base}?{sorted}")
}
