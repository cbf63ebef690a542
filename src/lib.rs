//! Sosta: a caching reverse proxy.
//!
//! Requests fall through to a configured upstream origin; cacheable
//! responses are written through a stack of storage tiers (memory, file,
//! Postgres, Redis, object storage) and replayed on later hits. See the
//! [`cache`] module for the policy pipeline and [`storage`] for the
//! backend contract.

pub mod cache;
pub mod config;
pub mod infra;
pub mod proxy;
pub mod request_log;
pub mod storage;
