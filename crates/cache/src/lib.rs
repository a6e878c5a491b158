//! The smart read cache fronting expensive edge API calls: per-tenant
//! namespaced keys, hard and soft TTLs with background refresh, per-key
//! single-flight coalescing, size-bounded eviction, optional compression,
//! and an optional shutdown snapshot.

mod config;
mod entry;
mod persist;
mod store;

pub use config::{CacheConfig, EvictionPolicy};
pub use store::{CacheStats, RefreshOptions, SmartCache};

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cache keys must be '<tenant>:<resource>:<params>' (got {0:?})")]
    UnprefixedKey(String),
    #[error("cached fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),
    #[error("cached entry {0:?} failed to decompress and was dropped")]
    Corrupt(String),
    #[error("cache persistence failed")]
    Persist(#[source] anyhow::Error),
}
