//! MARGIN Storage - local persistence
//!
//! A namespaced key-value store (in memory or LMDB), the timestamped response
//! cache built on it, the offline-aware read-through fetch policy and the
//! connectivity signal that drives revalidation.

pub mod cache;
mod connectivity;
mod flags;
mod kv;
mod lmdb;
mod scoped_key;

pub use cache::{
    list_cache_key, CacheEntry, CacheRead, CacheStats, Cacheable, Fetch, Fetcher, LocalCache,
    ReadThroughCache, Refresh, DEFAULT_STALE_THRESHOLD,
};
pub use connectivity::Connectivity;
pub use flags::{AppFlags, INSTALLED_APP_FLAG};
pub use kv::{get_json, set_json, InMemoryKv, KvStore};
pub use lmdb::{LmdbError, LmdbKv};
pub use scoped_key::{Namespace, ScopedKey};
