//! Response cache with explicit staleness.
//!
//! Reads never hide how old their data is: every read returns a
//! [`CacheRead<V>`] carrying `is_stale` and the fetch timestamp. The fetch
//! policy on top ([`ReadThroughCache`]) decides when to trust the cache and
//! when to go to the network, based on the [`Connectivity`](crate::Connectivity)
//! signal.

pub mod entry;
pub mod local;
pub mod read_through;
pub mod stats;

pub use entry::{CacheEntry, CacheRead};
pub use local::{LocalCache, DEFAULT_STALE_THRESHOLD};
pub use read_through::{list_cache_key, Cacheable, Fetch, Fetcher, ReadThroughCache, Refresh};
pub use stats::CacheStats;
