//! Stored cache entries and the staleness-aware read wrapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the cache namespace actually stores for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, fetched_at: DateTime<Utc>) -> Self {
        Self { value, fetched_at }
    }

    /// Age at `now`, clamped to zero when the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// `now - fetched_at > threshold`. Once true for some `now`, true for every later `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Result of a cache read, carrying staleness metadata.
///
/// Callers get the value together with how trustworthy it is, never a bare
/// value that hides its age.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<V> {
    value: V,
    fetched_at: DateTime<Utc>,
    is_stale: bool,
    marked_stale: bool,
    was_cache_hit: bool,
}

impl<V> CacheRead<V> {
    /// A value served out of local storage.
    pub fn from_cache(
        entry: CacheEntry<V>,
        is_stale: bool,
        marked_stale: bool,
    ) -> Self {
        Self {
            value: entry.value,
            fetched_at: entry.fetched_at,
            is_stale,
            marked_stale,
            was_cache_hit: true,
        }
    }

    /// A value that just arrived from the server.
    pub fn from_remote(value: V, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value,
            fetched_at,
            is_stale: false,
            marked_stale: false,
            was_cache_hit: false,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Older than the stale threshold at read time.
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// Queued for refetch on the next reconnect.
    pub fn is_marked_stale(&self) -> bool {
        self.marked_stale
    }

    /// Whether the UI should show a "may be outdated" hint.
    pub fn needs_revalidation(&self) -> bool {
        self.is_stale || self.marked_stale
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub(crate) fn mark_stale(mut self) -> Self {
        self.marked_stale = true;
        self
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(V) -> U,
    {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            is_stale: self.is_stale,
            marked_stale: self.marked_stale,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<V> AsRef<V> for CacheRead<V> {
    fn as_ref(&self) -> &V {
        &self.value
    }
}
