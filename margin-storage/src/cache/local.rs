//! Timestamped last-known-good responses on top of the key-value store.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use margin_core::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entry::{CacheEntry, CacheRead};
use super::stats::{CacheStats, StatsRecorder};
use crate::{set_json, KvStore, Namespace, ScopedKey};

/// Default age after which a cached value is reported stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Cache of server responses keyed by entity kind and query.
///
/// Values live in the [`Namespace::Cache`] namespace as JSON
/// [`CacheEntry`] records. The set of keys marked for revalidation is kept in
/// memory only; the cache namespace itself is best effort.
pub struct LocalCache {
    kv: Arc<dyn KvStore>,
    stale_threshold: Duration,
    marked: Mutex<BTreeSet<String>>,
    stats: StatsRecorder,
}

impl LocalCache {
    pub fn new(kv: Arc<dyn KvStore>, stale_threshold: Duration) -> Self {
        Self {
            kv,
            stale_threshold,
            marked: Mutex::new(BTreeSet::new()),
            stats: StatsRecorder::default(),
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    pub async fn read<V: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<CacheRead<V>>, StorageError> {
        self.read_at(key, Utc::now()).await
    }

    /// Read as of `now`. An undecodable entry is dropped and reported as a miss.
    pub async fn read_at<V: DeserializeOwned>(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheRead<V>>, StorageError> {
        let scoped = ScopedKey::cache(key);
        let Some(bytes) = self.kv.get(&scoped).await? else {
            self.stats.record_miss();
            return Ok(None);
        };

        let entry: CacheEntry<V> = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key, error = %e, "dropping undecodable cache entry");
                self.kv.remove(&scoped).await?;
                self.stats.record_miss();
                return Ok(None);
            }
        };

        let is_stale = entry.is_stale_at(now, self.stale_threshold);
        let marked = self.is_marked_stale(key);
        self.stats.record_hit(is_stale || marked);
        Ok(Some(CacheRead::from_cache(entry, is_stale, marked)))
    }

    pub async fn write<V: Serialize>(&self, key: &str, value: &V) -> Result<(), StorageError> {
        self.write_at(key, value, Utc::now()).await
    }

    /// Store `value` as fetched at `fetched_at`, overwriting unconditionally.
    /// A write also clears any revalidation mark on the key.
    pub async fn write_at<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        set_json(
            self.kv.as_ref(),
            &ScopedKey::cache(key),
            &CacheEntry::new(value, fetched_at),
        )
        .await?;
        self.unmark(key);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.kv.remove(&ScopedKey::cache(key)).await?;
        self.unmark(key);
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.kv.keys(Namespace::Cache).await
    }

    /// Queue `key` for refetch on the next reconnect.
    pub fn mark_stale(&self, key: &str) {
        self.marked_set().insert(key.to_string());
    }

    pub fn is_marked_stale(&self, key: &str) -> bool {
        self.marked_set().contains(key)
    }

    /// Drain every marked key. Each mark is handed out exactly once.
    pub fn take_marked(&self) -> Vec<String> {
        std::mem::take(&mut *self.marked_set()).into_iter().collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub(crate) fn recorder(&self) -> &StatsRecorder {
        &self.stats
    }

    fn unmark(&self, key: &str) {
        self.marked_set().remove(key);
    }

    fn marked_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.marked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
