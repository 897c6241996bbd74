//! Offline-aware read-through fetch policy.
//!
//! A read hands back whatever is cached right away. When online, a remote
//! fetch runs concurrently; its result overwrites the cache and is delivered
//! through [`Fetch::settle`]. When the fetch fails, the cached value keeps
//! being served and the key is marked stale; with nothing cached the error is
//! surfaced. Offline, no fetch is attempted at all.
//!
//! Marked keys are refetched exactly once when connectivity flips from
//! offline to online (see [`ReadThroughCache::spawn_reconnect_watcher`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{join_all, BoxFuture};
use margin_core::{
    EntityKind, KeyedSequencer, ListQuery, Pagination, RemoteError, SyncError, SyncResult, Ticket,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::entry::CacheRead;
use super::local::LocalCache;
use super::stats::CacheStats;
use crate::Connectivity;

/// Cache key for one page of a list query.
pub fn list_cache_key(kind: EntityKind, query: &ListQuery, pagination: Pagination) -> String {
    format!(
        "{}?{}&limit={}&offset={}",
        kind.collection(),
        query,
        pagination.limit,
        pagination.offset
    )
}

/// Retrieves the authoritative value for one cache key.
#[async_trait]
pub trait Fetcher<V>: Send + Sync {
    async fn fetch(&self) -> SyncResult<V>;
}

/// Value bound required for anything stored through the read-through cache.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Refetch job for one key. Takes the cache as an argument so the registry
/// does not keep the cache alive through itself.
type Revalidator = Arc<dyn Fn(ReadThroughCache) -> BoxFuture<'static, ()> + Send + Sync>;

/// How the concurrent fetch of a [`Fetch`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Refresh<V> {
    /// The server answered; the cache now holds this value.
    Fresh(CacheRead<V>),
    /// A newer request for the same key completed first; this answer was dropped.
    Superseded,
    /// The fetch failed and the cached value (now marked stale) stays in use.
    Failed {
        error: SyncError,
        fallback: CacheRead<V>,
    },
    /// Offline: nothing was fetched.
    Skipped,
}

/// An in-progress read.
#[derive(Debug)]
pub struct Fetch<V> {
    cached: Option<CacheRead<V>>,
    pending: Option<oneshot::Receiver<SyncResult<Refresh<V>>>>,
}

impl<V> Fetch<V> {
    /// Value available immediately, if any.
    pub fn cached(&self) -> Option<&CacheRead<V>> {
        self.cached.as_ref()
    }

    pub fn take_cached(&mut self) -> Option<CacheRead<V>> {
        self.cached.take()
    }

    pub fn is_fetching(&self) -> bool {
        self.pending.is_some()
    }

    /// Wait for the concurrent fetch to finish.
    ///
    /// Errors only when the fetch failed and there was nothing cached to fall
    /// back on.
    pub async fn settle(self) -> SyncResult<Refresh<V>> {
        match self.pending {
            None => Ok(Refresh::Skipped),
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(RemoteError::network("fetch task cancelled").into())),
        }
    }
}

/// Read-through cache over [`LocalCache`], gated by [`Connectivity`].
pub struct ReadThroughCache {
    local: Arc<LocalCache>,
    connectivity: Connectivity,
    sequencer: Arc<KeyedSequencer<String>>,
    revalidators: Arc<Mutex<HashMap<String, Revalidator>>>,
    updates: broadcast::Sender<String>,
}

impl ReadThroughCache {
    pub fn new(local: Arc<LocalCache>, connectivity: Connectivity) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            local,
            connectivity,
            sequencer: Arc::new(KeyedSequencer::new()),
            revalidators: Arc::new(Mutex::new(HashMap::new())),
            updates,
        }
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn stats(&self) -> CacheStats {
        self.local.stats()
    }

    /// Keys whose cached value was just replaced by a fetch.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.updates.subscribe()
    }

    /// Serve `key` from cache and, when online, refetch it concurrently.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn fetch<V: Cacheable>(
        &self,
        key: &str,
        fetcher: Arc<dyn Fetcher<V>>,
    ) -> SyncResult<Fetch<V>> {
        let mut cached = match self.local.read::<V>(key).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        };
        self.register(key, Arc::clone(&fetcher));

        if !self.connectivity.is_online() {
            let Some(read) = cached.take() else {
                return Err(SyncError::OfflineWithoutCache {
                    key: key.to_string(),
                });
            };
            let read = if read.is_stale() {
                self.local.mark_stale(key);
                read.mark_stale()
            } else {
                read
            };
            tracing::debug!(key, stale = read.needs_revalidation(), "offline, serving cache");
            return Ok(Fetch {
                cached: Some(read),
                pending: None,
            });
        }

        let (tx, rx) = oneshot::channel();
        let ticket = self.sequencer.issue(&key.to_string());
        let this = self.clone();
        let owned_key = key.to_string();
        tokio::spawn(async move {
            let result = this.refresh(&owned_key, fetcher.as_ref(), ticket).await;
            // The receiver may have been dropped by a caller that only wanted the cached value.
            let _ = tx.send(result);
        });

        Ok(Fetch {
            cached,
            pending: Some(rx),
        })
    }

    /// Refetch every key marked stale. Returns how many refetches ran.
    pub async fn revalidate_stale(&self) -> usize {
        let keys = self.local.take_marked();
        if keys.is_empty() {
            return 0;
        }

        let jobs: Vec<Revalidator> = {
            let revalidators = self.revalidators_map();
            keys.iter()
                .filter_map(|key| {
                    let job = revalidators.get(key).cloned();
                    if job.is_none() {
                        tracing::debug!(key = %key, "no fetcher registered for stale key");
                    }
                    job
                })
                .collect()
        };

        let count = jobs.len();
        for _ in 0..count {
            self.local.recorder().record_revalidation();
        }
        join_all(jobs.iter().map(|job| job(self.clone()))).await;
        tracing::info!(count, "revalidated stale cache entries");
        count
    }

    /// Revalidate on every offline to online transition. Runs until aborted.
    pub fn spawn_reconnect_watcher(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let mut rx = self.connectivity.subscribe();
        tokio::spawn(async move {
            let mut was_online = *rx.borrow_and_update();
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    cache.revalidate_stale().await;
                }
                was_online = online;
            }
        })
    }

    async fn refresh<V: Cacheable>(
        &self,
        key: &str,
        fetcher: &dyn Fetcher<V>,
        ticket: Ticket,
    ) -> SyncResult<Refresh<V>> {
        match fetcher.fetch().await {
            Ok(value) => {
                if !self.sequencer.complete(&key.to_string(), ticket) {
                    tracing::debug!(key, "dropping superseded response");
                    return Ok(Refresh::Superseded);
                }
                let fetched_at = Utc::now();
                if let Err(e) = self.local.write_at(key, &value, fetched_at).await {
                    tracing::warn!(key, error = %e, "failed to write cache entry");
                }
                let _ = self.updates.send(key.to_string());
                Ok(Refresh::Fresh(CacheRead::from_remote(value, fetched_at)))
            }
            Err(error) => {
                if self.sequencer.is_superseded(&key.to_string(), ticket) {
                    tracing::debug!(key, error = %error, "ignoring failure of superseded request");
                    return Ok(Refresh::Superseded);
                }
                self.local.mark_stale(key);
                self.local.recorder().record_failed_fetch();
                tracing::warn!(key, error = %error, "fetch failed, keeping cached value");
                match self.local.read::<V>(key).await {
                    Ok(Some(fallback)) => Ok(Refresh::Failed { error, fallback }),
                    Ok(None) | Err(_) => Err(error),
                }
            }
        }
    }

    fn register<V: Cacheable>(&self, key: &str, fetcher: Arc<dyn Fetcher<V>>) {
        let owned_key = key.to_string();
        let job: Revalidator = Arc::new(move |cache: ReadThroughCache| {
            let key = owned_key.clone();
            let fetcher = Arc::clone(&fetcher);
            Box::pin(async move {
                let ticket = cache.sequencer.issue(&key);
                let _ = cache.refresh(&key, fetcher.as_ref(), ticket).await;
            })
        });
        self.revalidators_map().insert(key.to_string(), job);
    }

    fn revalidators_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Revalidator>> {
        self.revalidators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clone for ReadThroughCache {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            connectivity: self.connectivity.clone(),
            sequencer: Arc::clone(&self.sequencer),
            revalidators: Arc::clone(&self.revalidators),
            updates: self.updates.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryKv;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts calls and fails while `fail` is set.
    struct CountingFetcher {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
        value: Vec<String>,
    }

    impl CountingFetcher {
        fn new(value: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
                value: value.iter().map(|s| s.to_string()).collect(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher<Vec<String>> for CountingFetcher {
        async fn fetch(&self) -> SyncResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(RemoteError::network("connection reset").into());
            }
            Ok(self.value.clone())
        }
    }

    fn cache(online: bool) -> ReadThroughCache {
        let local = Arc::new(LocalCache::new(
            Arc::new(InMemoryKv::new()),
            Duration::from_secs(300),
        ));
        ReadThroughCache::new(local, Connectivity::new(online))
    }

    #[tokio::test]
    async fn test_online_miss_fetches_and_caches() {
        let cache = cache(true);
        let fetcher = CountingFetcher::new(&["a"]);

        let fetch = cache.fetch("tasks", fetcher.clone()).await.unwrap();
        assert!(fetch.cached().is_none());
        let Refresh::Fresh(read) = fetch.settle().await.unwrap() else {
            panic!("expected fresh value");
        };
        assert_eq!(read.value(), &vec!["a".to_string()]);

        let again = cache.fetch("tasks", fetcher.clone()).await.unwrap();
        assert_eq!(again.cached().map(|r| r.value().len()), Some(1));
        again.settle().await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_serves_cache_and_marks_stale() {
        let cache = cache(true);
        cache.local().write("tasks", &vec!["old".to_string()]).await.unwrap();
        let fetcher = CountingFetcher::new(&["new"]);
        fetcher.fail.store(true, Ordering::SeqCst);

        let fetch = cache.fetch("tasks", fetcher.clone()).await.unwrap();
        assert!(fetch.cached().is_some());
        match fetch.settle().await.unwrap() {
            Refresh::Failed { fallback, error } => {
                assert_eq!(fallback.value(), &vec!["old".to_string()]);
                assert!(fallback.is_marked_stale());
                assert!(error.is_retryable());
            }
            other => panic!("expected failure fallback, got {other:?}"),
        }
        assert!(cache.local().is_marked_stale("tasks"));
    }

    #[tokio::test]
    async fn test_failure_without_cache_surfaces_error() {
        let cache = cache(true);
        let fetcher = CountingFetcher::new(&[]);
        fetcher.fail.store(true, Ordering::SeqCst);

        let fetch = cache.fetch("notes", fetcher).await.unwrap();
        assert!(fetch.settle().await.is_err());
    }

    #[tokio::test]
    async fn test_offline_never_fetches() {
        let cache = cache(false);
        let fetcher = CountingFetcher::new(&["x"]);

        let err = cache.fetch("tasks", fetcher.clone()).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::OfflineWithoutCache {
                key: "tasks".to_string()
            }
        );

        cache.local().write("tasks", &vec!["cached".to_string()]).await.unwrap();
        let fetch = cache.fetch("tasks", fetcher.clone()).await.unwrap();
        assert!(!fetch.is_fetching());
        assert_eq!(fetch.settle().await.unwrap(), Refresh::Skipped);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_after_newer_success_leaves_key_unmarked() {
        let cache = cache(true);
        let fetcher = CountingFetcher::new(&["a"]);
        let key = "tasks".to_string();
        let older = cache.sequencer.issue(&key);
        let newer = cache.sequencer.issue(&key);

        let fresh = cache.refresh(&key, fetcher.as_ref(), newer).await.unwrap();
        assert!(matches!(fresh, Refresh::Fresh(_)));

        fetcher.fail.store(true, Ordering::SeqCst);
        let late = cache.refresh(&key, fetcher.as_ref(), older).await.unwrap();
        assert!(matches!(late, Refresh::Superseded));
        assert!(!cache.local().is_marked_stale(&key));
        assert_eq!(cache.stats().failed_fetches, 0);
    }

    #[tokio::test]
    async fn test_reconnect_refetches_each_marked_key_once() {
        let cache = cache(true);
        let tasks = CountingFetcher::new(&["t"]);
        let notes = CountingFetcher::new(&["n"]);
        tasks.fail.store(true, Ordering::SeqCst);
        notes.fail.store(true, Ordering::SeqCst);
        cache.local().write("tasks", &vec!["t0".to_string()]).await.unwrap();
        cache.local().write("notes", &vec!["n0".to_string()]).await.unwrap();

        cache.fetch("tasks", tasks.clone()).await.unwrap().settle().await.unwrap();
        cache.fetch("notes", notes.clone()).await.unwrap().settle().await.unwrap();
        assert_eq!((tasks.calls(), notes.calls()), (1, 1));

        tasks.fail.store(false, Ordering::SeqCst);
        notes.fail.store(false, Ordering::SeqCst);
        assert_eq!(cache.revalidate_stale().await, 2);
        assert_eq!((tasks.calls(), notes.calls()), (2, 2));

        // Marks were consumed by the successful refetch.
        assert_eq!(cache.revalidate_stale().await, 0);
        assert_eq!((tasks.calls(), notes.calls()), (2, 2));
        assert_eq!(cache.stats().revalidations, 2);
    }

    #[tokio::test]
    async fn test_reconnect_watcher_triggers_revalidation() {
        let cache = cache(false);
        let fetcher = CountingFetcher::new(&["fresh"]);
        cache
            .local()
            .write_at(
                "tasks",
                &vec!["old".to_string()],
                Utc::now() - chrono::Duration::minutes(10),
            )
            .await
            .unwrap();

        let fetch = cache.fetch("tasks", fetcher.clone()).await.unwrap();
        assert!(fetch.cached().is_some_and(|r| r.is_marked_stale()));

        let mut updates = cache.subscribe();
        let watcher = cache.spawn_reconnect_watcher();
        cache.connectivity().set_online(true);

        let key = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("revalidation should finish")
            .unwrap();
        assert_eq!(key, "tasks");
        assert_eq!(fetcher.calls(), 1);
        watcher.abort();
    }
}
