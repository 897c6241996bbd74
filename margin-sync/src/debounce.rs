//! Keyed debouncing on the tokio timer.
//!
//! Scheduling a job for a key replaces the job still waiting on that key: its
//! timer task is aborted before it ever runs. A job whose timer already fired
//! is left to finish, so a write that is on the wire is never cut off.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

struct Pending {
    handle: JoinHandle<()>,
    fire_now: Arc<Notify>,
    fired: Arc<AtomicBool>,
    generation: u64,
}

type PendingMap<K> = Arc<Mutex<HashMap<K, Pending>>>;

pub struct Debouncer<K> {
    pending: PendingMap<K>,
    running: Arc<Mutex<Vec<JoinHandle<()>>>>,
    generation: AtomicU64,
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(Mutex::new(Vec::new())),
            generation: AtomicU64::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` after `delay` unless another job is scheduled for `key` first.
    pub fn schedule<F>(&self, key: K, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let fire_now = Arc::new(Notify::new());
        let fired = Arc::new(AtomicBool::new(false));

        // Held while spawning so the task cannot observe the map before its own entry exists.
        let mut pending = lock(&self.pending);

        let handle = {
            let pending_map = Arc::clone(&self.pending);
            let fire_now = Arc::clone(&fire_now);
            let fired = Arc::clone(&fired);
            let key = key.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = fire_now.notified() => {}
                }
                {
                    let map = lock(&pending_map);
                    let current = map.get(&key).is_some_and(|p| p.generation == generation);
                    // A flushed entry is already out of the map but marked fired.
                    if !current && !fired.load(Ordering::SeqCst) {
                        return;
                    }
                    fired.store(true, Ordering::SeqCst);
                }
                job.await;
                let mut map = lock(&pending_map);
                if map.get(&key).is_some_and(|p| p.generation == generation) {
                    map.remove(&key);
                }
            })
        };

        let entry = Pending {
            handle,
            fire_now,
            fired,
            generation,
        };
        if let Some(previous) = pending.insert(key, entry) {
            self.retire(previous);
        }
    }

    /// Drop the waiting job for `key`, if any. Returns true when one was cancelled.
    pub fn cancel(&self, key: &K) -> bool {
        let previous = lock(&self.pending).remove(key);
        match previous {
            Some(previous) => {
                let was_waiting = !previous.fired.load(Ordering::SeqCst);
                self.retire(previous);
                was_waiting
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.pending)
            .get(key)
            .is_some_and(|p| !p.fired.load(Ordering::SeqCst))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending)
            .values()
            .filter(|p| !p.fired.load(Ordering::SeqCst))
            .count()
    }

    /// Fire every waiting job now and wait for all jobs, including ones already running.
    pub async fn flush(&self) {
        let drained: Vec<Pending> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let mut handles = Vec::with_capacity(drained.len());
        for pending in drained {
            pending.fired.store(true, Ordering::SeqCst);
            pending.fire_now.notify_one();
            handles.push(pending.handle);
        }
        handles.extend(lock(&self.running).drain(..));
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Abort everything, waiting or running.
    pub fn abort_all(&self) {
        for (_, pending) in lock(&self.pending).drain() {
            pending.handle.abort();
        }
        for handle in lock(&self.running).drain(..) {
            handle.abort();
        }
    }

    fn retire(&self, previous: Pending) {
        if previous.fired.load(Ordering::SeqCst) {
            let mut running = lock(&self.running);
            running.retain(|h| !h.is_finished());
            running.push(previous.handle);
        } else {
            previous.handle.abort();
        }
    }
}
