//! Cache usage counters.

use std::sync::RwLock;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found an entry.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Hits that were past the stale threshold or marked stale.
    pub stale_serves: u64,
    /// Refetches triggered by an offline to online transition.
    pub revalidations: u64,
    /// Remote fetches that failed while a cached value was served instead.
    pub failed_fetches: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    stats: RwLock<CacheStats>,
}

impl StatsRecorder {
    fn update(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    pub(crate) fn record_hit(&self, stale: bool) {
        self.update(|s| {
            s.hits += 1;
            if stale {
                s.stale_serves += 1;
            }
        });
    }

    pub(crate) fn record_miss(&self) {
        self.update(|s| s.misses += 1);
    }

    pub(crate) fn record_revalidation(&self) {
        self.update(|s| s.revalidations += 1);
    }

    pub(crate) fn record_failed_fetch(&self) {
        self.update(|s| s.failed_fetches += 1);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }
}
