use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide cache counters. Reset only by an explicit clear-all.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
}

impl MetricsRecorder {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, memory_size: usize, storage_usage_bytes: usize) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            (hits as f64 * 100.0) / lookups as f64
        };

        CacheMetrics {
            hits,
            misses,
            hit_rate,
            stores: self.stores.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            memory_size,
            storage_usage_kb: storage_usage_bytes as f64 / 1024.0,
        }
    }
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Percentage in `0.0..=100.0`.
    pub hit_rate: f64,
    pub stores: u64,
    pub invalidations: u64,
    pub memory_size: usize,
    pub storage_usage_kb: f64,
}

impl CacheMetrics {
    pub fn hit_rate_display(&self) -> String {
        format!("{:.1}%", self.hit_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_three_hits_two_misses() {
        let metrics = MetricsRecorder::default();
        for _ in 0..3 {
            metrics.record_hit();
        }
        metrics.record_miss();
        metrics.record_miss();

        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.hit_rate, 60.0);
        assert_eq!(snapshot.hit_rate_display(), "60.0%");
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        let snapshot = MetricsRecorder::default().snapshot(0, 2048);
        assert_eq!(snapshot.hit_rate_display(), "0.0%");
        assert_eq!(snapshot.storage_usage_kb, 2.0);
    }

    #[test]
    fn test_reset() {
        let metrics = MetricsRecorder::default();
        metrics.record_store();
        metrics.record_invalidation();
        metrics.reset();

        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.stores, 0);
        assert_eq!(snapshot.invalidations, 0);
    }
}
