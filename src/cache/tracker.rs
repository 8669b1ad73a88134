//! Cache hit/miss tracking

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Counters for how predictions used the disk cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Requests answered from the cache
    pub cache_hits: u64,
    /// Requests that had to call the backend
    pub cache_misses: u64,
    /// Variants written
    pub cache_writes: u64,
    /// Writes that failed (capacity or I/O); the prediction was still returned
    pub failed_writes: u64,
    /// Entries removed on request
    pub removals: u64,
    /// Cache hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl CacheMetrics {
    pub fn record_hit(&mut self) {
        self.cache_hits += 1;
        self.update_hit_rate();
    }

    pub fn record_miss(&mut self) {
        self.cache_misses += 1;
        self.update_hit_rate();
    }

    pub fn record_write(&mut self, ok: bool) {
        if ok {
            self.cache_writes += 1;
        } else {
            self.failed_writes += 1;
        }
    }

    pub fn record_removal(&mut self) {
        self.removals += 1;
    }

    fn update_hit_rate(&mut self) {
        let total = self.cache_hits + self.cache_misses;
        self.hit_rate = if total > 0 {
            self.cache_hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

impl std::fmt::Display for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Cache Metrics ===")?;
        writeln!(f, "Cache hits: {}", self.cache_hits)?;
        writeln!(f, "Cache misses: {}", self.cache_misses)?;
        writeln!(f, "Hit rate: {:.1}%", self.hit_rate * 100.0)?;
        writeln!(f, "Variants written: {}", self.cache_writes)?;
        writeln!(f, "Failed writes: {}", self.failed_writes)?;
        writeln!(f, "Entries removed: {}", self.removals)?;
        Ok(())
    }
}

/// Thread-safe metrics shared by clones of a model handle
#[derive(Debug, Clone)]
pub struct CacheTracker {
    metrics: Arc<Mutex<CacheMetrics>>,
}

impl CacheTracker {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(CacheMetrics::default())),
        }
    }

    pub fn hit(&self) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record_hit();
        }
    }

    pub fn miss(&self) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record_miss();
        }
    }

    pub fn write(&self, ok: bool) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record_write(ok);
        }
    }

    pub fn removal(&self) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.record_removal();
        }
    }

    /// Get current metrics
    pub fn get_metrics(&self) -> CacheMetrics {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl Default for CacheTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_hit_rate() {
        let mut metrics = CacheMetrics::default();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        assert!((metrics.hit_rate - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_tracker_shared_between_clones() {
        let tracker = CacheTracker::new();
        let clone = tracker.clone();

        tracker.miss();
        clone.hit();
        clone.write(true);
        clone.write(false);
        tracker.removal();

        let metrics = tracker.get_metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.cache_writes, 1);
        assert_eq!(metrics.failed_writes, 1);
        assert_eq!(metrics.removals, 1);

        assert_eq!(clone.get_metrics(), metrics);
    }
}
