//! Cache Metrics Collection
//!
//! Lock-free counters updated on the hot path plus the [`CacheStats`]
//! snapshot handed out to callers.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Operation counters of one cache instance
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    expirations: AtomicU64,
    relocations: AtomicU64,
    purge_runs: AtomicU64,
    merge_runs: AtomicU64,
    maintenance_errors: AtomicU64,
    /// Bytes referenced from the index, including expired but unpurged entries
    stored_bytes: AtomicI64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relocation(&self) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_purge_run(&self) {
        self.purge_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge_run(&self) {
        self.merge_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_maintenance_error(&self) {
        self.maintenance_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stored_bytes(&self, delta: i64) {
        self.stored_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn reset_stored_bytes(&self) {
        self.stored_bytes.store(0, Ordering::Relaxed);
    }

    pub fn stored_bytes(&self) -> i64 {
        self.stored_bytes.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits(), self.misses())
    }

    /// Snapshot of the counters; storage gauges are left at zero
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            purge_runs: self.purge_runs.load(Ordering::Relaxed),
            merge_runs: self.merge_runs.load(Ordering::Relaxed),
            maintenance_errors: self.maintenance_errors.load(Ordering::Relaxed),
            ..CacheStats::default()
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    // Counters
    pub hits: u64,
    pub misses: u64,
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub expirations: u64,
    pub relocations: u64,
    pub purge_runs: u64,
    pub merge_runs: u64,
    pub maintenance_errors: u64,

    // Gauges
    pub entry_count: u64,
    pub bytes_used: i64,
    pub bytes_dirty: i64,
    pub capacity: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub total_blocks: u64,
    /// Blocks created with the mmap or off-heap backend
    pub special_blocks: u64,
    pub downgraded_blocks: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        ratio(self.hits, self.misses)
    }

    /// Dirty bytes over total capacity
    pub fn dirty_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.bytes_dirty as f64 / self.capacity as f64
        }
    }

    /// Change since `previous`: counters as differences, gauges as the
    /// latest value
    pub fn delta(&self, previous: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits.saturating_sub(previous.hits),
            misses: self.misses.saturating_sub(previous.misses),
            gets: self.gets.saturating_sub(previous.gets),
            puts: self.puts.saturating_sub(previous.puts),
            deletes: self.deletes.saturating_sub(previous.deletes),
            expirations: self.expirations.saturating_sub(previous.expirations),
            relocations: self.relocations.saturating_sub(previous.relocations),
            purge_runs: self.purge_runs.saturating_sub(previous.purge_runs),
            merge_runs: self.merge_runs.saturating_sub(previous.merge_runs),
            maintenance_errors: self
                .maintenance_errors
                .saturating_sub(previous.maintenance_errors),
            ..self.clone()
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ops:     gets={} puts={} deletes={} hits={} misses={} hit_ratio={:.3}",
            self.gets,
            self.puts,
            self.deletes,
            self.hits,
            self.misses,
            self.hit_ratio()
        )?;
        writeln!(
            f,
            "upkeep:  expirations={} relocations={} purge_runs={} merge_runs={} errors={}",
            self.expirations,
            self.relocations,
            self.purge_runs,
            self.merge_runs,
            self.maintenance_errors
        )?;
        write!(
            f,
            "storage: entries={} used={} dirty={} ({:.3}) capacity={} blocks={}/{} free={} special={} downgraded={}",
            self.entry_count,
            self.bytes_used,
            self.bytes_dirty,
            self.dirty_ratio(),
            self.capacity,
            self.used_blocks,
            self.total_blocks,
            self.free_blocks,
            self.special_blocks,
            self.downgraded_blocks
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = CacheCounters::new();
        counters.record_get();
        counters.record_get();
        counters.record_hit();
        counters.record_miss();
        counters.record_put();
        counters.record_relocation();
        counters.add_stored_bytes(100);
        counters.add_stored_bytes(-40);

        let stats = counters.snapshot();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.relocations, 1);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(counters.stored_bytes(), 60);

        counters.reset_stored_bytes();
        assert_eq!(counters.stored_bytes(), 0);
    }

    #[test]
    fn test_hit_ratio_without_lookups() {
        let counters = CacheCounters::new();
        assert_eq!(counters.hit_ratio(), 0.0);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
        assert_eq!(CacheStats::default().dirty_ratio(), 0.0);
    }

    #[test]
    fn test_hit_ratio() {
        let counters = CacheCounters::new();
        for _ in 0..3 {
            counters.record_hit();
        }
        counters.record_miss();
        assert!((counters.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_delta_subtracts_counters_keeps_gauges() {
        let previous = CacheStats {
            hits: 10,
            puts: 5,
            entry_count: 100,
            bytes_used: 1000,
            ..Default::default()
        };
        let current = CacheStats {
            hits: 15,
            puts: 9,
            entry_count: 80,
            bytes_used: 700,
            total_blocks: 4,
            ..Default::default()
        };

        let delta = current.delta(&previous);
        assert_eq!(delta.hits, 5);
        assert_eq!(delta.puts, 4);
        assert_eq!(delta.entry_count, 80);
        assert_eq!(delta.bytes_used, 700);
        assert_eq!(delta.total_blocks, 4);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = CacheStats {
            hits: 1,
            capacity: 2048,
            bytes_dirty: 512,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"hits\":1"));
        let back: CacheStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
        assert!((back.dirty_ratio() - 0.25).abs() < 1e-9);
    }
}
