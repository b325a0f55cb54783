//! Dirty-block compaction
//!
//! Live entries are moved out of blocks whose dirty ratio exceeds the
//! threshold so the block drains to zero used bytes and can be recycled by
//! the next `clean()`. Relocated data never lands in the block being
//! drained.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheInner, CacheKey};
use crate::error::Result;

/// Outcome of one merge pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Index entries inspected
    pub scanned: usize,
    /// Dirty blocks found by the scan
    pub dirty_blocks: usize,
    /// Entries living in those blocks
    pub candidates: usize,
    /// Entries moved to another block
    pub relocated: usize,
    /// Entries whose move failed; they stay where they were
    pub failed: usize,
    /// Blocks returned to the free pool afterwards
    pub reclaimed_blocks: usize,
    /// Stopped early by shutdown
    pub cancelled: bool,
}

#[instrument(skip_all, fields(threshold = inner.config.dirty_ratio_threshold))]
pub(crate) fn merge<K: CacheKey>(inner: &CacheInner<K>, token: &CancellationToken) -> MergeReport {
    let mut report = MergeReport::default();
    let threshold = inner.config.dirty_ratio_threshold;

    let mut by_block: BTreeMap<u32, Vec<K>> = BTreeMap::new();
    for entry in inner.index.iter() {
        report.scanned += 1;
        let Some(state) = entry.value().try_lock() else {
            continue;
        };
        let block = state.pointer.block();
        if block.dirty_ratio() > threshold {
            by_block
                .entry(block.index())
                .or_default()
                .push(entry.key().clone());
            report.candidates += 1;
        }
    }
    report.dirty_blocks = by_block.len();

    'blocks: for (block_index, keys) in by_block {
        for key in keys {
            if token.is_cancelled() {
                report.cancelled = true;
                break 'blocks;
            }
            match relocate(inner, &key, threshold) {
                Ok(true) => report.relocated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(block = block_index, error = %e, "Failed to relocate entry");
                    inner.counters.record_maintenance_error();
                    report.failed += 1;
                }
            }
        }
    }

    inner.counters.record_merge_run();
    debug!(
        scanned = report.scanned,
        dirty_blocks = report.dirty_blocks,
        relocated = report.relocated,
        failed = report.failed,
        "Merge pass finished"
    );
    report
}

/// Move one entry out of its block if the block is still dirty.
/// Returns whether it moved.
fn relocate<K: CacheKey>(inner: &CacheInner<K>, key: &K, threshold: f64) -> Result<bool> {
    let _stripe = inner.locks.read(key);
    let Some(handle) = inner.index.get(key).map(|e| Arc::clone(e.value())) else {
        return Ok(false);
    };

    let mut state = handle.lock();
    let block = Arc::clone(state.pointer.block());
    if block.dirty_ratio() <= threshold {
        return Ok(false);
    }

    // The old range is released only once the copy is stored, so a failed
    // move leaves the entry intact.
    let payload = inner.storage.retrieve(&state.pointer)?;
    let moved = inner.storage.store_excluding(&payload, &block)?;
    inner.storage.remove_light(&state.pointer);
    state.pointer = moved;
    inner.counters.record_relocation();
    Ok(true)
}
