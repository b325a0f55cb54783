//! Expiry purge
//!
//! Two phases: an advisory scan over the index that never blocks on entry
//! locks, then one stripe write lock per group of candidates during which
//! each key is re-checked before it is dropped. A key touched or rewritten
//! between the phases survives.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cache::{now_millis, CacheInner, CacheKey};

/// Outcome of one purge pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Index entries inspected
    pub scanned: usize,
    /// Entries that looked expired during the scan
    pub candidates: usize,
    /// Entries removed after re-checking
    pub removed: usize,
    /// Blocks returned to the free pool afterwards
    pub reclaimed_blocks: usize,
    /// Stopped early by shutdown
    pub cancelled: bool,
}

#[instrument(skip_all)]
pub(crate) fn purge<K: CacheKey>(inner: &CacheInner<K>, token: &CancellationToken) -> PurgeReport {
    let mut report = PurgeReport::default();
    let now = now_millis();

    let mut by_stripe: HashMap<usize, Vec<K>> = HashMap::new();
    for entry in inner.index.iter() {
        report.scanned += 1;
        // contended entries are being accessed, so not idle
        let expired = entry
            .value()
            .try_lock()
            .is_some_and(|state| state.is_expired_at(now));
        if expired {
            by_stripe
                .entry(inner.locks.stripe_index(entry.key()))
                .or_default()
                .push(entry.key().clone());
            report.candidates += 1;
        }
    }

    for (stripe, keys) in by_stripe {
        if token.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let _guard = inner.locks.write_stripe(stripe);
        for key in keys {
            let Some(handle) = inner.index.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let state = handle.lock();
            if !state.is_expired_at(now_millis()) {
                continue;
            }
            inner.index.remove(&key);
            inner.storage.remove_light(&state.pointer);
            inner
                .counters
                .add_stored_bytes(-(state.pointer.length() as i64));
            inner.counters.record_expiration();
            report.removed += 1;
        }
    }

    inner.counters.record_purge_run();
    debug!(
        scanned = report.scanned,
        candidates = report.candidates,
        removed = report.removed,
        "Purge pass finished"
    );
    report
}
