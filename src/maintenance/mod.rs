//! Background maintenance
//!
//! Two periodic tasks on a dedicated two-worker tokio runtime:
//!
//! - **purge** every `purge_interval`: drop idle-expired entries
//! - **merge** every `merge_interval`: move live entries out of dirty blocks
//!
//! Each pass is followed by `StorageManager::clean()` so drained blocks go
//! back to the free pool. Tasks hold only a `Weak` reference to the cache
//! and stop when it is gone or when the shutdown token is cancelled.

mod merger;
mod purger;

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheInner, CacheKey};
use crate::error::Result;

pub use merger::MergeReport;
pub use purger::PurgeReport;

/// Worker threads of the maintenance runtime (one per task)
const MAINTENANCE_WORKERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Purge,
    Merge,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Task::Purge => "purge",
            Task::Merge => "merge",
        }
    }
}

/// Run one purge pass followed by block reclamation
pub(crate) fn run_purge<K: CacheKey>(
    inner: &CacheInner<K>,
    token: &CancellationToken,
) -> Result<PurgeReport> {
    let mut report = purger::purge(inner, token);
    report.reclaimed_blocks = inner.storage.clean()?;
    Ok(report)
}

/// Run one merge pass followed by block reclamation
pub(crate) fn run_merge<K: CacheKey>(
    inner: &CacheInner<K>,
    token: &CancellationToken,
) -> Result<MergeReport> {
    let mut report = merger::merge(inner, token);
    report.reclaimed_blocks = inner.storage.clean()?;
    Ok(report)
}

/// Owns the maintenance runtime
pub struct MaintenanceScheduler {
    runtime: Runtime,
    token: CancellationToken,
}

impl MaintenanceScheduler {
    /// Spawn the purge and merge tasks for `inner`
    pub(crate) fn start<K: CacheKey>(inner: &Arc<CacheInner<K>>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(MAINTENANCE_WORKERS)
            .thread_name("blockcache-maintenance")
            .enable_time()
            .build()?;
        let token = inner.shutdown.clone();

        for (task, period) in [
            (Task::Purge, inner.config.purge_interval),
            (Task::Merge, inner.config.merge_interval),
        ] {
            runtime.spawn(run_periodic(
                Arc::downgrade(inner),
                task,
                period,
                token.clone(),
            ));
        }

        info!(
            purge_interval_ms = inner.config.purge_interval.as_millis() as u64,
            merge_interval_ms = inner.config.merge_interval.as_millis() as u64,
            "Maintenance scheduler started"
        );
        Ok(Self { runtime, token })
    }

    /// Cancel both tasks and drop the runtime without waiting for them
    pub fn shutdown(self) {
        self.token.cancel();
        self.runtime.shutdown_background();
        debug!("Maintenance scheduler stopped");
    }
}

async fn run_periodic<K: CacheKey>(
    cache: Weak<CacheInner<K>>,
    task: Task,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = cache.upgrade() else {
            // cache dropped without close
            break;
        };
        if token.is_cancelled() {
            break;
        }

        let outcome = match task {
            Task::Purge => run_purge(&inner, &token).map(|r| r.removed),
            Task::Merge => run_merge(&inner, &token).map(|r| r.relocated),
        };
        if let Err(e) = outcome {
            inner.counters.record_maintenance_error();
            warn!(task = task.name(), error = %e, "Maintenance pass failed");
        }
    }
    debug!(task = task.name(), "Maintenance task exiting");
}
