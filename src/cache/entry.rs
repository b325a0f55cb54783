//! Cache Entry Handle
//!
//! Per-key index record: where the value lives plus idle-expiry metadata.
//! The state sits behind a mutex because readers (touching last access)
//! and the merger (relocating the pointer) both mutate it while holding
//! only the stripe's read lock.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::storage::Pointer;

/// Sentinel for "never accessed"
pub const UNSET_ACCESS_TIME: i64 = -1;

/// Milliseconds since the Unix epoch
#[inline]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Convert an optional idle timeout to the stored form (`<= 0` never expires)
pub fn tti_millis(tti: Option<Duration>) -> i64 {
    tti.map_or(-1, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Mutable part of an entry
#[derive(Debug)]
pub struct EntryState {
    pub pointer: Pointer,
    last_access_ms: i64,
    time_to_idle_ms: i64,
}

impl EntryState {
    /// Expired iff a positive idle timeout is set, the entry has been
    /// accessed, and more than the timeout has passed since then
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        if self.time_to_idle_ms <= 0 || self.last_access_ms < 0 {
            return false;
        }
        now_ms - self.last_access_ms > self.time_to_idle_ms
    }

    /// Record an access at `now_ms`.
    ///
    /// The first access always sticks. Later ones never move the time
    /// backwards and never revive an expired entry.
    pub fn touch(&mut self, now_ms: i64) {
        if self.last_access_ms < 0 {
            self.last_access_ms = now_ms;
            return;
        }
        if self.last_access_ms >= now_ms || self.is_expired_at(now_ms) {
            return;
        }
        self.last_access_ms = now_ms;
    }

    /// Restart the idle clock after a write. Unlike [`touch`](Self::touch)
    /// this revives an expired entry; it still never moves backwards.
    pub fn restart_idle(&mut self, now_ms: i64) {
        self.last_access_ms = self.last_access_ms.max(now_ms);
    }

    pub fn set_time_to_idle(&mut self, tti_ms: i64) {
        self.time_to_idle_ms = tti_ms;
    }

    pub fn last_access_ms(&self) -> i64 {
        self.last_access_ms
    }

    pub fn time_to_idle_ms(&self) -> i64 {
        self.time_to_idle_ms
    }
}

/// Shared handle stored in the cache index
#[derive(Debug)]
pub struct EntryHandle {
    state: Mutex<EntryState>,
}

impl EntryHandle {
    /// New, never accessed entry
    pub fn new(pointer: Pointer, time_to_idle_ms: i64) -> Self {
        Self {
            state: Mutex::new(EntryState {
                pointer,
                last_access_ms: UNSET_ACCESS_TIME,
                time_to_idle_ms,
            }),
        }
    }

    /// Lock the entry state. Lock order is stripe first, then entry.
    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    /// Non-blocking probe for advisory scans; `None` when contended
    pub fn try_lock(&self) -> Option<MutexGuard<'_, EntryState>> {
        self.state.try_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OffHeapBackend, StorageBlock};
    use std::sync::Arc;

    fn make_entry(tti_ms: i64) -> EntryHandle {
        let block = Arc::new(StorageBlock::new(
            0,
            Box::new(OffHeapBackend::new(4096).unwrap()),
        ));
        let pointer = block.store(b"value").unwrap().unwrap();
        EntryHandle::new(pointer, tti_ms)
    }

    #[test]
    fn test_never_expires_without_tti() {
        let entry = make_entry(-1);
        let mut state = entry.lock();
        state.touch(1_000);
        assert!(!state.is_expired_at(i64::MAX));

        state.set_time_to_idle(0);
        assert!(!state.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_unaccessed_entry_does_not_expire() {
        let entry = make_entry(10);
        let state = entry.lock();
        assert_eq!(state.last_access_ms(), UNSET_ACCESS_TIME);
        assert!(!state.is_expired_at(1_000_000));
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = make_entry(100);
        let mut state = entry.lock();
        state.touch(1_000);
        assert!(!state.is_expired_at(1_100));
        assert!(state.is_expired_at(1_101));
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let entry = make_entry(100);
        let mut state = entry.lock();
        state.touch(1_000);
        state.touch(900);
        assert_eq!(state.last_access_ms(), 1_000);
        state.touch(1_050);
        assert_eq!(state.last_access_ms(), 1_050);
    }

    #[test]
    fn test_touch_does_not_revive_expired_entry() {
        let entry = make_entry(100);
        let mut state = entry.lock();
        state.touch(1_000);
        state.touch(2_000);
        assert_eq!(state.last_access_ms(), 1_000);
        assert!(state.is_expired_at(2_000));
    }

    #[test]
    fn test_restart_idle_revives() {
        let entry = make_entry(100);
        let mut state = entry.lock();
        state.touch(1_000);
        assert!(state.is_expired_at(2_000));
        state.restart_idle(2_000);
        assert!(!state.is_expired_at(2_000));
        state.restart_idle(1_500);
        assert_eq!(state.last_access_ms(), 2_000);
    }

    #[test]
    fn test_tti_millis() {
        assert_eq!(tti_millis(None), -1);
        assert_eq!(tti_millis(Some(Duration::from_secs(2))), 2_000);
        assert_eq!(tti_millis(Some(Duration::ZERO)), 0);
    }

    #[test]
    fn test_now_millis_is_positive() {
        assert!(now_millis() > 0);
    }
}
