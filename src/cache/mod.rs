//! Block Cache
//!
//! Key → byte-blob cache whose index lives in memory while every payload
//! byte lives in a storage block.
//!
//! # Locking
//!
//! ```text
//! put / delete / purge      stripe write lock ─┐
//! get / merge               stripe read lock  ─┴─> entry mutex
//! ```
//!
//! The stripe lock always comes first. Index guards are dropped before any
//! other lock is taken: handles are cloned out of the map.
//!
//! # Example
//!
//! ```no_run
//! use blockcache::{BlockCache, CacheConfig};
//! use std::time::Duration;
//!
//! let cache: BlockCache<String> = BlockCache::open("/tmp/blockcache", CacheConfig::default())?;
//! cache.put("a".to_string(), b"hello")?;
//! cache.put_with_idle("b".to_string(), b"world", Duration::from_secs(60))?;
//! assert_eq!(cache.get("a")?.as_deref(), Some(&b"hello"[..]));
//! cache.close()?;
//! # Ok::<(), blockcache::Error>(())
//! ```

pub mod entry;
pub mod metrics;
mod proptest;
pub mod stripe;

use std::borrow::Borrow;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::maintenance::{self, MaintenanceScheduler, MergeReport, PurgeReport};
use crate::storage::dir::{prepare_cache_dir, remove_dir_if_empty};
use crate::storage::StorageManager;

pub use entry::{now_millis, EntryHandle, EntryState};
pub use metrics::{CacheCounters, CacheStats};
pub use stripe::StripedLock;

/// Key bounds shared by the cache and its daemons
pub trait CacheKey: Eq + Hash + Clone + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Send + Sync + 'static> CacheKey for T {}

/// State shared between the cache handle and its maintenance tasks
pub(crate) struct CacheInner<K> {
    pub(crate) dir: PathBuf,
    pub(crate) config: CacheConfig,
    pub(crate) index: DashMap<K, Arc<EntryHandle>>,
    pub(crate) locks: StripedLock,
    pub(crate) storage: StorageManager,
    pub(crate) counters: CacheCounters,
    /// Cancelled on close; stops in-flight maintenance between work units
    pub(crate) shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Persistent key → bytes cache
pub struct BlockCache<K: CacheKey> {
    inner: Arc<CacheInner<K>>,
    scheduler: Mutex<Option<MaintenanceScheduler>>,
}

impl<K: CacheKey> BlockCache<K> {
    /// Open a cache in `dir`, discarding whatever a previous run left there
    pub fn open(dir: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let dir = prepare_cache_dir(dir.as_ref())?;

        let storage = StorageManager::new(
            &dir,
            config.capacity_per_block,
            config.initial_block_count,
            config.storage_mode,
            config.max_offheap_bytes,
        )?;
        let locks = StripedLock::new(config.concurrency_level)?;

        let inner = Arc::new(CacheInner {
            dir,
            config,
            index: DashMap::new(),
            locks,
            storage,
            counters: CacheCounters::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let scheduler = match MaintenanceScheduler::start(&inner) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                let _ = inner.storage.close();
                return Err(e);
            }
        };

        info!(
            dir = %inner.dir.display(),
            mode = %inner.config.storage_mode,
            stripes = inner.locks.len(),
            "Block cache opened"
        );

        Ok(Self {
            inner,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    /// Store `value` under `key` with no idle expiry
    pub fn put(&self, key: K, value: &[u8]) -> Result<()> {
        self.insert(key, value, None)
    }

    /// Store `value` under `key`; it expires once unread for longer than `tti`
    pub fn put_with_idle(&self, key: K, value: &[u8], tti: Duration) -> Result<()> {
        self.insert(key, value, Some(tti))
    }

    fn insert(&self, key: K, value: &[u8], tti: Option<Duration>) -> Result<()> {
        let inner = self.live()?;
        inner.counters.record_put();

        let max = inner.config.max_value_length as usize;
        if value.len() > max {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max,
            });
        }

        let tti_ms = entry::tti_millis(tti);
        let _stripe = inner.locks.write(&key);
        let existing = inner.index.get(&key).map(|e| Arc::clone(e.value()));
        let now = now_millis();

        match existing {
            None => {
                let pointer = inner.storage.store(value)?;
                let len = pointer.length() as i64;
                let handle = EntryHandle::new(pointer, tti_ms);
                handle.lock().touch(now);
                inner.index.insert(key, Arc::new(handle));
                inner.counters.add_stored_bytes(len);
            }
            Some(handle) => {
                let mut state = handle.lock();
                let old_len = state.pointer.length() as i64;
                let pointer = inner.storage.update(&state.pointer, value)?;
                let new_len = pointer.length() as i64;
                state.pointer = pointer;
                state.set_time_to_idle(tti_ms);
                state.restart_idle(now);
                inner.counters.add_stored_bytes(new_len - old_len);
            }
        }
        Ok(())
    }

    /// Value stored under `key`, or `None` if absent or idle-expired
    pub fn get<Q>(&self, key: &Q) -> Result<Option<Bytes>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let inner = self.live()?;
        inner.counters.record_get();

        let _stripe = inner.locks.read(key);
        let Some(handle) = inner.index.get(key).map(|e| Arc::clone(e.value())) else {
            inner.counters.record_miss();
            return Ok(None);
        };

        let mut state = handle.lock();
        let now = now_millis();
        if state.is_expired_at(now) {
            // left for the purger
            inner.counters.record_miss();
            return Ok(None);
        }
        state.touch(now);
        let payload = inner.storage.retrieve(&state.pointer)?;
        inner.counters.record_hit();
        Ok(Some(payload))
    }

    /// Remove `key`, returning its value if it was present
    pub fn delete<Q>(&self, key: &Q) -> Result<Option<Bytes>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let inner = self.live()?;
        inner.counters.record_delete();

        let _stripe = inner.locks.write(key);
        let Some(handle) = inner.index.get(key).map(|e| Arc::clone(e.value())) else {
            return Ok(None);
        };

        let state = handle.lock();
        let payload = inner.storage.remove(&state.pointer)?;
        inner.index.remove(key);
        inner.counters.add_stored_bytes(-(payload.len() as i64));
        Ok(Some(payload))
    }

    /// Whether `key` is indexed. Does not consult idle expiry.
    pub fn contains<Q>(&self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Ok(self.live()?.index.contains_key(key))
    }

    /// Drop every entry and recycle all blocks.
    ///
    /// Storage is freed before the index is cleared: writes that finish
    /// after the index clear survive, writes racing with the call may be
    /// lost. Callers should not write concurrently with a clear.
    pub fn clear(&self) -> Result<()> {
        let inner = self.live()?;
        inner.storage.free()?;
        inner.index.clear();
        inner.counters.reset_stored_bytes();
        Ok(())
    }

    /// Run one expiry pass now, then reclaim empty blocks
    pub fn run_purge(&self) -> Result<PurgeReport> {
        let inner = self.live()?;
        maintenance::run_purge(inner, &inner.shutdown)
    }

    /// Run one compaction pass now, then reclaim empty blocks
    pub fn run_merge(&self) -> Result<MergeReport> {
        let inner = self.live()?;
        maintenance::run_merge(inner, &inner.shutdown)
    }

    /// Stop maintenance, drop every entry and release all storage.
    ///
    /// The data directory is removed if nothing else lives in it. A second
    /// call fails with [`Error::AlreadyClosed`].
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }

        self.inner.shutdown.cancel();
        // Does not wait for a pass already running. A relocation that passed
        // its open check can still create a block file after the directory
        // is removed below.
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }

        self.inner.index.clear();
        self.inner.counters.reset_stored_bytes();
        self.inner.storage.close()?;
        remove_dir_if_empty(&self.inner.dir)?;

        info!(dir = %self.inner.dir.display(), "Block cache closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of indexed entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.index.is_empty()
    }

    /// Bytes referenced from the index
    pub fn stored_bytes(&self) -> i64 {
        self.inner.counters.stored_bytes()
    }

    /// `hits / (hits + misses)`; 0.0 before the first lookup
    pub fn hit_ratio(&self) -> f64 {
        self.inner.counters.hit_ratio()
    }

    /// Snapshot of counters and storage gauges
    pub fn stats(&self) -> CacheStats {
        let storage = &self.inner.storage;
        CacheStats {
            entry_count: self.inner.index.len() as u64,
            bytes_used: storage.used(),
            bytes_dirty: storage.dirty(),
            capacity: storage.capacity(),
            used_blocks: storage.used_block_count() as u64,
            free_blocks: storage.free_block_count() as u64,
            total_blocks: storage.total_block_count() as u64,
            special_blocks: storage.special_blocks(),
            downgraded_blocks: storage.downgraded_blocks(),
            ..self.inner.counters.snapshot()
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Underlying block pool
    pub fn storage(&self) -> &StorageManager {
        &self.inner.storage
    }

    fn live(&self) -> Result<&Arc<CacheInner<K>>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(&self.inner)
    }
}

impl<K: CacheKey> Drop for BlockCache<K> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            warn!(dir = %self.inner.dir.display(), error = %e, "Failed to close cache on drop");
        }
    }
}

impl<K: CacheKey> std::fmt::Debug for BlockCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("dir", &self.inner.dir)
            .field("entries", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_CAPACITY_PER_BLOCK;
    use tempfile::{tempdir, TempDir};

    fn make_cache() -> (TempDir, BlockCache<String>) {
        let root = tempdir().unwrap();
        let config = CacheConfig::new()
            .with_capacity_per_block(MIN_CAPACITY_PER_BLOCK)
            .unwrap()
            .with_initial_block_count(2)
            .unwrap();
        let cache = BlockCache::open(root.path().join("cache"), config).unwrap();
        (root, cache)
    }

    fn make_key(i: usize) -> String {
        format!("key_{i}")
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_root, cache) = make_cache();
        cache.put(make_key(1), b"value").unwrap();
        assert_eq!(cache.get("key_1").unwrap().as_deref(), Some(&b"value"[..]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stored_bytes(), 5);
    }

    #[test]
    fn test_get_missing_counts_miss() {
        let (_root, cache) = make_cache();
        assert!(cache.get("nope").unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.gets, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(cache.hit_ratio(), 0.0);
    }

    #[test]
    fn test_overwrite_adjusts_stored_bytes() {
        let (_root, cache) = make_cache();
        cache.put(make_key(1), &[1u8; 100]).unwrap();
        cache.put(make_key(1), &[2u8; 40]).unwrap();
        assert_eq!(cache.stored_bytes(), 40);
        assert_eq!(cache.storage().used(), 40);
        assert_eq!(cache.storage().dirty(), 60);

        cache.put(make_key(1), &[3u8; 200]).unwrap();
        assert_eq!(cache.stored_bytes(), 200);
        assert_eq!(cache.get("key_1").unwrap().unwrap().len(), 200);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_delete_returns_value() {
        let (_root, cache) = make_cache();
        cache.put(make_key(1), b"gone soon").unwrap();
        assert_eq!(cache.delete("key_1").unwrap().as_deref(), Some(&b"gone soon"[..]));
        assert!(cache.delete("key_1").unwrap().is_none());
        assert!(!cache.contains("key_1").unwrap());
        assert_eq!(cache.stored_bytes(), 0);
    }

    #[test]
    fn test_value_too_large() {
        let (_root, cache) = make_cache();
        let max = cache.config().max_value_length as usize;
        let err = cache.put(make_key(1), &vec![0u8; max + 1]).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(!cache.contains("key_1").unwrap());
        cache.put(make_key(1), &vec![0u8; max]).unwrap();
    }

    #[test]
    fn test_put_resets_idle_clock_of_expired_entry() {
        let (_root, cache) = make_cache();
        cache
            .put_with_idle(make_key(1), b"v1", Duration::from_millis(20))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("key_1").unwrap().is_none());

        cache
            .put_with_idle(make_key(1), b"v2", Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get("key_1").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn test_close_semantics() {
        let (_root, cache) = make_cache();
        cache.put(make_key(1), b"x").unwrap();
        let dir = cache.dir().to_path_buf();

        cache.close().unwrap();
        assert!(cache.is_closed());
        assert!(!dir.exists());
        assert!(matches!(cache.put(make_key(2), b"y"), Err(Error::Closed)));
        assert!(matches!(cache.get("key_1"), Err(Error::Closed)));
        assert!(matches!(cache.close(), Err(Error::AlreadyClosed)));
        assert_eq!(cache.len(), 0);
    }
}
