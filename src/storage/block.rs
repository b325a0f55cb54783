//! Storage Block - bump allocator over one backend
//!
//! A block hands out space by atomically advancing an offset and never
//! reclaims individual allocations. Superseded bytes are only counted as
//! dirty; the whole block is recycled by [`StorageBlock::free`] once no
//! live value remains in it.
//!
//! # Accounting
//!
//! - `used_bytes`: bytes of values currently referenced from the index
//! - `dirty_bytes`: bytes overwritten, deleted or expired since the last free
//! - `dirty_ratio = dirty_bytes / capacity` drives compaction

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::backend::{BackendKind, StorageBackend};
use super::file::FileBackend;
use super::mmap::MmapBackend;
use super::offheap::OffHeapBackend;
use super::pointer::Pointer;
use crate::error::{Error, Result};

/// Space reserved by [`StorageBlock::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub offset: u32,
    pub length: u32,
}

/// Fixed-capacity append-only region
pub struct StorageBlock {
    /// Stable identity, assigned once by the manager
    index: u32,
    capacity: u32,
    backend: Box<dyn StorageBackend>,
    /// Raw bump pointer. Failed allocations still advance it, so it may
    /// exceed capacity; the block is then full until freed.
    bump_offset: AtomicU64,
    /// End of the furthest successful allocation
    allocated_end: AtomicU64,
    used_bytes: AtomicI64,
    dirty_bytes: AtomicI64,
}

impl StorageBlock {
    /// Wrap an existing backend
    pub fn new(index: u32, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            index,
            capacity: backend.capacity(),
            backend,
            bump_offset: AtomicU64::new(0),
            allocated_end: AtomicU64::new(0),
            used_bytes: AtomicI64::new(0),
            dirty_bytes: AtomicI64::new(0),
        }
    }

    /// Create a block with a fresh backend of the given kind
    pub fn open(dir: &Path, index: u32, capacity: u32, kind: BackendKind) -> Result<Self> {
        let backend: Box<dyn StorageBackend> = match kind {
            BackendKind::File => Box::new(FileBackend::create(dir, index, capacity)?),
            BackendKind::Mmap => Box::new(MmapBackend::create(dir, index, capacity)?),
            BackendKind::OffHeap => Box::new(OffHeapBackend::new(capacity)?),
        };
        Ok(Self::new(index, backend))
    }

    /// Reserve `len` bytes, or `None` if the block is full
    pub fn allocate(&self, len: u32) -> Option<Allocation> {
        let end = self.bump_offset.fetch_add(len as u64, Ordering::AcqRel) + len as u64;
        if end > self.capacity as u64 {
            return None;
        }
        self.allocated_end.fetch_max(end, Ordering::AcqRel);
        Some(Allocation {
            offset: (end - len as u64) as u32,
            length: len,
        })
    }

    /// Append `payload`; `Ok(None)` means the block is full
    pub fn store(self: &Arc<Self>, payload: &[u8]) -> Result<Option<Pointer>> {
        let len = payload_len(payload)?;
        let Some(allocation) = self.allocate(len) else {
            return Ok(None);
        };
        if let Err(e) = self.backend.write(allocation.offset, payload) {
            // the reserved range is lost until the block is freed
            self.dirty_bytes.fetch_add(len as i64, Ordering::AcqRel);
            return Err(e);
        }
        self.used_bytes.fetch_add(len as i64, Ordering::AcqRel);
        Ok(Some(Pointer::new(allocation.offset, len, Arc::clone(self))))
    }

    /// Replace the value at `old` with `payload`.
    ///
    /// A payload that fits in the old range is rewritten in place. A larger
    /// one is appended to this block if there is room; `Ok(None)` means it
    /// did not fit and the caller must store it elsewhere, in which case the
    /// old range is left untouched and still counted as used.
    pub fn update(self: &Arc<Self>, old: &Pointer, payload: &[u8]) -> Result<Option<Pointer>> {
        self.check_owner(old)?;
        let len = payload_len(payload)?;

        if len <= old.length() {
            self.backend.write(old.offset(), payload)?;
            self.dirty_bytes
                .fetch_add((old.length() - len) as i64, Ordering::AcqRel);
            self.used_bytes
                .fetch_add(len as i64 - old.length() as i64, Ordering::AcqRel);
            return Ok(Some(Pointer::new(old.offset(), len, Arc::clone(self))));
        }

        // Store before releasing the old range so used_bytes never dips to
        // zero while the block is still referenced.
        match self.store(payload)? {
            Some(pointer) => {
                self.remove_light(old);
                Ok(Some(pointer))
            }
            None => Ok(None),
        }
    }

    /// Read the value at `pointer`
    pub fn retrieve(&self, pointer: &Pointer) -> Result<Bytes> {
        self.backend.read(pointer.offset(), pointer.length())
    }

    /// Read the value at `pointer` and release its range
    pub fn remove(&self, pointer: &Pointer) -> Result<Bytes> {
        let payload = self.retrieve(pointer)?;
        self.remove_light(pointer);
        Ok(payload)
    }

    /// Release the range at `pointer` without reading it
    pub fn remove_light(&self, pointer: &Pointer) {
        let len = pointer.length() as i64;
        self.dirty_bytes.fetch_add(len, Ordering::AcqRel);
        self.used_bytes.fetch_sub(len, Ordering::AcqRel);
    }

    /// Rewind the block so it can be reused from offset 0
    pub fn free(&self) -> Result<()> {
        self.bump_offset.store(0, Ordering::Release);
        self.allocated_end.store(0, Ordering::Release);
        self.dirty_bytes.store(0, Ordering::Release);
        self.used_bytes.store(0, Ordering::Release);
        self.backend.reset()
    }

    /// Release the backend for good
    pub fn close(&self) -> Result<()> {
        self.backend.release()
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// End of the furthest successful allocation
    #[inline]
    pub fn offset(&self) -> u64 {
        self.allocated_end.load(Ordering::Acquire)
    }

    /// True once an allocation has failed since the last free
    pub fn is_full(&self) -> bool {
        self.bump_offset.load(Ordering::Acquire) > self.capacity as u64
    }

    #[inline]
    pub fn used(&self) -> i64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn dirty(&self) -> i64 {
        self.dirty_bytes.load(Ordering::Acquire)
    }

    pub fn dirty_ratio(&self) -> f64 {
        self.dirty() as f64 / self.capacity as f64
    }

    fn check_owner(&self, pointer: &Pointer) -> Result<()> {
        if pointer.block_index() != self.index {
            return Err(Error::IllegalState(format!(
                "pointer into block {} used with block {}",
                pointer.block_index(),
                self.index
            )));
        }
        Ok(())
    }
}

fn payload_len(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len()).map_err(|_| Error::ValueTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })
}

impl fmt::Debug for StorageBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBlock")
            .field("index", &self.index)
            .field("kind", &self.kind())
            .field("capacity", &self.capacity)
            .field("offset", &self.offset())
            .field("used", &self.used())
            .field("dirty", &self.dirty())
            .finish()
    }
}

impl PartialEq for StorageBlock {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for StorageBlock {}

impl PartialOrd for StorageBlock {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorageBlock {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.index.cmp(&other.index)
    }
}
