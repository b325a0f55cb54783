//! Off-heap backend
//!
//! One page-aligned, zero-initialized allocation per block, owned through a
//! raw pointer. The region is freed exactly once: by `release()` or, if
//! that never ran, on drop.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use bytes::Bytes;
use parking_lot::RwLock;

use super::backend::{check_bounds, BackendKind, StorageBackend};
use crate::error::{Error, Result};

/// Alignment of off-heap regions (one page)
pub const OFFHEAP_ALIGNMENT: usize = 4096;

/// Exclusively owned raw allocation
struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Region owns its allocation exclusively. Shared access goes through
// the backend's RwLock and targets disjoint ranges.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout
        // and is dropped exactly once.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Block storage in raw process memory
pub struct OffHeapBackend {
    capacity: u32,
    /// `None` once released
    region: RwLock<Option<Region>>,
}

impl OffHeapBackend {
    /// Allocate a zeroed region of `capacity` bytes
    pub fn new(capacity: u32) -> Result<Self> {
        let size = capacity as usize;
        if size == 0 {
            return Err(Error::AllocationFailed {
                size,
                reason: "size must be greater than 0".into(),
            });
        }
        let layout = Layout::from_size_align(size, OFFHEAP_ALIGNMENT).map_err(|e| {
            Error::AllocationFailed {
                size,
                reason: e.to_string(),
            }
        })?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| Error::AllocationFailed {
            size,
            reason: "allocator returned NULL".into(),
        })?;

        Ok(Self {
            capacity,
            region: RwLock::new(Some(Region { ptr, layout })),
        })
    }
}

impl StorageBackend for OffHeapBackend {
    fn read(&self, offset: u32, len: u32) -> Result<Bytes> {
        check_bounds(offset, len as u64, self.capacity)?;
        let guard = self.region.read();
        let region = guard.as_ref().ok_or(Error::Closed)?;
        // SAFETY: bounds checked; region alive while the guard is held.
        let src = unsafe {
            std::slice::from_raw_parts(region.ptr.as_ptr().add(offset as usize), len as usize)
        };
        Ok(Bytes::copy_from_slice(src))
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len() as u64, self.capacity)?;
        let guard = self.region.read();
        let region = guard.as_ref().ok_or(Error::Closed)?;
        // SAFETY: bounds checked; `data` is a caller-owned buffer and cannot
        // overlap the region.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                region.ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        // Region::drop deallocates
        self.region.write().take();
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OffHeap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offheap_zeroed_and_aligned() {
        let backend = OffHeapBackend::new(8192).unwrap();
        assert_eq!(backend.kind(), BackendKind::OffHeap);
        let guard = backend.region.read();
        let region = guard.as_ref().unwrap();
        assert_eq!(region.ptr.as_ptr() as usize % OFFHEAP_ALIGNMENT, 0);
        drop(guard);
        assert!(backend.read(0, 8192).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_offheap_read_write() {
        let backend = OffHeapBackend::new(1024).unwrap();
        backend.write(1000, b"0123456789").unwrap();
        assert_eq!(&backend.read(1000, 10).unwrap()[..], b"0123456789");
        // ending exactly at capacity is in bounds
        backend.write(1020, b"0123").unwrap();
        assert_eq!(&backend.read(1020, 4).unwrap()[..], b"0123");
        assert!(matches!(
            backend.write(1021, b"0123"),
            Err(Error::OutOfBounds { offset: 1021, len: 4, capacity: 1024 })
        ));
    }

    #[test]
    fn test_offheap_release_is_idempotent() {
        let backend = OffHeapBackend::new(1024).unwrap();
        backend.release().unwrap();
        backend.release().unwrap();
        assert!(matches!(backend.read(0, 1), Err(Error::Closed)));
        assert!(matches!(backend.write(0, b"x"), Err(Error::Closed)));
    }

    #[test]
    fn test_offheap_zero_capacity() {
        assert!(matches!(
            OffHeapBackend::new(0),
            Err(Error::AllocationFailed { size: 0, .. })
        ));
    }
}
