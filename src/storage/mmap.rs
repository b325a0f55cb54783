//! Memory-mapped backend
//!
//! A private (copy-on-write) mapping over a file sized to the block
//! capacity. Writes land in anonymous pages and never reach the file, so
//! the file only reserves the address range; its contents are meaningless
//! after a restart, which matches the ephemeral lifetime of blocks.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use super::backend::{check_bounds, data_file_path, BackendKind, StorageBackend};
use crate::error::{Error, Result};

/// Live mapping plus the base pointer used for positional access
struct Mapping {
    /// Held only to keep the mapping alive
    _mmap: MmapMut,
    base: NonNull<u8>,
}

// SAFETY: `base` points into `_mmap`, which is owned by the same struct and
// unmapped only when the struct drops. Concurrent access through `base`
// targets disjoint ranges (enforced by the block allocator).
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Block storage in a private file mapping
pub struct MmapBackend {
    path: PathBuf,
    capacity: u32,
    /// `None` once released
    mapping: RwLock<Option<Mapping>>,
}

impl MmapBackend {
    /// Create and map `{index}-{timestamp}.data` under `dir`
    pub fn create(dir: &Path, index: u32, capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "mmap block capacity must be > 0".into(),
            ));
        }
        fs::create_dir_all(dir)?;
        let path = data_file_path(dir, index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;

        // SAFETY: the file was created by us and is never truncated while
        // mapped; the private mapping is not affected by other writers.
        let mut mmap = unsafe { MmapOptions::new().len(capacity as usize).map_copy(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            Error::IllegalState("memory map returned a null base address".into())
        })?;

        Ok(Self {
            path,
            capacity,
            mapping: RwLock::new(Some(Mapping { _mmap: mmap, base })),
        })
    }

    /// Backing file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for MmapBackend {
    fn read(&self, offset: u32, len: u32) -> Result<Bytes> {
        check_bounds(offset, len as u64, self.capacity)?;
        let guard = self.mapping.read();
        let mapping = guard.as_ref().ok_or(Error::Closed)?;
        // SAFETY: bounds checked above; the mapping stays alive while the
        // read guard is held.
        let src = unsafe {
            std::slice::from_raw_parts(mapping.base.as_ptr().add(offset as usize), len as usize)
        };
        Ok(Bytes::copy_from_slice(src))
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len() as u64, self.capacity)?;
        let guard = self.mapping.read();
        let mapping = guard.as_ref().ok_or(Error::Closed)?;
        // SAFETY: bounds checked above; `data` cannot alias the mapping
        // because callers pass owned value buffers.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapping.base.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let Some(mapping) = self.mapping.write().take() else {
            return Ok(());
        };
        // unmap before unlinking
        drop(mapping);
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mmap
    }
}

impl Drop for MmapBackend {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release mmap block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mmap_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = MmapBackend::create(dir.path(), 0, 1 << 16).unwrap();
        assert_eq!(backend.kind(), BackendKind::Mmap);

        backend.write(0, b"abc").unwrap();
        backend.write(65533, b"xyz").unwrap();
        assert_eq!(&backend.read(0, 3).unwrap()[..], b"abc");
        assert_eq!(&backend.read(65533, 3).unwrap()[..], b"xyz");
        assert!(backend.write(65534, b"xyz").is_err());
    }

    #[test]
    fn test_mmap_private_mapping_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let backend = MmapBackend::create(dir.path(), 3, 4096).unwrap();
        backend.write(0, b"secret").unwrap();
        let on_disk = fs::read(backend.path()).unwrap();
        assert_eq!(on_disk.len(), 4096);
        assert!(on_disk.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mmap_release() {
        let dir = tempdir().unwrap();
        let backend = MmapBackend::create(dir.path(), 4, 4096).unwrap();
        let path = backend.path().to_path_buf();
        backend.release().unwrap();
        backend.release().unwrap();
        assert!(!path.exists());
        assert!(matches!(backend.read(0, 1), Err(Error::Closed)));
    }

    #[test]
    fn test_mmap_zero_capacity_rejected() {
        let dir = tempdir().unwrap();
        assert!(MmapBackend::create(dir.path(), 5, 0).is_err());
    }
}
