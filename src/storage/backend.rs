//! Storage backend trait
//!
//! A backend is a fixed-capacity, byte-addressable region. Blocks drive it
//! with positional reads and writes; concurrent calls always target
//! disjoint ranges, which the block's bump allocator guarantees.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::config::StorageMode;
use crate::error::{Error, Result};

/// Suffix of backing files
pub const DATA_FILE_SUFFIX: &str = ".data";

/// Concrete backend behind a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Positional I/O on a plain file
    File,
    /// Private memory mapping of a file
    Mmap,
    /// Raw heap allocation outside the value path
    OffHeap,
}

impl BackendKind {
    /// Backend used by `mode` while the off-heap budget lasts
    pub fn for_mode(mode: StorageMode) -> Self {
        match mode {
            StorageMode::PureFile => BackendKind::File,
            StorageMode::MemoryMappedPlusFile => BackendKind::Mmap,
            StorageMode::OffHeapPlusFile => BackendKind::OffHeap,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::File => write!(f, "file"),
            BackendKind::Mmap => write!(f, "mmap"),
            BackendKind::OffHeap => write!(f, "offheap"),
        }
    }
}

/// Byte region a storage block allocates from
pub trait StorageBackend: Send + Sync {
    /// Read `len` bytes starting at `offset`
    fn read(&self, offset: u32, len: u32) -> Result<Bytes>;

    /// Write `data` starting at `offset`
    fn write(&self, offset: u32, data: &[u8]) -> Result<()>;

    /// Logically discard the contents so the region can be reused
    fn reset(&self) -> Result<()>;

    /// Give the region back to the system. Idempotent; later reads and
    /// writes fail with [`Error::Closed`].
    fn release(&self) -> Result<()>;

    /// Fixed capacity in bytes
    fn capacity(&self) -> u32;

    /// Which implementation this is
    fn kind(&self) -> BackendKind;
}

/// Reject ranges that would run past the region
pub(crate) fn check_bounds(offset: u32, len: u64, capacity: u32) -> Result<()> {
    if offset as u64 + len > capacity as u64 {
        return Err(Error::OutOfBounds {
            offset: offset as u64,
            len,
            capacity: capacity as u64,
        });
    }
    Ok(())
}

/// Path of a block's backing file: `{index}-{creation_timestamp_ms}.data`
pub(crate) fn data_file_path(dir: &Path, index: u32) -> PathBuf {
    let stamp = chrono::Utc::now().timestamp_millis();
    dir.join(format!("{}-{}{}", index, stamp, DATA_FILE_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_bounds() {
        assert!(check_bounds(0, 10, 10).is_ok());
        assert!(check_bounds(5, 5, 10).is_ok());
        assert!(matches!(
            check_bounds(6, 5, 10),
            Err(Error::OutOfBounds { offset: 6, len: 5, capacity: 10 })
        ));
        assert!(check_bounds(u32::MAX, 1, u32::MAX).is_err());
    }

    #[test]
    fn test_data_file_name() {
        let path = data_file_path(Path::new("/tmp/cache"), 7);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("7-"));
        assert!(name.ends_with(DATA_FILE_SUFFIX));
        let stamp = &name[2..name.len() - DATA_FILE_SUFFIX.len()];
        assert!(stamp.parse::<i64>().is_ok());
    }

    #[test]
    fn test_kind_for_mode() {
        assert_eq!(BackendKind::for_mode(StorageMode::PureFile), BackendKind::File);
        assert_eq!(
            BackendKind::for_mode(StorageMode::MemoryMappedPlusFile),
            BackendKind::Mmap
        );
        assert_eq!(
            BackendKind::for_mode(StorageMode::OffHeapPlusFile),
            BackendKind::OffHeap
        );
    }
}
