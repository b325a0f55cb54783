//! Plain file backend
//!
//! Positional reads and writes against a file pre-sized to the block
//! capacity. No user-space buffering: every call goes to the page cache.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::RwLock;

use super::backend::{check_bounds, data_file_path, BackendKind, StorageBackend};
use crate::error::{Error, Result};

/// Block storage in a regular file
pub struct FileBackend {
    path: PathBuf,
    capacity: u32,
    /// `None` once released
    file: RwLock<Option<File>>,
}

impl FileBackend {
    /// Create `{index}-{timestamp}.data` under `dir`, sized to `capacity`
    pub fn create(dir: &Path, index: u32, capacity: u32) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = data_file_path(dir, index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;

        Ok(Self {
            path,
            capacity,
            file: RwLock::new(Some(file)),
        })
    }

    /// Backing file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, offset: u32, len: u32) -> Result<Bytes> {
        check_bounds(offset, len as u64, self.capacity)?;
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(Error::Closed)?;
        let mut buf = vec![0u8; len as usize];
        read_exact_at(file, &mut buf, offset as u64)?;
        Ok(Bytes::from(buf))
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len() as u64, self.capacity)?;
        let guard = self.file.read();
        let file = guard.as_ref().ok_or(Error::Closed)?;
        write_all_at(file, data, offset as u64)?;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        // Stale bytes are unreachable once the block's offset is rewound.
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let Some(file) = self.file.write().take() else {
            return Ok(());
        };
        drop(file);
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
        BackendKind::File
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release file block");
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path(), 0, 4096).unwrap();
        assert_eq!(backend.kind(), BackendKind::File);
        assert_eq!(fs::metadata(backend.path()).unwrap().len(), 4096);

        backend.write(100, b"hello").unwrap();
        assert_eq!(&backend.read(100, 5).unwrap()[..], b"hello");
        // untouched bytes read back as zero
        assert_eq!(&backend.read(0, 4).unwrap()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_file_backend_bounds() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path(), 1, 16).unwrap();
        assert!(backend.write(10, &[1u8; 7]).is_err());
        assert!(backend.read(16, 1).is_err());
        assert!(backend.write(10, &[1u8; 6]).is_ok());
    }

    #[test]
    fn test_file_backend_release_removes_file() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::create(dir.path(), 2, 64).unwrap();
        let path = backend.path().to_path_buf();
        assert!(path.exists());

        backend.release().unwrap();
        assert!(!path.exists());
        // idempotent
        backend.release().unwrap();
        assert!(matches!(backend.read(0, 1), Err(Error::Closed)));
        assert!(matches!(backend.write(0, b"x"), Err(Error::Closed)));
    }
}
