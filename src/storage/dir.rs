//! Cache directory handling
//!
//! Blocks do not survive a restart, so a cache always starts from an empty
//! directory and removes it again on close if nothing else was put there.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Validate `dir`, wipe anything left from a previous run and recreate it
pub fn prepare_cache_dir(dir: &Path) -> Result<PathBuf> {
    if dir.as_os_str().is_empty() {
        return Err(Error::InvalidArgument("cache directory must not be empty".into()));
    }
    if dir.is_file() {
        return Err(Error::InvalidArgument(format!(
            "cache directory {} is a regular file",
            dir.display()
        )));
    }

    if dir.exists() {
        debug!(dir = %dir.display(), "Removing previous cache data");
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(dir.to_path_buf())
}

/// Remove `dir` if it exists and is empty. Returns whether it was removed.
pub fn remove_dir_if_empty(dir: &Path) -> Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Ok(false);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    fs::remove_dir(dir)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_wipes_previous_contents() {
        let root = tempdir().unwrap();
        let dir = root.path().join("cache");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("0-1700000000000.data"), b"stale").unwrap();

        let prepared = prepare_cache_dir(&dir).unwrap();
        assert_eq!(prepared, dir);
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_prepare_rejects_file_and_empty_path() {
        let root = tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        assert!(prepare_cache_dir(&file).unwrap_err().is_invalid_argument());
        assert!(prepare_cache_dir(Path::new("")).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_remove_dir_if_empty() {
        let root = tempdir().unwrap();
        let dir = root.path().join("cache");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("keep"), b"x").unwrap();
        assert!(!remove_dir_if_empty(&dir).unwrap());

        fs::remove_file(dir.join("keep")).unwrap();
        assert!(remove_dir_if_empty(&dir).unwrap());
        assert!(!dir.exists());
        // missing directory is not an error
        assert!(!remove_dir_if_empty(&dir).unwrap());
    }
}
