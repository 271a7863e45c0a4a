//! Advisory cross-process file locks.
//!
//! A `FileLock` holds an exclusive OS lock on a sentinel file for as long as it
//! lives. Dropping it (or calling `release`) unlocks and removes the sentinel.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{DaoError, DaoResult};

#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to lock `path` without blocking.
    ///
    /// `Ok(None)` means another handle, in this or another process, holds the lock.
    pub fn try_acquire(path: &Path) -> DaoResult<Option<FileLock>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DaoError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| DaoError::io(path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "lock acquired");
                Ok(Some(FileLock { file, path: path.to_path_buf() }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(DaoError::io(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and delete the sentinel file.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "unlock failed");
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot remove lock file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pos1").join("segmented_objects").join(".lock");

        let first = FileLock::try_acquire(&path).unwrap().expect("first acquire");
        assert!(path.exists());
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        first.release();
        assert!(!path.exists());
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db_config.json.lock");
        {
            let _lock = FileLock::try_acquire(&path).unwrap().unwrap();
        }
        assert!(!path.exists());
        let again = FileLock::try_acquire(&path).unwrap();
        assert_eq!(again.as_ref().map(|l| l.path()), Some(path.as_path()));
    }

    #[test]
    fn test_external_holder_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");
        let external = File::create(&path).unwrap();
        external.lock_exclusive().unwrap();

        assert!(FileLock::try_acquire(&path).unwrap().is_none());
        external.unlock().unwrap();
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }
}
