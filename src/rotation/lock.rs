//! Advisory lock held for the duration of a rotation

use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Exclusive advisory lock on `<config>.lock`.
///
/// The OS drops the lock when the holder exits, so a killed rotation never
/// leaves a stale lock behind.
#[derive(Debug)]
pub struct RotationLock {
    file: File,
    path: PathBuf,
}

/// Why a lock could not be taken
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Rotation lock {0} is held by another process")]
    Held(PathBuf),

    #[error("Rotation lock IO error: {0}")]
    Io(#[from] io::Error),
}

impl RotationLock {
    /// Take the lock for `config_path` without waiting
    pub fn acquire(config_path: &Path) -> Result<Self, LockError> {
        let path = lock_path_for(config_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {
                debug!(lock = %path.display(), "Rotation lock acquired");
                Ok(Self { file, path })
            }
            Err(TryLockError::WouldBlock) => Err(LockError::Held(path)),
            Err(TryLockError::Error(e)) => Err(LockError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RotationLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(lock = %self.path.display(), "Rotation lock released");
    }
}

/// `<path>.lock`
pub fn lock_path_for(config_path: &Path) -> PathBuf {
    let mut name = config_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_lock_is_refused() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");

        let held = RotationLock::acquire(&config).unwrap();
        assert_eq!(held.path(), dir.path().join("config.json.lock"));

        match RotationLock::acquire(&config) {
            Err(LockError::Held(path)) => assert_eq!(path, lock_path_for(&config)),
            other => panic!("expected held lock, got {:?}", other.map(|_| ())),
        }

        let message = RotationLock::acquire(&config).unwrap_err().to_string();
        assert!(message.contains("config.json.lock"));

        drop(held);
        assert!(RotationLock::acquire(&config).is_ok());
    }
}
