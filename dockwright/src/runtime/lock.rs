//! Home directory lock preventing concurrent builders.
//!
//! Uses flock(2) so only one builder mutates a given DOCKWRIGHT_HOME (blob
//! store, layer cache, image index) at a time. The lock is released when the
//! guard is dropped or the process exits.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

/// Exclusive lock on a home directory.
#[derive(Debug)]
pub struct HomeLock {
    #[allow(dead_code)] // Held for lifetime, not directly accessed
    file: File,
    path: PathBuf,
}

impl HomeLock {
    /// Attempt to acquire an exclusive lock on the home directory.
    ///
    /// Fails immediately (non-blocking) when another builder holds it.
    pub fn acquire(home_dir: &Path) -> DockwrightResult<Self> {
        std::fs::create_dir_all(home_dir)
            .map_err(|e| DockwrightError::Storage(format!("failed to create home dir: {}", e)))?;

        let lock_path = home_dir.join(".lock");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| DockwrightError::Storage(format!("failed to open lock file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(DockwrightError::Storage(format!(
                        "Another build is already using directory: {}\n\
                         Only one builder can use a DOCKWRIGHT_HOME directory at a time.",
                        home_dir.display()
                    )));
                } else {
                    return Err(DockwrightError::Storage(format!(
                        "failed to acquire lock: {}",
                        err
                    )));
                }
            }
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired home lock");

        Ok(HomeLock {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HomeLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }

        tracing::debug!(lock_path = %self.path.display(), "Released home lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_lock() {
        let temp_dir = TempDir::new().unwrap();
        let lock = HomeLock::acquire(temp_dir.path()).unwrap();

        assert_eq!(lock.path(), temp_dir.path().join(".lock"));
        assert!(lock.path().exists());
    }

    #[test]
    fn test_lock_prevents_concurrent_builders() {
        let temp_dir = TempDir::new().unwrap();

        let _first = HomeLock::acquire(temp_dir.path()).unwrap();
        let second = HomeLock::acquire(temp_dir.path());

        let err = second.unwrap_err();
        assert!(matches!(err, DockwrightError::Storage(_)), "{err:?}");
        assert!(err.to_string().contains("Another build"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();

        {
            let _lock = HomeLock::acquire(temp_dir.path()).unwrap();
        }

        let _again = HomeLock::acquire(temp_dir.path()).unwrap();
    }
}
