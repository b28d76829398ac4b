// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! File-backed booking lock.
//!
//! An exclusive `flock` on a per-controller file. The lock is tied to the
//! open file, so it dies with the process that holds it and a restarted
//! daemon can book controllers left behind by a previous run.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::GpuError;

pub struct BookingLock {
    path: PathBuf,
    held: Mutex<Option<Flock<File>>>,
}

impl std::fmt::Debug for BookingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingLock")
            .field("path", &self.path)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl BookingLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn held(&self) -> MutexGuard<'_, Option<Flock<File>>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock without blocking. `Ok(false)` when someone else,
    /// in this process or another, already holds it.
    pub fn try_lock(&self) -> Result<bool, GpuError> {
        let mut held = self.held();
        if held.is_some() {
            return Ok(false);
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|e| GpuError::Booking {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                *held = Some(lock);
                Ok(true)
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(false),
            Err((_, errno)) => Err(GpuError::Booking {
                path: self.path.clone(),
                reason: errno.desc().to_string(),
            }),
        }
    }

    /// Release the lock if this instance holds it.
    pub fn unlock(&self) {
        if let Some(lock) = self.held().take() {
            if let Err((_, errno)) = lock.unlock() {
                tracing::warn!(path = %self.path.display(), error = %errno, "Failed to release booking lock");
            }
        }
    }

    /// Whether this instance holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held().is_some()
    }

    /// Release and delete the lock file.
    pub fn remove(&self) {
        self.unlock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove booking file")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ctl.booking");
        let first = BookingLock::new(&path);
        let second = BookingLock::new(&path);

        assert!(first.try_lock().unwrap());
        assert!(!first.try_lock().unwrap());
        assert!(!second.try_lock().unwrap());

        first.unlock();
        assert!(second.try_lock().unwrap());
        assert!(second.is_locked());
        assert!(!first.is_locked());
    }

    #[test]
    fn test_remove_deletes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ctl.booking");
        let lock = BookingLock::new(&path);
        assert!(lock.try_lock().unwrap());
        lock.remove();
        assert!(!path.exists());
        assert!(!lock.is_locked());
    }
}
