// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Directory lock files
//
// A lock is a file named `<role>.lock` in the log directory, created with
// create-exclusive semantics and holding JSON metadata about its owner. The
// file's existence is the lock: a process that dies without releasing it
// leaves the lock held, and an operator must clear it with
// `DirLock::force_release` before a new owner can attach.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{WalError, WalResult};

/// Role name of the single writer of a log directory.
pub const WRITER_ROLE: &str = "write";

/// Role name held for the duration of one cleaner pass.
pub const CLEANER_ROLE: &str = "cleaner";

/// Metadata stored inside a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Token identifying the handle that created the lock.
    pub owner: Uuid,
    /// What the holder does with the directory.
    pub role: String,
    /// Process id of the holder at acquisition time.
    pub pid: u32,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

/// Path of the lock file for `role` in `wal_dir`.
pub fn lock_path(wal_dir: &Path, role: &str) -> PathBuf {
    wal_dir.join(format!("{role}.lock"))
}

/// An exclusively held lock on a log directory.
///
/// Dropping the handle releases the lock; a crashed process never drops it,
/// which is exactly the case `force_release` exists for.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl DirLock {
    /// Take the `role` lock in `wal_dir`.
    ///
    /// Fails with `LockConflict` if the lock file already exists, whether or
    /// not its holder is still alive.
    pub fn acquire(wal_dir: &Path, role: &str) -> WalResult<Self> {
        let path = lock_path(wal_dir, role);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_info(&path)?;
                warn!(
                    lock = %path.display(),
                    holder = ?holder.as_ref().map(|h| h.owner),
                    "Lock already held"
                );
                return Err(WalError::LockConflict { path, holder });
            }
            Err(e) => return Err(e.into()),
        };

        let info = LockInfo {
            owner: Uuid::new_v4(),
            role: role.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        file.write_all(&serde_json::to_vec(&info)?)?;
        file.sync_all()?;

        debug!(lock = %path.display(), owner = %info.owner, "Acquired directory lock");

        Ok(Self {
            path,
            info,
            released: false,
        })
    }

    /// Metadata written when this lock was taken.
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock, removing the lock file.
    ///
    /// Fails with `LockNotHeld` if the file was force-released and taken by
    /// someone else in the meantime; the other owner's file is left alone.
    pub fn release(mut self) -> WalResult<()> {
        self.released = true;
        self.release_inner()
    }

    /// Remove a lock regardless of who holds it, returning the displaced
    /// holder's metadata (or `None` if no lock was present).
    ///
    /// This is the deliberate manual step an operator takes after confirming
    /// the previous holder is gone.
    pub fn force_release(wal_dir: &Path, role: &str) -> WalResult<Option<LockInfo>> {
        let path = lock_path(wal_dir, role);
        if !path.exists() {
            return Ok(None);
        }
        let holder = read_info(&path)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        info!(
            lock = %path.display(),
            holder = ?holder,
            "Force-released directory lock"
        );
        Ok(holder.or(Some(LockInfo {
            owner: Uuid::nil(),
            role: role.to_string(),
            pid: 0,
            acquired_at: DateTime::<Utc>::UNIX_EPOCH,
        })))
    }

    /// Current holder of the `role` lock, if any.
    pub fn holder(wal_dir: &Path, role: &str) -> WalResult<Option<LockInfo>> {
        let path = lock_path(wal_dir, role);
        if !path.exists() {
            return Ok(None);
        }
        read_info(&path)
    }

    fn release_inner(&self) -> WalResult<()> {
        match read_info(&self.path)? {
            Some(current) if current.owner == self.info.owner => {
                fs::remove_file(&self.path)?;
                debug!(lock = %self.path.display(), "Released directory lock");
                Ok(())
            }
            _ => Err(WalError::LockNotHeld {
                path: self.path.clone(),
            }),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release_inner() {
            warn!(lock = %self.path.display(), error = %e, "Failed to release lock on drop");
        }
    }
}

/// Read lock metadata. A missing file is `None`; an empty or garbled file
/// (crash between create and write) is also `None`.
fn read_info(path: &Path) -> WalResult<Option<LockInfo>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_metadata() {
        let dir = TempDir::new().unwrap();
        let lock = DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();

        assert!(lock_path(dir.path(), WRITER_ROLE).exists());
        let holder = DirLock::holder(dir.path(), WRITER_ROLE).unwrap().unwrap();
        assert_eq!(&holder, lock.info());
        assert_eq!(holder.role, "write");
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn test_second_acquire_conflicts() {
        let dir = TempDir::new().unwrap();
        let first = DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();

        match DirLock::acquire(dir.path(), WRITER_ROLE) {
            Err(WalError::LockConflict { holder, .. }) => {
                assert_eq!(holder.unwrap().owner, first.info().owner);
            }
            other => panic!("Expected LockConflict, got: {other:?}"),
        }
    }

    #[test]
    fn test_roles_are_independent() {
        let dir = TempDir::new().unwrap();
        let _writer = DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();
        let _cleaner = DirLock::acquire(dir.path(), CLEANER_ROLE).unwrap();
    }

    #[test]
    fn test_release_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        DirLock::acquire(dir.path(), WRITER_ROLE)
            .unwrap()
            .release()
            .unwrap();
        assert!(!lock_path(dir.path(), WRITER_ROLE).exists());
        DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();
    }

    #[test]
    fn test_leaked_lock_stays_held_until_forced() {
        let dir = TempDir::new().unwrap();
        let lock = DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();
        let owner = lock.info().owner;
        // A crashed process never runs its destructors.
        std::mem::forget(lock);

        assert!(matches!(
            DirLock::acquire(dir.path(), WRITER_ROLE),
            Err(WalError::LockConflict { .. })
        ));

        let displaced = DirLock::force_release(dir.path(), WRITER_ROLE)
            .unwrap()
            .unwrap();
        assert_eq!(displaced.owner, owner);
        DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();
    }

    #[test]
    fn test_force_release_without_lock() {
        let dir = TempDir::new().unwrap();
        assert!(DirLock::force_release(dir.path(), WRITER_ROLE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_release_after_takeover_is_refused() {
        let dir = TempDir::new().unwrap();
        let stale = DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();
        DirLock::force_release(dir.path(), WRITER_ROLE).unwrap();
        let current = DirLock::acquire(dir.path(), WRITER_ROLE).unwrap();

        assert!(matches!(
            stale.release(),
            Err(WalError::LockNotHeld { .. })
        ));
        // The new owner's lock survives the stale release attempt.
        assert_eq!(
            DirLock::holder(dir.path(), WRITER_ROLE).unwrap().unwrap().owner,
            current.info().owner
        );
    }

    #[test]
    fn test_empty_lock_file_still_conflicts() {
        let dir = TempDir::new().unwrap();
        fs::write(lock_path(dir.path(), WRITER_ROLE), b"").unwrap();
        match DirLock::acquire(dir.path(), WRITER_ROLE) {
            Err(WalError::LockConflict { holder, .. }) => assert!(holder.is_none()),
            other => panic!("Expected LockConflict, got: {other:?}"),
        }
    }
}
