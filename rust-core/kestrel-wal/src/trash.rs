// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Quarantine trash
//
// Segments are never deleted outright. They are first renamed into a batch
// directory under `<wal_dir>/.wal_trash/`, named by its creation time in
// Unix milliseconds, and only deleted once the batch is older than the
// configured grace period. When the last batch is purged the trash root
// itself is removed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::WalResult;
use crate::segment::sync_dir;

/// Name of the trash root inside a log directory.
pub const TRASH_DIR: &str = ".wal_trash";

/// One quarantine batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrashBatch {
    /// Directory holding the quarantined files.
    pub path: PathBuf,
    /// Creation time, from the directory name or its mtime.
    pub created_at: DateTime<Utc>,
}

/// Result of a purge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Batches deleted (or that would be, in a dry run).
    pub purged: Vec<PathBuf>,
    /// `true` if the trash root was removed because it became empty.
    pub root_removed: bool,
}

/// The trash root of one log directory.
#[derive(Debug, Clone)]
pub struct Trash {
    root: PathBuf,
}

impl Trash {
    /// The trash of the log in `wal_dir`. Nothing is created on disk.
    pub fn new(wal_dir: impl AsRef<Path>) -> Self {
        Self {
            root: wal_dir.as_ref().join(TRASH_DIR),
        }
    }

    /// Path of the trash root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns `true` if the trash root currently exists.
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create a fresh, empty batch directory stamped with `now`.
    ///
    /// An existing batch name is never reused; the timestamp is bumped by a
    /// millisecond until a free name is found.
    pub fn create_batch(&self, now: DateTime<Utc>) -> WalResult<PathBuf> {
        fs::create_dir_all(&self.root)?;

        let mut millis = now.timestamp_millis();
        loop {
            let batch = self.root.join(millis.to_string());
            match fs::create_dir(&batch) {
                Ok(()) => {
                    sync_dir(&self.root)?;
                    debug!(batch = %batch.display(), "Created trash batch");
                    return Ok(batch);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => millis += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// List every batch, oldest first.
    pub fn batches(&self) -> WalResult<Vec<TrashBatch>> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let mut batches = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let metadata = dir_entry.metadata()?;
            if !metadata.is_dir() {
                continue;
            }

            let name = dir_entry.file_name();
            let created_at = match name
                .to_str()
                .and_then(|n| n.parse::<i64>().ok())
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            {
                Some(created_at) => created_at,
                None => DateTime::<Utc>::from(metadata.modified()?),
            };

            batches.push(TrashBatch {
                path: dir_entry.path(),
                created_at,
            });
        }

        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(batches)
    }

    /// Delete every batch created before `now - grace`. A zero grace purges
    /// all batches. An empty trash root is removed afterwards.
    ///
    /// With `dry_run` set nothing is deleted; the report lists what would
    /// have been.
    pub fn purge(&self, now: DateTime<Utc>, grace: Duration, dry_run: bool) -> WalResult<PurgeReport> {
        let mut report = PurgeReport::default();
        if !self.exists() {
            return Ok(report);
        }

        let cutoff = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace));

        for batch in self.batches()? {
            let expired = grace.is_zero() || cutoff.is_some_and(|cutoff| batch.created_at < cutoff);
            if !expired {
                continue;
            }
            if !dry_run {
                match fs::remove_dir_all(&batch.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
                info!(batch = %batch.path.display(), "Purged trash batch");
            }
            report.purged.push(batch.path);
        }

        if !dry_run && fs::read_dir(&self.root)?.next().is_none() {
            match fs::remove_dir(&self.root) {
                Ok(()) => {
                    report.root_removed = true;
                    debug!(root = %self.root.display(), "Removed empty trash root");
                }
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "Failed to remove trash root");
                }
            }
        }

        Ok(report)
    }
}

/// Rename `file` into `batch`, keeping its file name.
///
/// Returns `None` when `file` is no longer at its path (already moved by an
/// earlier, interrupted pass).
pub fn quarantine_file(batch: &Path, file: &Path) -> WalResult<Option<PathBuf>> {
    let Some(name) = file.file_name() else {
        return Ok(None);
    };
    let target = batch.join(name);
    match fs::rename(file, &target) {
        Ok(()) => Ok(Some(target)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_create_batch_named_by_millis() {
        let dir = TempDir::new().unwrap();
        let trash = Trash::new(dir.path());
        assert!(!trash.exists());

        let batch = trash.create_batch(at(1_700_000_000_000)).unwrap();
        assert!(trash.exists());
        assert_eq!(batch.file_name().unwrap(), "1700000000000");
    }

    #[test]
    fn test_create_batch_never_reuses_name() {
        let dir = TempDir::new().unwrap();
        let trash = Trash::new(dir.path());

        let first = trash.create_batch(at(5_000)).unwrap();
        let second = trash.create_batch(at(5_000)).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.file_name().unwrap(), "5001");
    }

    #[test]
    fn test_quarantine_file_moves_and_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let trash = Trash::new(dir.path());
        let batch = trash.create_batch(at(1)).unwrap();

        let file = dir.path().join("wal_0000000001.segment");
        fs::write(&file, b"data").unwrap();

        let moved = quarantine_file(&batch, &file).unwrap().unwrap();
        assert!(!file.exists());
        assert_eq!(fs::read(moved).unwrap(), b"data");

        assert!(quarantine_file(&batch, &file).unwrap().is_none());
    }

    #[test]
    fn test_purge_respects_grace() {
        let dir = TempDir::new().unwrap();
        let trash = Trash::new(dir.path());
        let grace = Duration::from_secs(60);

        trash.create_batch(at(0)).unwrap();
        trash.create_batch(at(50_000)).unwrap();

        // At t=100s only the first batch is past the grace period.
        let report = trash.purge(at(100_000), grace, false).unwrap();
        assert_eq!(report.purged.len(), 1);
        assert!(!report.root_removed);
        assert_eq!(trash.batches().unwrap().len(), 1);

        let report = trash.purge(at(200_000), grace, false).unwrap();
        assert_eq!(report.purged.len(), 1);
        assert!(report.root_removed);
        assert!(!trash.exists());
    }

    #[test]
    fn test_zero_grace_purges_everything() {
        let dir = TempDir::new().unwrap();
        let trash = Trash::new(dir.path());
        let now = at(10_000);
        trash.create_batch(now).unwrap();

        let report = trash.purge(now, Duration::ZERO, false).unwrap();
        assert_eq!(report.purged.len(), 1);
        assert!(!trash.exists());
    }

    #[test]
    fn test_dry_run_purge_keeps_batches() {
        let dir = TempDir::new().unwrap();
        let trash = Trash::new(dir.path());
        trash.create_batch(at(0)).unwrap();

        let report = trash.purge(at(1_000_000), Duration::from_secs(1), true).unwrap();
        assert_eq!(report.purged.len(), 1);
        assert!(!report.root_removed);
        assert_eq!(trash.batches().unwrap().len(), 1);
    }

    #[test]
    fn test_non_numeric_batch_uses_mtime() {
        let dir = TempDir::new().unwrap();
        let trash = Trash::new(dir.path());
        fs::create_dir_all(trash.root().join("manual")).unwrap();

        // Created just now, so a long grace keeps it.
        let report = trash
            .purge(Utc::now(), Duration::from_secs(3600), false)
            .unwrap();
        assert!(report.purged.is_empty());
        assert_eq!(trash.batches().unwrap().len(), 1);
    }
}
