// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Retention cleaner
//
// The cleaner retires sealed segments in two phases. A sealed segment whose
// every Lsn is at or below the persisted watermark, and which is not among
// the `keep_last_k` most recent sealed segments, is first quarantined: moved
// into a fresh batch under the trash root. Batches older than the grace
// period are then purged, and an empty trash root is removed.
//
// The cleaner never touches the active (newest) segment, so it may run
// alongside the writer. A segment that is no longer at its original path is
// treated as already moved.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::CleanerConfig;
use crate::error::WalResult;
use crate::index::{index_path_for, SegmentIndex};
use crate::lock::{DirLock, CLEANER_ROLE};
use crate::lsn::Lsn;
use crate::reader::read_segment;
use crate::segment::{list_segments, sync_dir, SegmentInfo};
use crate::trash::{quarantine_file, Trash};
use crate::watermark::WatermarkSource;

/// What one cleaner pass did (or, in a dry run, would have done).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanerReport {
    /// Watermark the pass classified against.
    pub watermark: Option<Lsn>,
    /// Segments moved into the trash.
    pub quarantined: Vec<PathBuf>,
    /// Trash batches deleted.
    pub purged_batches: Vec<PathBuf>,
    /// `true` if the trash root was removed at the end of the pass.
    pub trash_root_removed: bool,
    /// `true` if nothing on disk was changed.
    pub dry_run: bool,
}

/// Periodic retention for one log directory.
pub struct WalCleaner {
    wal_dir: PathBuf,
    config: CleanerConfig,
    watermark: Arc<dyn WatermarkSource>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WalCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalCleaner")
            .field("wal_dir", &self.wal_dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WalCleaner {
    /// A cleaner for `wal_dir` reading the watermark from `watermark`.
    pub fn new(
        wal_dir: impl AsRef<Path>,
        config: CleanerConfig,
        watermark: Arc<dyn WatermarkSource>,
        clock: Arc<dyn Clock>,
    ) -> WalResult<Self> {
        config.validate()?;
        Ok(Self {
            wal_dir: wal_dir.as_ref().to_path_buf(),
            config,
            watermark,
            clock,
        })
    }

    /// The cleaner's settings.
    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Run one quarantine-then-purge pass.
    ///
    /// Holds `cleaner.lock` for the duration of the pass; a concurrent pass
    /// fails with `LockConflict`.
    pub fn run(&self) -> WalResult<CleanerReport> {
        let lock = DirLock::acquire(&self.wal_dir, CLEANER_ROLE)?;
        let result = self.run_locked();
        lock.release()?;
        result
    }

    fn run_locked(&self) -> WalResult<CleanerReport> {
        let watermark = self.watermark.watermark()?;
        let dry_run = self.config.dry_run;
        let mut report = CleanerReport {
            watermark,
            dry_run,
            ..CleanerReport::default()
        };

        let segments = list_segments(&self.wal_dir)?;
        let eligible = match watermark {
            Some(watermark) => self.eligible(&segments, watermark)?,
            None => Vec::new(),
        };

        if dry_run {
            report.quarantined = eligible.iter().map(|s| s.path.clone()).collect();
        } else if !eligible.is_empty() {
            report.quarantined = self.quarantine(&eligible)?;
        }

        let trash = Trash::new(&self.wal_dir);
        let purge = trash.purge(self.clock.now(), self.config.grace, dry_run)?;
        report.purged_batches = purge.purged;
        report.trash_root_removed = purge.root_removed;

        info!(
            dir = %self.wal_dir.display(),
            watermark = ?watermark,
            segments = segments.len(),
            quarantined = report.quarantined.len(),
            purged = report.purged_batches.len(),
            trash_root_removed = report.trash_root_removed,
            dry_run,
            "WAL cleaner pass complete"
        );

        Ok(report)
    }

    /// Sealed segments fully covered by `watermark` and older than the
    /// retained tail.
    fn eligible(&self, segments: &[SegmentInfo], watermark: Lsn) -> WalResult<Vec<SegmentInfo>> {
        // The newest segment is the active one.
        let Some((_active, sealed)) = segments.split_last() else {
            return Ok(Vec::new());
        };
        let candidates = sealed.len().saturating_sub(self.config.keep_last_k);

        let mut eligible = Vec::new();
        for segment in &sealed[..candidates] {
            match max_lsn_of(segment)? {
                Coverage::Empty => eligible.push(segment.clone()),
                Coverage::Through(max) if max <= watermark => eligible.push(segment.clone()),
                Coverage::Through(max) => {
                    debug!(segment = %segment.name(), max_lsn = %max, "Segment not yet covered");
                }
                Coverage::Unknown => {
                    warn!(segment = %segment.name(), "Sealed segment failed validation; retaining");
                }
            }
        }
        Ok(eligible)
    }

    fn quarantine(&self, eligible: &[SegmentInfo]) -> WalResult<Vec<PathBuf>> {
        let trash = Trash::new(&self.wal_dir);
        let batch = trash.create_batch(self.clock.now())?;

        let mut moved = Vec::with_capacity(eligible.len());
        for segment in eligible {
            match quarantine_file(&batch, &segment.path)? {
                Some(_) => {
                    quarantine_file(&batch, &index_path_for(&segment.path))?;
                    debug!(segment = %segment.name(), batch = %batch.display(), "Quarantined segment");
                    moved.push(segment.path.clone());
                }
                None => {
                    warn!(segment = %segment.name(), "Segment already gone; skipping");
                }
            }
        }

        if moved.is_empty() {
            fs::remove_dir(&batch)?;
        }
        sync_dir(&self.wal_dir)?;
        Ok(moved)
    }

    /// Run a pass every `config.interval` on the current tokio runtime until
    /// the returned task is shut down.
    ///
    /// Each pass runs on the blocking pool. A failed pass is logged and the
    /// schedule continues.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(self) -> CleanerTask {
        let interval = self.config.interval;
        let cleaner = Arc::new(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown_rx => break,
                }

                let pass = Arc::clone(&cleaner);
                match tokio::task::spawn_blocking(move || pass.run()).await {
                    Ok(Ok(report)) => {
                        debug!(quarantined = report.quarantined.len(), "Scheduled cleaner pass done");
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Scheduled cleaner pass failed");
                    }
                    Err(e) => {
                        error!(error = %e, "Cleaner pass panicked");
                    }
                }
            }
            debug!("Cleaner task stopped");
        });

        CleanerTask {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Handle on a cleaner running in the background.
#[derive(Debug)]
pub struct CleanerTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl CleanerTask {
    /// Stop scheduling passes and wait for an in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            error!(error = %e, "Cleaner task ended abnormally");
        }
    }
}

enum Coverage {
    /// The segment holds no frames.
    Empty,
    /// Highest Lsn in the segment.
    Through(Lsn),
    /// The segment could not be fully validated.
    Unknown,
}

/// Highest Lsn in a sealed segment, from its sidecar when sealed, otherwise
/// by reading it.
fn max_lsn_of(segment: &SegmentInfo) -> WalResult<Coverage> {
    if let Some(index) = SegmentIndex::load(&segment.path)? {
        if index.sealed {
            return Ok(match index.max_lsn {
                Some(max) => Coverage::Through(max),
                None => Coverage::Empty,
            });
        }
    }

    let scan = read_segment(&segment.path, Lsn::ZERO)?;
    if !scan.is_clean() {
        return Ok(Coverage::Unknown);
    }
    Ok(match scan.last_lsn() {
        Some(max) => Coverage::Through(max),
        None => Coverage::Empty,
    })
}
