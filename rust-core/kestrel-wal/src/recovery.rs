// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Startup recovery
//
// Recovery runs once, before a writer attaches to a directory. It walks the
// segments oldest to newest, validating frames, and stops at the first
// failure: a gap in the log is never bridged. What happens at that point
// depends on the tail policy:
//
// - `StrictTruncate` cuts the segment back to the last frame boundary and
//   quarantines every newer segment, so the next writer resumes from a
//   known-good tail.
// - `SalvageContinue` changes nothing on disk and only reports what it saw.
//
// Corruption is an expected outcome here and is reported in the
// `RecoveryOutcome`. Only I/O faults are returned as errors.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::WalResult;
use crate::index::index_path_for;
use crate::lsn::Lsn;
use crate::reader::read_segment;
use crate::segment::{list_segments, sync_dir, SegmentInfo};
use crate::trash::{quarantine_file, Trash};

/// What recovery does with the first undecodable frame it meets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailPolicy {
    /// Truncate at the failed frame and quarantine newer segments.
    StrictTruncate,
    /// Leave every file untouched and report the last valid Lsn.
    SalvageContinue,
}

/// Result of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    /// Lsn of the last frame that validated; `Lsn::ZERO` if none did.
    pub highest_valid_lsn: Lsn,
    /// Offset the tail segment was truncated to (strict policy only, and
    /// only when a failure was found).
    pub truncate_offset: Option<u64>,
    /// Segment in which validation stopped, if it stopped early.
    pub tail_segment: Option<PathBuf>,
    /// Number of valid frames seen.
    pub frames_recovered: u64,
    /// Number of segments read.
    pub segments_scanned: usize,
    /// Segments moved to the trash because they follow the failure.
    pub quarantined: Vec<PathBuf>,
    /// Sidecars rewritten from the validated frames.
    pub rebuilt_indexes: usize,
}

impl RecoveryOutcome {
    /// Returns `true` if every segment was fully valid.
    pub fn is_clean(&self) -> bool {
        self.tail_segment.is_none()
    }
}

/// Scan the log in `wal_dir` and apply `policy` to its first failure.
///
/// Fails with `DirectoryNotFound` if `wal_dir` does not exist, and with `Io`
/// on storage faults. Corrupt frames never produce an error.
pub fn recover(wal_dir: impl AsRef<Path>, policy: TailPolicy) -> WalResult<RecoveryOutcome> {
    let wal_dir = wal_dir.as_ref();
    let segments = list_segments(wal_dir)?;
    let strict = policy == TailPolicy::StrictTruncate;

    let mut outcome = RecoveryOutcome::default();

    for (position, segment) in segments.iter().enumerate() {
        let scan = read_segment(&segment.path, outcome.highest_valid_lsn)?;
        outcome.segments_scanned += 1;
        outcome.frames_recovered += scan.frames.len() as u64;
        if let Some(last) = scan.last_lsn() {
            outcome.highest_valid_lsn = last;
        }

        let Some(failure) = scan.failure.as_ref() else {
            if strict {
                let sealed = position + 1 < segments.len();
                scan.index(segment.epoch, sealed).store(&segment.path)?;
                outcome.rebuilt_indexes += 1;
            }
            continue;
        };

        warn!(
            segment = %segment.name(),
            offset = scan.valid_end,
            file_len = scan.scanned_len,
            reason = %failure,
            policy = ?policy,
            "Corruption found during WAL recovery"
        );
        outcome.tail_segment = Some(segment.path.clone());

        if strict {
            truncate_segment(segment, scan.valid_end)?;
            outcome.truncate_offset = Some(scan.valid_end);

            // The truncated segment is now the tail of the log.
            scan.index(segment.epoch, false).store(&segment.path)?;
            outcome.rebuilt_indexes += 1;

            outcome.quarantined = quarantine_newer(wal_dir, &segments[position + 1..])?;
        }
        break;
    }

    info!(
        dir = %wal_dir.display(),
        policy = ?policy,
        highest_valid_lsn = %outcome.highest_valid_lsn,
        truncate_offset = ?outcome.truncate_offset,
        frames = outcome.frames_recovered,
        segments = outcome.segments_scanned,
        quarantined = outcome.quarantined.len(),
        "WAL recovery complete"
    );

    Ok(outcome)
}

fn truncate_segment(segment: &SegmentInfo, valid_end: u64) -> WalResult<()> {
    let file = OpenOptions::new().write(true).open(&segment.path)?;
    file.set_len(valid_end)?;
    file.sync_all()?;
    info!(
        segment = %segment.name(),
        from = segment.file_size,
        to = valid_end,
        "Truncated WAL segment tail"
    );
    Ok(())
}

/// Move segments past the failure point into one trash batch.
fn quarantine_newer(wal_dir: &Path, newer: &[SegmentInfo]) -> WalResult<Vec<PathBuf>> {
    if newer.is_empty() {
        return Ok(Vec::new());
    }

    let batch = Trash::new(wal_dir).create_batch(Utc::now())?;
    let mut moved = Vec::with_capacity(newer.len());
    for segment in newer {
        if quarantine_file(&batch, &segment.path)?.is_some() {
            quarantine_file(&batch, &index_path_for(&segment.path))?;
            warn!(
                segment = %segment.name(),
                batch = %batch.display(),
                "Quarantined segment beyond corrupt tail"
            );
            moved.push(segment.path.clone());
        }
    }
    sync_dir(wal_dir)?;
    Ok(moved)
}
