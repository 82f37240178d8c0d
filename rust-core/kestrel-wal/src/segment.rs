// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Segment allocation
//
// Each WAL segment is a single append-only file named
// `wal_{epoch:010}.segment`. The zero-padded epoch makes lexical order equal
// creation order, so the log can be enumerated without reading any file
// contents. The newest segment is the active one; every older segment is
// sealed and never written again.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{WalError, WalResult};
use crate::index::SegmentIndex;

/// Default maximum segment size in bytes (64 MiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// The file extension used for WAL segment files.
pub const SEGMENT_EXTENSION: &str = "segment";

/// The prefix used for WAL segment file names.
pub const SEGMENT_PREFIX: &str = "wal_";

/// Epoch assigned to the first segment of a fresh log.
pub const FIRST_EPOCH: u64 = 1;

/// Metadata about a single WAL segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// The full path to the segment file on disk.
    pub path: PathBuf,

    /// The creation-order key encoded in the file name.
    pub epoch: u64,

    /// File size in bytes when this info was captured.
    pub file_size: u64,
}

impl SegmentInfo {
    /// The file name component, for logging.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

impl PartialOrd for SegmentInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.epoch.cmp(&other.epoch)
    }
}

/// Build the canonical file name for a segment with the given epoch.
///
/// Format: `wal_0000000001.segment`
pub fn segment_filename(epoch: u64) -> String {
    format!("{SEGMENT_PREFIX}{epoch:010}.{SEGMENT_EXTENSION}")
}

/// Build the full path for a segment file in the given WAL directory.
pub fn segment_path(wal_dir: &Path, epoch: u64) -> PathBuf {
    wal_dir.join(segment_filename(epoch))
}

/// Parse the epoch from a segment file name.
///
/// Returns `None` if the name does not match the expected pattern.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let stripped = name.strip_prefix(SEGMENT_PREFIX)?;
    let digits = stripped.strip_suffix(&format!(".{SEGMENT_EXTENSION}"))?;
    if digits.len() < 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// Scan a WAL directory and return metadata for all segment files, sorted
/// by epoch (ascending).
///
/// Sidecars, lock files, the trash root and anything else are ignored.
pub fn list_segments(wal_dir: &Path) -> WalResult<Vec<SegmentInfo>> {
    if !wal_dir.is_dir() {
        return Err(WalError::DirectoryNotFound(
            wal_dir.display().to_string(),
        ));
    }

    let mut segments = Vec::new();

    for dir_entry in fs::read_dir(wal_dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let name = file_name.to_string_lossy();

        if let Some(epoch) = parse_segment_filename(&name) {
            let metadata = match dir_entry.metadata() {
                Ok(metadata) => metadata,
                // Moved away (e.g. quarantined) between listing and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            segments.push(SegmentInfo {
                path: dir_entry.path(),
                epoch,
                file_size: metadata.len(),
            });
        }
    }

    segments.sort();

    debug!(
        count = segments.len(),
        dir = %wal_dir.display(),
        "Discovered WAL segments"
    );

    Ok(segments)
}

/// Returns `true` when appending a frame of `next_frame_size` bytes to an
/// active segment of `active_size` bytes would exceed `max_segment_size`.
///
/// An empty segment never rotates: a frame larger than the segment budget
/// gets a segment to itself instead of an endless chain of empty files.
pub fn should_rotate(active_size: u64, max_segment_size: u64, next_frame_size: u64) -> bool {
    active_size > 0 && active_size.saturating_add(next_frame_size) > max_segment_size
}

/// Fsync a directory so that file creations, renames and removals in it are
/// durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> WalResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> WalResult<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// SegmentAllocator
// ---------------------------------------------------------------------------

/// Owns the set of segment files in one log directory and decides which one
/// is active.
#[derive(Debug)]
pub struct SegmentAllocator {
    /// The directory containing all WAL segment files.
    wal_dir: PathBuf,

    /// The segment currently receiving appends.
    active: SegmentInfo,
}

impl SegmentAllocator {
    /// Open the allocator for `wal_dir`, creating the directory and the
    /// first segment if none exist. The newest existing segment becomes the
    /// active one.
    pub fn open(wal_dir: impl AsRef<Path>) -> WalResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();

        if !wal_dir.exists() {
            fs::create_dir_all(&wal_dir)?;
            info!(dir = %wal_dir.display(), "Created WAL directory");
        }

        let segments = list_segments(&wal_dir)?;
        let active = match segments.into_iter().last() {
            Some(last) => last,
            None => {
                let segment = create_segment(&wal_dir, FIRST_EPOCH)?;
                info!(segment = %segment.name(), "Initialized fresh WAL");
                segment
            }
        };

        Ok(Self { wal_dir, active })
    }

    /// The segment currently receiving appends.
    pub fn active(&self) -> &SegmentInfo {
        &self.active
    }

    /// Returns the path to the WAL directory.
    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Enumerate every segment on disk in creation order.
    pub fn segments(&self) -> WalResult<Vec<SegmentInfo>> {
        list_segments(&self.wal_dir)
    }

    /// Seal the active segment and create its successor.
    ///
    /// `outgoing` is the writer's summary of the active segment; it is
    /// stored with `sealed = true` before the new file exists, so any
    /// observer that can see the successor also sees a sealed predecessor.
    pub fn rotate(&mut self, outgoing: &mut SegmentIndex) -> WalResult<SegmentInfo> {
        outgoing.sealed = true;
        outgoing.store(&self.active.path)?;

        let next_epoch = self.active.epoch + 1;
        let next = create_segment(&self.wal_dir, next_epoch)?;

        info!(
            old_segment = %self.active.name(),
            new_segment = %next.name(),
            sealed_records = outgoing.record_count,
            "Rotated WAL segment"
        );

        self.active = next.clone();
        Ok(next)
    }
}

/// Create a brand new empty segment plus its unsealed sidecar. Fails if the
/// file already exists.
fn create_segment(wal_dir: &Path, epoch: u64) -> WalResult<SegmentInfo> {
    let path = segment_path(wal_dir, epoch);
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?
        .sync_all()?;
    SegmentIndex::new(epoch).store(&path)?;
    sync_dir(wal_dir)?;

    Ok(SegmentInfo {
        path,
        epoch,
        file_size: 0,
    })
}
