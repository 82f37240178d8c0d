// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Segment sidecar index
//
// Every segment `wal_XXXXXXXXXX.segment` may carry a JSON sidecar
// `wal_XXXXXXXXXX.segment.idx` summarising the frames it holds. The sidecar
// is an accelerator only: recovery rebuilds it from the frames themselves,
// and the cleaner falls back to scanning when it is missing or unsealed.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::WalResult;
use crate::lsn::Lsn;

/// Suffix appended to a segment file name to locate its sidecar.
pub const INDEX_SUFFIX: &str = ".idx";

/// Summary of the frames held by one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndex {
    /// Creation-order key parsed from the segment file name.
    pub epoch: u64,
    /// Lowest Lsn in the segment, if it holds any frame.
    pub min_lsn: Option<Lsn>,
    /// Highest Lsn in the segment, if it holds any frame.
    pub max_lsn: Option<Lsn>,
    /// Number of frames in the segment.
    pub record_count: u64,
    /// `true` once the segment has been rotated out.
    pub sealed: bool,
    /// When this sidecar was last written.
    pub updated_at: DateTime<Utc>,
}

impl SegmentIndex {
    /// An empty, unsealed index for the given epoch.
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            min_lsn: None,
            max_lsn: None,
            record_count: 0,
            sealed: false,
            updated_at: Utc::now(),
        }
    }

    /// Account for one more frame.
    pub fn record(&mut self, lsn: Lsn) {
        self.min_lsn = Some(self.min_lsn.map_or(lsn, |min| min.min(lsn)));
        self.max_lsn = Some(self.max_lsn.map_or(lsn, |max| max.max(lsn)));
        self.record_count += 1;
    }

    /// Load the sidecar for `segment_path`, or `None` if it does not exist
    /// or cannot be parsed.
    pub fn load(segment_path: &Path) -> WalResult<Option<Self>> {
        let path = index_path_for(segment_path);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(index) => Ok(Some(index)),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable segment sidecar"
                );
                Ok(None)
            }
        }
    }

    /// Write the sidecar for `segment_path` atomically (temp file + rename).
    pub fn store(&mut self, segment_path: &Path) -> WalResult<PathBuf> {
        self.updated_at = Utc::now();
        let path = index_path_for(segment_path);
        let tmp = tmp_path_for(&path);

        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(self)?)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// Path of the sidecar that belongs to `segment_path`.
pub fn index_path_for(segment_path: &Path) -> PathBuf {
    let mut name = segment_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(INDEX_SUFFIX);
    segment_path.with_file_name(name)
}

fn tmp_path_for(index_path: &Path) -> PathBuf {
    let mut name = index_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    index_path.with_file_name(name)
}
