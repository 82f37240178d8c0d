// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Segment reader
//
// Reads one segment file and decodes its frames front to back. Decoding
// stops at the first frame that fails validation, or whose Lsn does not
// strictly exceed the previous one; nothing after that point is trusted
// even if it happens to parse. The caller decides what the stop means:
// recovery truncates or reports it, the writer refuses to open, replay
// stops delivering.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::error::{WalError, WalResult};
use crate::frame::Frame;
use crate::index::SegmentIndex;
use crate::lsn::Lsn;

// ---------------------------------------------------------------------------
// SegmentScan
// ---------------------------------------------------------------------------

/// The validated prefix of one segment.
#[derive(Debug)]
pub struct SegmentScan {
    /// Every frame that decoded cleanly, in file order.
    pub frames: Vec<Frame>,

    /// Byte offset just past the last valid frame.
    pub valid_end: u64,

    /// Number of bytes examined (the file length, or the read limit).
    pub scanned_len: u64,

    /// Why decoding stopped before `scanned_len`, if it did.
    pub failure: Option<WalError>,
}

impl SegmentScan {
    /// Returns `true` when every examined byte belongs to a valid frame.
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
    }

    /// Lsn of the last valid frame.
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.frames.last().map(Frame::lsn)
    }

    /// Build the sidecar summary of the valid frames.
    pub fn index(&self, epoch: u64, sealed: bool) -> SegmentIndex {
        let mut index = SegmentIndex::new(epoch);
        for frame in &self.frames {
            index.record(frame.lsn());
        }
        index.sealed = sealed;
        index
    }
}

// ---------------------------------------------------------------------------
// Reading helpers
// ---------------------------------------------------------------------------

/// Read and validate every frame of the segment at `path`.
///
/// `floor` is the Lsn of the frame preceding this segment (`Lsn::ZERO` at
/// the start of the log); the first frame must exceed it.
pub fn read_segment(path: &Path, floor: Lsn) -> WalResult<SegmentScan> {
    let data = std::fs::read(path)?;
    Ok(scan_bytes(path, &data, floor))
}

/// Like [`read_segment`] but never looks past the first `limit` bytes, so
/// frames appended after `limit` was captured are not observed.
pub fn read_segment_prefix(path: &Path, limit: u64, floor: Lsn) -> WalResult<SegmentScan> {
    let mut data = Vec::new();
    File::open(path)?.take(limit).read_to_end(&mut data)?;
    Ok(scan_bytes(path, &data, floor))
}

fn scan_bytes(path: &Path, data: &[u8], floor: Lsn) -> SegmentScan {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut previous = floor;
    let mut failure = None;

    while offset < data.len() {
        match Frame::decode_prefix(&data[offset..]) {
            Ok((frame, used)) => {
                if frame.lsn() <= previous {
                    failure = Some(WalError::corrupted(format!(
                        "LSN {} at offset {offset} does not follow LSN {previous}",
                        frame.lsn()
                    )));
                    break;
                }
                previous = frame.lsn();
                frames.push(frame);
                offset += used;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    debug!(
        segment = %path.display(),
        frames = frames.len(),
        valid_end = offset,
        clean = failure.is_none(),
        "Scanned WAL segment"
    );

    SegmentScan {
        frames,
        valid_end: offset as u64,
        scanned_len: data.len() as u64,
        failure,
    }
}
