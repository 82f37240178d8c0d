// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Commit notification
//
// Listeners registered on a `WalWriter` are called synchronously, on the
// writer's call path, after a frame has been appended and flushed according
// to the writer's `SyncMode`. They run inline with the write and must not
// block indefinitely.

use std::path::PathBuf;

use crate::lsn::Lsn;

/// Describes one successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitContext {
    /// Lsn assigned to the frame.
    pub lsn: Lsn,
    /// Epoch of the segment the frame landed in.
    pub segment_epoch: u64,
    /// Path of that segment.
    pub segment_path: PathBuf,
    /// Segment length before the frame was appended.
    pub offset_before: u64,
    /// Segment length after the frame was appended.
    pub offset_after: u64,
    /// Encoded size of the frame.
    pub bytes_written: u64,
}

/// Observer of durable appends.
pub trait CommitListener: Send + Sync {
    /// Called once per appended frame.
    fn on_commit(&self, ctx: &CommitContext);
}

impl<F> CommitListener for F
where
    F: Fn(&CommitContext) + Send + Sync,
{
    fn on_commit(&self, ctx: &CommitContext) {
        self(ctx)
    }
}
