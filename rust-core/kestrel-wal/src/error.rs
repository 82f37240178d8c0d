// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Error types
//
// Defines all error conditions that can arise during WAL operations: caller
// errors (oversized payloads, negative sequence numbers), storage faults,
// corruption found while reading pre-existing bytes, and lock ownership
// conflicts on a log directory.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lock::LockInfo;
use crate::lsn::Lsn;

/// Boxed error type returned by `StreamConsumer` implementations.
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// A frame failed validation: bad magic, unsupported version, length
    /// fields that disagree with the bytes present, or a missing end marker.
    ///
    /// Only produced while reading bytes that already exist on disk. The
    /// writer never produces an invalid frame.
    #[error("corrupted WAL record: {reason}")]
    CorruptedRecord {
        /// What the decoder tripped over.
        reason: String,
    },

    /// The payload exceeds the per-frame maximum. Raised before any I/O.
    #[error("payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// The maximum allowed payload size.
        max: usize,
    },

    /// A sequence number could not be represented as an Lsn.
    #[error("invalid LSN: {0}")]
    InvalidLsn(i64),

    /// The Lsn space is used up; no value above `last` exists.
    #[error("LSN space exhausted after {last}")]
    LsnExhausted {
        /// The highest Lsn already issued or found on disk.
        last: Lsn,
    },

    /// An I/O error occurred while reading or writing WAL files.
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another owner already holds the lock on the log directory.
    #[error("lock {} is already held{}", .path.display(), describe_holder(.holder))]
    LockConflict {
        /// Path of the lock file.
        path: PathBuf,
        /// Metadata of the current holder, when the lock file is readable.
        holder: Option<LockInfo>,
    },

    /// A lock release was attempted by a handle that no longer owns it.
    #[error("lock {} is not held by this owner", .path.display())]
    LockNotHeld {
        /// Path of the lock file.
        path: PathBuf,
    },

    /// The active segment ends in bytes that are not a complete frame.
    /// Recovery must run before a writer may attach.
    #[error(
        "segment {} has an unrecovered tail: {valid_len} valid bytes of {file_len}",
        .segment.display()
    )]
    DirtyTail {
        /// The segment with the torn tail.
        segment: PathBuf,
        /// Offset of the last frame boundary.
        valid_len: u64,
        /// Actual file length.
        file_len: u64,
    },

    /// The WAL directory does not exist or is not accessible.
    #[error("WAL directory not found or inaccessible: {0}")]
    DirectoryNotFound(String),

    /// JSON serialization or deserialization failed for sidecar or lock
    /// metadata.
    #[error("JSON error in WAL metadata: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration value was rejected.
    #[error("invalid WAL configuration: {0}")]
    InvalidConfig(String),

    /// A stream consumer failed while applying a record.
    #[error("consumer failed at LSN {lsn}: {source}")]
    Consumer {
        /// The record being applied.
        lsn: Lsn,
        /// The consumer's error.
        #[source]
        source: ConsumerError,
    },

    /// A stream consumer took longer than the replay timeout on one record.
    #[error("consumer exceeded timeout at LSN {lsn} after {elapsed:?}")]
    ConsumerTimeout {
        /// The record being applied.
        lsn: Lsn,
        /// How long the consume call took.
        elapsed: Duration,
    },
}

impl WalError {
    /// Shorthand for building a `CorruptedRecord` error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::CorruptedRecord {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that describe unreadable on-disk bytes.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptedRecord { .. })
    }
}

fn describe_holder(holder: &Option<LockInfo>) -> String {
    match holder {
        Some(info) => format!(
            " by {} (role={}, pid={}, since {})",
            info.owner, info.role, info.pid, info.acquired_at
        ),
        None => String::new(),
    }
}

/// Convenience type alias for WAL results.
pub type WalResult<T> = Result<T, WalError>;
