// SPDX-License-Identifier: PMPL-1.0-or-later
//! Writer, cleaner and replay configuration.
//!
//! Defaults:
//! - max_segment_size: 64 MiB, sync_mode: fsync after every append
//! - keep_last_k: 1 sealed segment, grace: 30 minutes, interval: 60 seconds

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};
use crate::lsn::Lsn;
use crate::segment::DEFAULT_MAX_SEGMENT_SIZE;

/// Default grace period before quarantined segments are purged.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30 * 60);

/// Default pause between background cleaner passes.
pub const DEFAULT_CLEANER_INTERVAL: Duration = Duration::from_secs(60);

/// Controls how aggressively the writer forces appended bytes to stable
/// storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every write call. Commit listeners only ever observe
    /// durable frames.
    #[default]
    Fsync,

    /// `fsync` at most once per the given duration. Frames written between
    /// syncs may be lost on crash.
    Periodic(Duration),

    /// Never `fsync` explicitly; the OS page cache decides.
    Async,
}

/// Configuration for a [`WalWriter`](crate::writer::WalWriter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Segment size budget in bytes. A frame that would push the active
    /// segment past it goes to a fresh segment.
    pub max_segment_size: u64,
    /// Durability policy for appends.
    pub sync_mode: SyncMode,
}

impl WalConfig {
    /// Set the segment size budget.
    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Set the sync policy.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Reject settings the writer cannot honour.
    pub fn validate(&self) -> WalResult<()> {
        if self.max_segment_size == 0 {
            return Err(WalError::InvalidConfig(
                "max_segment_size must be greater than zero".to_string(),
            ));
        }
        if let SyncMode::Periodic(interval) = self.sync_mode {
            if interval.is_zero() {
                return Err(WalError::InvalidConfig(
                    "periodic sync interval must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            sync_mode: SyncMode::Fsync,
        }
    }
}

/// Configuration for a [`WalCleaner`](crate::cleaner::WalCleaner).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Number of most recent sealed segments retained regardless of the
    /// watermark.
    pub keep_last_k: usize,
    /// How long a trash batch lives before it is purged.
    pub grace: Duration,
    /// Report what would happen without moving or deleting anything.
    pub dry_run: bool,
    /// Pause between passes when run as a background task.
    pub interval: Duration,
}

impl CleanerConfig {
    /// Set the number of sealed segments always kept.
    pub fn with_keep_last_k(mut self, keep_last_k: usize) -> Self {
        self.keep_last_k = keep_last_k;
        self
    }

    /// Set the purge grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the background pass interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Reject settings the cleaner cannot honour.
    pub fn validate(&self) -> WalResult<()> {
        if self.interval.is_zero() {
            return Err(WalError::InvalidConfig(
                "cleaner interval must be greater than zero".to_string(),
            ));
        }
        if chrono::Duration::from_std(self.grace).is_err() {
            return Err(WalError::InvalidConfig(format!(
                "grace period {:?} is out of range",
                self.grace
            )));
        }
        Ok(())
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            keep_last_k: 1,
            grace: DEFAULT_GRACE,
            dry_run: false,
            interval: DEFAULT_CLEANER_INTERVAL,
        }
    }
}

/// Options for [`replay`](crate::stream::replay).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOptions {
    /// Deliver only records strictly after this Lsn. Combined with the
    /// consumer's own `last_applied_lsn`, whichever is higher wins.
    pub start_after: Lsn,
    /// Deliver nothing above this Lsn.
    pub up_to: Option<Lsn>,
    /// Use the persisted watermark as the upper bound (the lower of it and
    /// `up_to` when both are set).
    pub fence_to_watermark: bool,
    /// Run a truncating recovery pass before reading.
    pub run_recovery: bool,
    /// Fail the replay when a single `consume` call takes longer than this.
    pub consumer_timeout: Option<Duration>,
}

impl ReplayOptions {
    /// Deliver records after `lsn`.
    pub fn with_start_after(mut self, lsn: Lsn) -> Self {
        self.start_after = lsn;
        self
    }

    /// Deliver nothing above `lsn`.
    pub fn with_up_to(mut self, lsn: Lsn) -> Self {
        self.up_to = Some(lsn);
        self
    }

    /// Fence the replay at the persisted watermark.
    pub fn with_fence_to_watermark(mut self, fence: bool) -> Self {
        self.fence_to_watermark = fence;
        self
    }

    /// Run a truncating recovery pass first.
    pub fn with_recovery(mut self, run_recovery: bool) -> Self {
        self.run_recovery = run_recovery;
        self
    }

    /// Bound the time a single `consume` call may take.
    pub fn with_consumer_timeout(mut self, timeout: Duration) -> Self {
        self.consumer_timeout = Some(timeout);
        self
    }
}
