// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Log sequence numbers
//
// An `Lsn` totally orders every frame appended to a log directory. The
// `LsnSupplier` hands out strictly increasing values and is shared by handle
// (clone) between producers rather than living in a global.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};

/// A log sequence number.
///
/// Lsn 0 is the logical start of the log and is never assigned to a frame;
/// the first frame written to a fresh log carries Lsn 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The logical start of the log, below every assigned Lsn.
    pub const ZERO: Lsn = Lsn(0);

    /// Wrap a raw sequence number.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw sequence number.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The next Lsn after this one, or `None` at `u64::MAX`.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl TryFrom<i64> for Lsn {
    type Error = WalError;

    fn try_from(value: i64) -> WalResult<Self> {
        u64::try_from(value)
            .map(Lsn)
            .map_err(|_| WalError::InvalidLsn(value))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread-safe generator of strictly increasing Lsns.
///
/// Cloning a supplier yields another handle onto the same counter, so every
/// producer sharing one writer draws from one sequence.
#[derive(Debug, Clone, Default)]
pub struct LsnSupplier {
    last: Arc<AtomicU64>,
}

impl LsnSupplier {
    /// A supplier whose first `next()` returns Lsn 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// A supplier that continues after `last`, e.g. the highest Lsn found
    /// on disk by recovery.
    pub fn starting_after(last: Lsn) -> Self {
        Self {
            last: Arc::new(AtomicU64::new(last.get())),
        }
    }

    /// Returns a fresh Lsn, strictly greater than every value previously
    /// returned by any handle onto this supplier.
    ///
    /// Fails with `LsnExhausted` once `u64::MAX` has been issued; the counter
    /// then stays put.
    pub fn next(&self) -> WalResult<Lsn> {
        self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| last.checked_add(1))
            .map(|previous| Lsn(previous + 1))
            .map_err(|last| WalError::LsnExhausted { last: Lsn(last) })
    }

    /// The most recently issued Lsn (`Lsn::ZERO` if none).
    pub fn current(&self) -> Lsn {
        Lsn(self.last.load(Ordering::Acquire))
    }

    /// Move the counter forward so the next value exceeds `floor`. Never
    /// moves it backward.
    pub fn advance_past(&self, floor: Lsn) {
        self.last.fetch_max(floor.get(), Ordering::AcqRel);
    }
}
