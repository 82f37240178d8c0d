// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Stream consumer contract
//
// A `StreamConsumer` rebuilds some other subsystem's state from the log. It
// must be idempotent by Lsn: a record at or below `last_applied_lsn()` is a
// no-op, so the same range may be replayed any number of times.

use crate::error::ConsumerError;
use crate::lsn::Lsn;

/// Applies log records, in Lsn order, to external state.
pub trait StreamConsumer {
    /// Apply `record`. A no-op when `lsn <= self.last_applied_lsn()`;
    /// otherwise applies it and advances `last_applied_lsn()` to `lsn`.
    fn consume(&mut self, lsn: Lsn, record: &[u8]) -> Result<(), ConsumerError>;

    /// Highest Lsn applied so far (`Lsn::ZERO` if none).
    fn last_applied_lsn(&self) -> Lsn;

    /// Called once after the last record of a replay.
    fn flush(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }
}

/// Turns a plain apply function into an idempotent [`StreamConsumer`].
pub struct IdempotentConsumer<F> {
    apply: F,
    last_applied: Lsn,
}

impl<F> IdempotentConsumer<F>
where
    F: FnMut(Lsn, &[u8]) -> Result<(), ConsumerError>,
{
    /// A consumer that has applied nothing yet.
    pub fn new(apply: F) -> Self {
        Self::resuming_after(Lsn::ZERO, apply)
    }

    /// A consumer whose state already reflects every record up to `last`,
    /// e.g. after loading a snapshot.
    pub fn resuming_after(last: Lsn, apply: F) -> Self {
        Self {
            apply,
            last_applied: last,
        }
    }
}

impl<F> StreamConsumer for IdempotentConsumer<F>
where
    F: FnMut(Lsn, &[u8]) -> Result<(), ConsumerError>,
{
    fn consume(&mut self, lsn: Lsn, record: &[u8]) -> Result<(), ConsumerError> {
        if lsn <= self.last_applied {
            return Ok(());
        }
        (self.apply)(lsn, record)?;
        self.last_applied = lsn;
        Ok(())
    }

    fn last_applied_lsn(&self) -> Lsn {
        self.last_applied
    }
}
