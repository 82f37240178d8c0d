// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Replay into a stream consumer
//
// `replay` hands validated frames, in Lsn order, to a `StreamConsumer`.
// Segment sizes are captured before reading starts, so frames a live writer
// appends during the replay are not observed. Replay stops at the first
// frame that fails validation; it never skips over a gap.

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ReplayOptions;
use crate::consumer::StreamConsumer;
use crate::error::{WalError, WalResult};
use crate::index::SegmentIndex;
use crate::lsn::Lsn;
use crate::reader::read_segment_prefix;
use crate::recovery::{recover, TailPolicy};
use crate::segment::list_segments;
use crate::watermark::FileWatermarkStore;

/// Summary of one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Records handed to the consumer.
    pub delivered: u64,
    /// Lsn of the last record handed to the consumer.
    pub last_delivered_lsn: Option<Lsn>,
    /// Segments whose frames were read.
    pub segments_visited: usize,
    /// Sealed segments skipped on the strength of their sidecar.
    pub segments_skipped: usize,
    /// `true` if reading stopped at an undecodable frame.
    pub stopped_at_corruption: bool,
}

/// Replay the log in `wal_dir` into `consumer`.
///
/// Records at or below `max(options.start_after, consumer.last_applied_lsn())`
/// are not delivered; nor is anything above `options.up_to` or, when
/// `options.fence_to_watermark` is set, above the persisted watermark. A
/// consumer error stops the replay and is returned as `WalError::Consumer`.
pub fn replay<C>(
    wal_dir: impl AsRef<Path>,
    consumer: &mut C,
    options: &ReplayOptions,
) -> WalResult<ReplayOutcome>
where
    C: StreamConsumer + ?Sized,
{
    let wal_dir = wal_dir.as_ref();

    if options.run_recovery {
        recover(wal_dir, TailPolicy::StrictTruncate)?;
    }

    let mut upper = options.up_to;
    if options.fence_to_watermark {
        let watermark = FileWatermarkStore::new(wal_dir).load()?.unwrap_or(Lsn::ZERO);
        upper = Some(upper.map_or(watermark, |up_to| up_to.min(watermark)));
    }
    let resume_after = options.start_after.max(consumer.last_applied_lsn());

    // Sizes captured here are the read fence.
    let segments = list_segments(wal_dir)?;

    debug!(
        dir = %wal_dir.display(),
        segments = segments.len(),
        resume_after = %resume_after,
        upper = ?upper,
        "Starting WAL replay"
    );

    let mut outcome = ReplayOutcome::default();
    let mut previous = Lsn::ZERO;

    let last_position = segments.len().saturating_sub(1);

    'segments: for (position, segment) in segments.iter().enumerate() {
        // The newest segment may still receive appends, whatever its sidecar
        // claims, so it is always read.
        let trusted = if position < last_position {
            SegmentIndex::load(&segment.path)?
        } else {
            None
        };
        if let Some(index) = trusted {
            if index.sealed {
                if index.max_lsn.map_or(true, |max| max <= resume_after) {
                    if let Some(max) = index.max_lsn {
                        previous = previous.max(max);
                    }
                    outcome.segments_skipped += 1;
                    continue;
                }
                if let (Some(min), Some(upper)) = (index.min_lsn, upper) {
                    if min > upper {
                        break;
                    }
                }
            }
        }

        let scan = read_segment_prefix(&segment.path, segment.file_size, previous)?;
        outcome.segments_visited += 1;

        for frame in &scan.frames {
            if upper.is_some_and(|upper| frame.lsn() > upper) {
                break 'segments;
            }
            if frame.lsn() <= resume_after {
                continue;
            }
            deliver(consumer, frame.lsn(), frame.payload(), options)?;
            outcome.delivered += 1;
            outcome.last_delivered_lsn = Some(frame.lsn());
        }

        if let Some(last) = scan.last_lsn() {
            previous = last;
        }
        if let Some(failure) = &scan.failure {
            warn!(
                segment = %segment.name(),
                offset = scan.valid_end,
                reason = %failure,
                "Replay stopped at undecodable frame"
            );
            outcome.stopped_at_corruption = true;
            break;
        }
    }

    consumer.flush().map_err(|source| WalError::Consumer {
        lsn: outcome.last_delivered_lsn.unwrap_or(resume_after),
        source,
    })?;

    info!(
        dir = %wal_dir.display(),
        delivered = outcome.delivered,
        last_lsn = ?outcome.last_delivered_lsn,
        visited = outcome.segments_visited,
        skipped = outcome.segments_skipped,
        "WAL replay complete"
    );

    Ok(outcome)
}

fn deliver<C>(consumer: &mut C, lsn: Lsn, record: &[u8], options: &ReplayOptions) -> WalResult<()>
where
    C: StreamConsumer + ?Sized,
{
    let started = Instant::now();
    consumer
        .consume(lsn, record)
        .map_err(|source| WalError::Consumer { lsn, source })?;

    if let Some(timeout) = options.consumer_timeout {
        let elapsed = started.elapsed();
        if elapsed > timeout {
            warn!(lsn = %lsn, elapsed = ?elapsed, "Consumer fell behind replay");
            return Err(WalError::ConsumerTimeout { lsn, elapsed });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use crate::consumer::IdempotentConsumer;
    use crate::error::ConsumerError;
    use crate::frame::encoded_len;
    use crate::lsn::LsnSupplier;
    use crate::writer::WalWriter;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Collector {
        seen: Vec<(Lsn, Vec<u8>)>,
        last: Lsn,
        flushed: usize,
    }

    impl Collector {
        fn new() -> Self {
            Self {
                seen: Vec::new(),
                last: Lsn::ZERO,
                flushed: 0,
            }
        }
    }

    impl StreamConsumer for Collector {
        fn consume(&mut self, lsn: Lsn, record: &[u8]) -> Result<(), ConsumerError> {
            if lsn <= self.last {
                return Ok(());
            }
            self.seen.push((lsn, record.to_vec()));
            self.last = lsn;
            Ok(())
        }

        fn last_applied_lsn(&self) -> Lsn {
            self.last
        }

        fn flush(&mut self) -> Result<(), ConsumerError> {
            self.flushed += 1;
            Ok(())
        }
    }

    fn populate(dir: &Path, count: usize, max_segment_size: u64) {
        let config = WalConfig::default().with_max_segment_size(max_segment_size);
        let mut writer = WalWriter::open(dir, config, LsnSupplier::new()).unwrap();
        for i in 0..count {
            writer.write(format!("record-{i:03}").as_bytes()).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_replay_everything_in_order() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 10, encoded_len(10) as u64 * 3);

        let mut consumer = Collector::new();
        let outcome = replay(dir.path(), &mut consumer, &ReplayOptions::default()).unwrap();

        assert_eq!(outcome.delivered, 10);
        assert_eq!(outcome.last_delivered_lsn, Some(Lsn::new(10)));
        assert_eq!(outcome.segments_visited, 4);
        assert_eq!(consumer.flushed, 1);
        assert_eq!(consumer.seen[0].1, b"record-000");
        assert!(consumer.seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_replay_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 5, 1024);

        let mut consumer = Collector::new();
        replay(dir.path(), &mut consumer, &ReplayOptions::default()).unwrap();
        let again = replay(dir.path(), &mut consumer, &ReplayOptions::default()).unwrap();

        assert_eq!(again.delivered, 0);
        assert_eq!(consumer.seen.len(), 5);
    }

    #[test]
    fn test_start_after_skips_sealed_segments() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 9, encoded_len(10) as u64 * 3);

        let mut consumer = Collector::new();
        let options = ReplayOptions::default().with_start_after(Lsn::new(6));
        let outcome = replay(dir.path(), &mut consumer, &options).unwrap();

        assert_eq!(outcome.segments_skipped, 2);
        assert_eq!(outcome.delivered, 3);
        assert_eq!(consumer.seen[0].0, Lsn::new(7));
    }

    #[test]
    fn test_sealed_sidecar_on_newest_segment_is_not_trusted() {
        let dir = TempDir::new().unwrap();
        let mut writer = WalWriter::open(dir.path(), WalConfig::default(), LsnSupplier::new()).unwrap();
        for payload in [b"one", b"two", b"six", b"ten"] {
            writer.write(payload).unwrap();
        }
        let path = writer.active_segment().path;
        std::mem::forget(writer);

        // Sidecar left sealed at Lsn 2 by an interrupted rotation.
        let mut index = SegmentIndex::new(1);
        index.record(Lsn::new(1));
        index.record(Lsn::new(2));
        index.sealed = true;
        index.store(&path).unwrap();

        let mut consumer = Collector::new();
        consumer.last = Lsn::new(2);
        let outcome = replay(dir.path(), &mut consumer, &ReplayOptions::default()).unwrap();

        assert_eq!(outcome.segments_skipped, 0);
        assert_eq!(outcome.delivered, 2);
        let lsns: Vec<Lsn> = consumer.seen.iter().map(|(lsn, _)| *lsn).collect();
        assert_eq!(lsns, vec![Lsn::new(3), Lsn::new(4)]);
    }

    #[test]
    fn test_start_after_reads_unsealed_active_segment() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig::default().with_max_segment_size(encoded_len(10) as u64 * 3);
        let mut writer = WalWriter::open(dir.path(), config, LsnSupplier::new()).unwrap();
        for i in 0..8 {
            writer.write(format!("record-{i:03}").as_bytes()).unwrap();
        }

        let mut consumer = Collector::new();
        let options = ReplayOptions::default().with_start_after(Lsn::new(6));
        let outcome = replay(dir.path(), &mut consumer, &options).unwrap();
        assert_eq!(outcome.segments_skipped, 2);
        assert_eq!(outcome.segments_visited, 1);
        assert_eq!(outcome.last_delivered_lsn, Some(Lsn::new(8)));

        // The next pass over the live segment picks up only the new frame.
        writer.write(b"record-008").unwrap();
        let outcome = replay(dir.path(), &mut consumer, &options).unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(consumer.last, Lsn::new(9));
        writer.close().unwrap();
    }

    #[test]
    fn test_up_to_stops_before_reading_later_sealed_segments() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 9, encoded_len(10) as u64 * 3);

        let mut consumer = Collector::new();
        let options = ReplayOptions::default().with_up_to(Lsn::new(3));
        let outcome = replay(dir.path(), &mut consumer, &options).unwrap();

        assert_eq!(outcome.delivered, 3);
        assert_eq!(outcome.segments_visited, 1);
    }

    #[test]
    fn test_up_to_and_watermark_fence() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 8, 4096);

        let mut consumer = Collector::new();
        let options = ReplayOptions::default().with_up_to(Lsn::new(5));
        assert_eq!(replay(dir.path(), &mut consumer, &options).unwrap().delivered, 5);

        FileWatermarkStore::new(dir.path())
            .persist(Lsn::new(3))
            .unwrap();
        let mut consumer = Collector::new();
        let options = ReplayOptions::default().with_fence_to_watermark(true);
        let outcome = replay(dir.path(), &mut consumer, &options).unwrap();
        assert_eq!(outcome.last_delivered_lsn, Some(Lsn::new(3)));
    }

    #[test]
    fn test_replay_stops_at_corruption() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 4, 4096);
        let segment = list_segments(dir.path()).unwrap().pop().unwrap();
        let mut bytes = fs::read(&segment.path).unwrap();
        // Break the end marker of the third frame.
        let third_end = encoded_len(10) * 3 - 1;
        bytes[third_end] ^= 0xFF;
        fs::write(&segment.path, &bytes).unwrap();

        let mut consumer = Collector::new();
        let outcome = replay(dir.path(), &mut consumer, &ReplayOptions::default()).unwrap();
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.stopped_at_corruption);
    }

    #[test]
    fn test_replay_with_recovery_truncates_first() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 3, 4096);
        let segment = list_segments(dir.path()).unwrap().pop().unwrap();
        let mut bytes = fs::read(&segment.path).unwrap();
        bytes.extend_from_slice(b"WALS");
        fs::write(&segment.path, &bytes).unwrap();

        let mut consumer = Collector::new();
        let options = ReplayOptions::default().with_recovery(true);
        let outcome = replay(dir.path(), &mut consumer, &options).unwrap();
        assert_eq!(outcome.delivered, 3);
        assert!(!outcome.stopped_at_corruption);
        assert_eq!(
            fs::metadata(&segment.path).unwrap().len(),
            encoded_len(10) as u64 * 3
        );
    }

    #[test]
    fn test_consumer_error_is_wrapped() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 3, 4096);

        let mut consumer =
            IdempotentConsumer::new(|lsn: Lsn, _: &[u8]| -> Result<(), ConsumerError> {
                if lsn == Lsn::new(2) {
                    Err("downstream unavailable".into())
                } else {
                    Ok(())
                }
            });
        match replay(dir.path(), &mut consumer, &ReplayOptions::default()) {
            Err(WalError::Consumer { lsn, .. }) => assert_eq!(lsn, Lsn::new(2)),
            other => panic!("Expected Consumer error, got: {other:?}"),
        }
        assert_eq!(consumer.last_applied_lsn(), Lsn::new(1));
    }

    #[test]
    fn test_slow_consumer_times_out() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), 2, 4096);

        let mut consumer =
            IdempotentConsumer::new(|_: Lsn, _: &[u8]| -> Result<(), ConsumerError> {
                std::thread::sleep(Duration::from_millis(30));
                Ok(())
            });
        let options = ReplayOptions::default().with_consumer_timeout(Duration::from_millis(1));
        assert!(matches!(
            replay(dir.path(), &mut consumer, &options),
            Err(WalError::ConsumerTimeout { .. })
        ));
    }
}
