// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Spillover writer
//
// The `WalWriter` appends frames to the active segment, asking the segment
// allocator to roll over to a fresh segment whenever the next frame would
// push the active one past its size budget. Each append is flushed according
// to the configured `SyncMode` before any commit listener is told about it.
//
// Only one writer may attach to a log directory at a time; the `write.lock`
// file is taken on open and released on close.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::commit::{CommitContext, CommitListener};
use crate::config::{SyncMode, WalConfig};
use crate::error::{WalError, WalResult};
use crate::frame::{check_payload_len, encoded_len, serialize};
use crate::index::SegmentIndex;
use crate::lock::{DirLock, WRITER_ROLE};
use crate::lsn::{Lsn, LsnSupplier};
use crate::reader::read_segment;
use crate::segment::{should_rotate, SegmentAllocator, SegmentInfo};
use crate::watermark::FileWatermarkStore;

/// What a successful write produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Lsn assigned to the frame.
    pub lsn: Lsn,
    /// Encoded size of the frame on disk.
    pub bytes_written: u64,
}

// ---------------------------------------------------------------------------
// WalWriter
// ---------------------------------------------------------------------------

/// The single appender of one log directory.
pub struct WalWriter {
    /// Decides which segment is active and creates successors.
    allocator: SegmentAllocator,

    /// Append handle on the active segment.
    active_file: File,

    /// Bytes in the active segment.
    active_size: u64,

    /// Running summary of the active segment, written out as its sidecar.
    active_index: SegmentIndex,

    /// Source of Lsns, possibly shared with other producers.
    supplier: LsnSupplier,

    config: WalConfig,

    /// Observers notified after each durable append.
    listeners: Vec<Arc<dyn CommitListener>>,

    /// Timestamp of the last fsync (for `SyncMode::Periodic`).
    last_sync: Instant,

    /// Lsn of the most recent frame this writer appended.
    last_written: Option<Lsn>,

    /// Set once an append failed part way; the tail is then unknown and
    /// only recovery may decide what survives.
    poisoned: bool,

    /// Held for the writer's lifetime.
    lock: DirLock,
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("wal_dir", &self.allocator.wal_dir())
            .field("active", &self.allocator.active().path)
            .field("active_size", &self.active_size)
            .field("listeners", &self.listeners.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl WalWriter {
    /// Open `wal_dir` for appending, creating it and its first segment if
    /// necessary.
    ///
    /// Fails with `LockConflict` if another writer (or a crashed one) holds
    /// the directory, and with `DirtyTail` if the active segment does not
    /// end on a frame boundary; run recovery first in that case.
    ///
    /// The supplier is advanced past the highest Lsn on disk and past the
    /// persisted watermark, so Lsns never repeat or regress across restarts.
    pub fn open(
        wal_dir: impl AsRef<Path>,
        config: WalConfig,
        supplier: LsnSupplier,
    ) -> WalResult<Self> {
        config.validate()?;
        let wal_dir = wal_dir.as_ref();

        if !wal_dir.exists() {
            fs::create_dir_all(wal_dir)?;
            info!(dir = %wal_dir.display(), "Created WAL directory");
        }

        let lock = DirLock::acquire(wal_dir, WRITER_ROLE)?;
        let allocator = SegmentAllocator::open(wal_dir)?;
        let active = allocator.active().clone();

        let scan = read_segment(&active.path, Lsn::ZERO)?;
        if !scan.is_clean() || scan.valid_end != scan.scanned_len {
            error!(
                segment = %active.name(),
                valid_len = scan.valid_end,
                file_len = scan.scanned_len,
                "Refusing to append after an unrecovered tail"
            );
            return Err(WalError::DirtyTail {
                segment: active.path,
                valid_len: scan.valid_end,
                file_len: scan.scanned_len,
            });
        }

        let on_disk = match scan.last_lsn() {
            Some(lsn) => Some(lsn),
            None => last_lsn_before(&allocator, active.epoch)?,
        };
        if let Some(lsn) = on_disk {
            supplier.advance_past(lsn);
        }
        let watermark = FileWatermarkStore::new(wal_dir).load()?;
        if let Some(lsn) = watermark {
            supplier.advance_past(lsn);
        }

        let active_file = OpenOptions::new().append(true).open(&active.path)?;

        // A rotation interrupted after sealing may have left this segment's
        // sidecar marked sealed; the active segment is never sealed.
        let mut active_index = scan.index(active.epoch, false);
        active_index.store(&active.path)?;

        info!(
            segment = %active.name(),
            size = scan.valid_end,
            last_lsn = ?on_disk,
            watermark = ?watermark,
            last_issued = %supplier.current(),
            "Opened WAL writer"
        );

        Ok(Self {
            allocator,
            active_file,
            active_size: scan.valid_end,
            active_index,
            supplier,
            config,
            listeners: Vec::new(),
            last_sync: Instant::now(),
            last_written: None,
            poisoned: false,
            lock,
        })
    }

    /// Register a listener to be called after every durable append.
    pub fn add_listener(&mut self, listener: Arc<dyn CommitListener>) {
        self.listeners.push(listener);
    }

    /// Append one record.
    ///
    /// An oversized payload is rejected before an Lsn is drawn or any byte
    /// is written. Once an Lsn has been drawn it is consumed even if the
    /// append then fails, and the writer refuses further appends.
    pub fn write(&mut self, payload: &[u8]) -> WalResult<WriteReceipt> {
        check_payload_len(payload.len())?;
        self.check_usable()?;

        let lsn = self.supplier.next()?;
        let ctx = self.guard(|writer| {
            let ctx = writer.append_frame(lsn, payload)?;
            writer.flush()?;
            Ok(ctx)
        })?;

        let receipt = WriteReceipt {
            lsn,
            bytes_written: ctx.bytes_written,
        };
        self.notify(&ctx);
        Ok(receipt)
    }

    /// Append several records with a single flush.
    ///
    /// Every payload is size-checked before anything is written. Listeners
    /// fire once per frame, after the flush.
    pub fn write_batch<P: AsRef<[u8]>>(&mut self, payloads: &[P]) -> WalResult<Vec<WriteReceipt>> {
        for payload in payloads {
            check_payload_len(payload.as_ref().len())?;
        }
        self.check_usable()?;

        let lsns = payloads
            .iter()
            .map(|_| self.supplier.next())
            .collect::<WalResult<Vec<_>>>()?;

        let contexts = self.guard(|writer| {
            let mut contexts = Vec::with_capacity(payloads.len());
            for (lsn, payload) in lsns.into_iter().zip(payloads) {
                contexts.push(writer.append_frame(lsn, payload.as_ref())?);
            }
            writer.flush()?;
            Ok(contexts)
        })?;

        let receipts = contexts
            .iter()
            .map(|ctx| WriteReceipt {
                lsn: ctx.lsn,
                bytes_written: ctx.bytes_written,
            })
            .collect();
        for ctx in &contexts {
            self.notify(ctx);
        }
        Ok(receipts)
    }

    /// Force an immediate `fsync` of the active segment regardless of the
    /// configured `SyncMode`.
    pub fn sync(&mut self) -> WalResult<()> {
        self.active_file.sync_all()?;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Final flush, refresh the active segment's sidecar and release the
    /// directory lock.
    pub fn close(mut self) -> WalResult<()> {
        if !self.poisoned {
            self.sync()?;
            self.active_index.store(&self.allocator.active().path)?;
        }
        info!(
            segment = %self.allocator.active().name(),
            last_lsn = ?self.last_written,
            "Closed WAL writer"
        );
        self.lock.release()
    }

    /// Lsn of the last frame appended by this writer.
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_written
    }

    /// The supplier this writer draws Lsns from.
    pub fn supplier(&self) -> &LsnSupplier {
        &self.supplier
    }

    /// The segment currently receiving appends.
    pub fn active_segment(&self) -> SegmentInfo {
        SegmentInfo {
            file_size: self.active_size,
            ..self.allocator.active().clone()
        }
    }

    /// Returns the path to the WAL directory.
    pub fn wal_dir(&self) -> &Path {
        self.allocator.wal_dir()
    }

    /// Paths of every segment currently on disk, oldest first.
    pub fn segment_paths(&self) -> WalResult<Vec<PathBuf>> {
        Ok(self
            .allocator
            .segments()?
            .into_iter()
            .map(|segment| segment.path)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_usable(&self) -> WalResult<()> {
        if self.poisoned {
            return Err(WalError::Io(std::io::Error::other(
                "WAL writer is unusable after a failed append; reopen after recovery",
            )));
        }
        Ok(())
    }

    /// Run `op`, poisoning the writer if it fails.
    fn guard<T>(&mut self, op: impl FnOnce(&mut Self) -> WalResult<T>) -> WalResult<T> {
        let result = op(self);
        if let Err(e) = &result {
            self.poisoned = true;
            error!(
                segment = %self.allocator.active().name(),
                error = %e,
                "WAL append failed"
            );
        }
        result
    }

    fn append_frame(&mut self, lsn: Lsn, payload: &[u8]) -> WalResult<CommitContext> {
        let frame_len = encoded_len(payload.len()) as u64;
        if should_rotate(self.active_size, self.config.max_segment_size, frame_len) {
            self.rotate()?;
        }

        let bytes = serialize(lsn, payload)?;
        let offset_before = self.active_size;
        self.active_file.write_all(&bytes)?;
        self.active_size += frame_len;
        self.active_index.record(lsn);
        self.last_written = Some(lsn);

        let active = self.allocator.active();
        debug!(lsn = %lsn, segment = %active.name(), bytes = frame_len, "Appended WAL frame");

        Ok(CommitContext {
            lsn,
            segment_epoch: active.epoch,
            segment_path: active.path.clone(),
            offset_before,
            offset_after: self.active_size,
            bytes_written: frame_len,
        })
    }

    fn rotate(&mut self) -> WalResult<()> {
        self.sync()?;
        let next = self.allocator.rotate(&mut self.active_index)?;
        self.active_file = OpenOptions::new().append(true).open(&next.path)?;
        self.active_size = 0;
        self.active_index = SegmentIndex::new(next.epoch);
        Ok(())
    }

    /// Flush according to the configured `SyncMode`.
    fn flush(&mut self) -> WalResult<()> {
        match self.config.sync_mode {
            SyncMode::Fsync => self.sync(),
            SyncMode::Periodic(interval) => {
                if self.last_sync.elapsed() >= interval {
                    self.sync()
                } else {
                    Ok(())
                }
            }
            SyncMode::Async => Ok(()),
        }
    }

    fn notify(&self, ctx: &CommitContext) {
        for listener in &self.listeners {
            listener.on_commit(ctx);
        }
    }
}

/// Highest Lsn held by segments older than `epoch`, newest first. Sealed
/// sidecars are trusted; anything else is read.
fn last_lsn_before(allocator: &SegmentAllocator, epoch: u64) -> WalResult<Option<Lsn>> {
    let segments = allocator.segments()?;
    for segment in segments.iter().rev().filter(|s| s.epoch < epoch) {
        if let Some(index) = SegmentIndex::load(&segment.path)? {
            if index.sealed {
                if let Some(max) = index.max_lsn {
                    return Ok(Some(max));
                }
                if index.record_count == 0 {
                    continue;
                }
            }
        }
        if let Some(lsn) = read_segment(&segment.path, Lsn::ZERO)?.last_lsn() {
            return Ok(Some(lsn));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_PAYLOAD_BYTES;
    use crate::lock::lock_path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn open(dir: &Path) -> WalWriter {
        WalWriter::open(dir, WalConfig::default(), LsnSupplier::new()).unwrap()
    }

    #[test]
    fn test_write_assigns_increasing_lsns() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());

        let a = writer.write(b"first").unwrap();
        let b = writer.write(b"second").unwrap();
        assert_eq!(a.lsn, Lsn::new(1));
        assert_eq!(b.lsn, Lsn::new(2));
        assert_eq!(a.bytes_written, encoded_len(5) as u64);
        assert_eq!(writer.last_lsn(), Some(Lsn::new(2)));

        let active = writer.active_segment();
        writer.close().unwrap();

        let scan = read_segment(&active.path, Lsn::ZERO).unwrap();
        assert!(scan.is_clean());
        assert_eq!(scan.frames.len(), 2);
        assert_eq!(scan.frames[0].payload(), b"first");
    }

    #[test]
    fn test_oversized_payload_consumes_no_lsn() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());

        let too_big = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(
            writer.write(&too_big),
            Err(WalError::PayloadTooLarge { .. })
        ));
        assert_eq!(writer.active_segment().file_size, 0);
        assert_eq!(writer.write(b"ok").unwrap().lsn, Lsn::new(1));
    }

    #[test]
    fn test_listeners_fire_after_append() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        writer.add_listener(Arc::new(move |ctx: &CommitContext| {
            // The frame is already on disk when the listener runs.
            let len = fs::metadata(&ctx.segment_path).unwrap().len();
            assert!(len >= ctx.offset_after);
            sink.lock().unwrap().push(ctx.clone());
        }));

        writer.write(b"one").unwrap();
        writer.write(b"two").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].offset_before, 0);
        assert_eq!(seen[1].offset_before, seen[0].offset_after);
        assert_eq!(seen[1].lsn, Lsn::new(2));
    }

    #[test]
    fn test_rotation_spills_into_new_segment() {
        let dir = TempDir::new().unwrap();
        let frame = encoded_len(100) as u64;
        let config = WalConfig::default().with_max_segment_size(frame * 2);
        let mut writer = WalWriter::open(dir.path(), config, LsnSupplier::new()).unwrap();

        for _ in 0..5 {
            writer.write(&[7u8; 100]).unwrap();
        }
        let paths = writer.segment_paths().unwrap();
        assert_eq!(paths.len(), 3);
        assert_eq!(writer.active_segment().epoch, 3);

        let sealed = SegmentIndex::load(&paths[0]).unwrap().unwrap();
        assert!(sealed.sealed);
        assert_eq!(sealed.min_lsn, Some(Lsn::new(1)));
        assert_eq!(sealed.max_lsn, Some(Lsn::new(2)));
        for path in &paths[..2] {
            assert!(fs::metadata(path).unwrap().len() <= frame * 2);
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_frame_larger_than_segment_budget_gets_own_segment() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig::default().with_max_segment_size(16);
        let mut writer = WalWriter::open(dir.path(), config, LsnSupplier::new()).unwrap();

        writer.write(&[1u8; 64]).unwrap();
        writer.write(&[2u8; 64]).unwrap();
        assert_eq!(writer.segment_paths().unwrap().len(), 2);
    }

    #[test]
    fn test_write_batch() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        writer.add_listener(Arc::new(move |_: &CommitContext| {
            *sink.lock().unwrap() += 1;
        }));

        let receipts = writer
            .write_batch(&[b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]).unwrap();
        assert_eq!(
            receipts.iter().map(|r| r.lsn.get()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(*count.lock().unwrap(), 3);

        // One oversized payload rejects the whole batch before any write.
        let big = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        let before = writer.active_segment().file_size;
        assert!(writer.write_batch(&[vec![1u8], big]).is_err());
        assert_eq!(writer.active_segment().file_size, before);
        assert_eq!(writer.write(b"d").unwrap().lsn, Lsn::new(4));
    }

    #[test]
    fn test_single_writer_per_directory() {
        let dir = TempDir::new().unwrap();
        let writer = open(dir.path());

        assert!(matches!(
            WalWriter::open(dir.path(), WalConfig::default(), LsnSupplier::new()),
            Err(WalError::LockConflict { .. })
        ));

        writer.close().unwrap();
        assert!(!lock_path(dir.path(), WRITER_ROLE).exists());
        open(dir.path()).close().unwrap();
    }

    #[test]
    fn test_reopen_continues_lsn_sequence() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());
        writer.write(b"a").unwrap();
        writer.write(b"b").unwrap();
        writer.close().unwrap();

        let mut writer = open(dir.path());
        assert_eq!(writer.write(b"c").unwrap().lsn, Lsn::new(3));
        writer.close().unwrap();
    }

    #[test]
    fn test_reopen_on_fresh_segment_scans_older_ones() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig::default().with_max_segment_size(encoded_len(8) as u64);
        let mut writer = WalWriter::open(dir.path(), config.clone(), LsnSupplier::new()).unwrap();
        writer.write(&[0u8; 8]).unwrap();
        writer.write(&[0u8; 8]).unwrap();
        writer.close().unwrap();

        // Force an empty active segment on top of the written ones.
        let mut allocator = SegmentAllocator::open(dir.path()).unwrap();
        let mut index = SegmentIndex::load(&allocator.active().path).unwrap().unwrap();
        allocator.rotate(&mut index).unwrap();

        let mut writer = WalWriter::open(dir.path(), config, LsnSupplier::new()).unwrap();
        assert_eq!(writer.write(&[0u8; 8]).unwrap().lsn, Lsn::new(3));
    }

    #[test]
    fn test_open_advances_past_watermark() {
        let dir = TempDir::new().unwrap();
        FileWatermarkStore::new(dir.path())
            .persist(Lsn::new(500))
            .unwrap();

        let mut writer = open(dir.path());
        assert_eq!(writer.write(b"x").unwrap().lsn, Lsn::new(501));
    }

    #[test]
    fn test_open_refuses_dirty_tail() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());
        writer.write(b"good").unwrap();
        let path = writer.active_segment().path;
        writer.close().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(b"WALS\x01garbage");
        fs::write(&path, &bytes).unwrap();

        match WalWriter::open(dir.path(), WalConfig::default(), LsnSupplier::new()) {
            Err(WalError::DirtyTail {
                valid_len, file_len, ..
            }) => {
                assert_eq!(valid_len, encoded_len(4) as u64);
                assert_eq!(file_len, bytes.len() as u64);
            }
            other => panic!("Expected DirtyTail, got: {other:?}"),
        }
        // The failed open did not leave the lock behind.
        assert!(!lock_path(dir.path(), WRITER_ROLE).exists());
    }

    #[test]
    fn test_shared_supplier_across_threads() {
        let dir = TempDir::new().unwrap();
        let supplier = LsnSupplier::new();
        let writer = WalWriter::open(dir.path(), WalConfig::default(), supplier.clone()).unwrap();
        let writer = Arc::new(Mutex::new(writer));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let payload = format!("t{t}-{i}");
                        writer.lock().unwrap().write(payload.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(supplier.current(), Lsn::new(100));
        let writer = Arc::try_unwrap(writer).unwrap().into_inner().unwrap();
        let active = writer.active_segment();
        writer.close().unwrap();

        let scan = read_segment(&active.path, Lsn::ZERO).unwrap();
        assert!(scan.is_clean());
        assert_eq!(scan.frames.len(), 100);
    }

    #[test]
    fn test_open_unseals_stale_active_sidecar() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());
        writer.write(b"a").unwrap();
        writer.write(b"b").unwrap();
        let path = writer.active_segment().path;
        writer.close().unwrap();

        // What a rotation leaves behind when it dies after sealing.
        let mut index = SegmentIndex::load(&path).unwrap().unwrap();
        index.sealed = true;
        index.store(&path).unwrap();

        let mut writer = open(dir.path());
        let index = SegmentIndex::load(&path).unwrap().unwrap();
        assert!(!index.sealed);
        assert_eq!(index.max_lsn, Some(Lsn::new(2)));

        assert_eq!(writer.write(b"c").unwrap().lsn, Lsn::new(3));
        writer.close().unwrap();
    }

    #[test]
    fn test_exhausted_supplier_fails_without_writing() {
        let dir = TempDir::new().unwrap();
        let supplier = LsnSupplier::starting_after(Lsn::new(u64::MAX - 1));
        let mut writer = WalWriter::open(dir.path(), WalConfig::default(), supplier).unwrap();

        assert_eq!(writer.write(b"last").unwrap().lsn, Lsn::new(u64::MAX));
        let size = writer.active_segment().file_size;
        assert!(matches!(writer.write(b"more"), Err(WalError::LsnExhausted { .. })));
        assert!(matches!(
            writer.write_batch(&[b"x".to_vec()]),
            Err(WalError::LsnExhausted { .. })
        ));
        assert_eq!(writer.active_segment().file_size, size);
        writer.close().unwrap();

        // Reopening on a log that ends at u64::MAX still works.
        let writer = open(dir.path());
        assert_eq!(writer.supplier().current(), Lsn::new(u64::MAX));
        writer.close().unwrap();
    }

    #[test]
    fn test_close_refreshes_sidecar() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(dir.path());
        writer.write(b"a").unwrap();
        writer.write(b"b").unwrap();
        let path = writer.active_segment().path;
        writer.close().unwrap();

        let index = SegmentIndex::load(&path).unwrap().unwrap();
        assert!(!index.sealed);
        assert_eq!(index.record_count, 2);
        assert_eq!(index.max_lsn, Some(Lsn::new(2)));
    }

    #[test]
    fn test_sync_modes() {
        for mode in [
            SyncMode::Async,
            SyncMode::Periodic(std::time::Duration::from_millis(10)),
        ] {
            let dir = TempDir::new().unwrap();
            let config = WalConfig::default().with_sync_mode(mode);
            let mut writer = WalWriter::open(dir.path(), config, LsnSupplier::new()).unwrap();
            writer.write(b"x").unwrap();
            writer.sync().unwrap();
            writer.close().unwrap();
        }
    }
}
