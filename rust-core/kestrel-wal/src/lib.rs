// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log (WAL) crate
//
// The durability layer of Kestrel ingestion. Every ingested event is framed
// and appended to the log before it is acknowledged, and the log is replayed
// in Lsn order to rebuild shard state after a restart. Payloads are opaque
// bytes; the log never interprets them.
//
// # Architecture
//
// A log directory holds a sequence of **segment files**
// (`wal_0000000001.segment`, ...). The newest is active and receives appends;
// older ones are sealed and immutable. Each segment may carry a JSON sidecar
// (`.idx`) summarising its Lsn range. Alongside them live the `write.lock`
// and `cleaner.lock` files, the `wal.watermark` file and the `.wal_trash/`
// quarantine root.
//
// ## On-disk frame format (all integers big-endian)
//
// ```text
// [4 bytes: MAGIC_START "WALS"]
// [1 byte:  version]              -- currently 1
// [4 bytes: frame_len (u32)]      -- header_len + payload length
// [2 bytes: header_len (u16)]     -- always 8 for version 1
// [8 bytes: lsn (u64)]
// [N bytes: payload]
// [4 bytes: MAGIC_END "WALE"]
// ```
//
// ## Usage
//
// ```no_run
// use kestrel_wal::{recover, LsnSupplier, TailPolicy, WalConfig, WalWriter};
//
// // Make the tail safe before attaching a writer.
// let outcome = recover("/tmp/kestrel-wal", TailPolicy::StrictTruncate).unwrap();
//
// let supplier = LsnSupplier::starting_after(outcome.highest_valid_lsn);
// let mut writer = WalWriter::open("/tmp/kestrel-wal", WalConfig::default(), supplier).unwrap();
// let receipt = writer.write(b"event").unwrap();
// println!("lsn={} bytes={}", receipt.lsn, receipt.bytes_written);
// writer.close().unwrap();
// ```

pub mod cleaner;
pub mod clock;
pub mod commit;
pub mod config;
pub mod consumer;
pub mod error;
pub mod frame;
pub mod index;
pub mod lock;
pub mod lsn;
pub mod reader;
pub mod recovery;
pub mod segment;
pub mod stream;
pub mod trash;
pub mod watermark;
pub mod writer;

// Re-export the primary public API for ergonomic imports.
pub use cleaner::{CleanerReport, CleanerTask, WalCleaner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit::{CommitContext, CommitListener};
pub use config::{CleanerConfig, ReplayOptions, SyncMode, WalConfig};
pub use consumer::{IdempotentConsumer, StreamConsumer};
pub use error::{ConsumerError, WalError, WalResult};
pub use frame::{serialize, Frame, MAX_PAYLOAD_BYTES};
pub use index::SegmentIndex;
pub use lock::{DirLock, LockInfo};
pub use lsn::{Lsn, LsnSupplier};
pub use recovery::{recover, RecoveryOutcome, TailPolicy};
pub use segment::{SegmentAllocator, SegmentInfo, DEFAULT_MAX_SEGMENT_SIZE};
pub use stream::{replay, ReplayOutcome};
pub use watermark::{FileWatermarkStore, WatermarkSource};
pub use writer::{WalWriter, WriteReceipt};
