// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Watermark persistence
//
// The watermark is the highest Lsn known to be durably reflected outside the
// log (for example in a snapshot of derived state). It gates what the
// cleaner may discard and keeps a restarted writer from reissuing Lsns.
//
// On-disk layout of `wal.watermark` (12 bytes):
//
//   [8 bytes: LSN (big-endian u64)]
//   [4 bytes: CRC32 of the LSN bytes (big-endian)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{WalError, WalResult};
use crate::lsn::Lsn;
use crate::segment::sync_dir;

/// File name of the persisted watermark inside a log directory.
pub const WATERMARK_FILE: &str = "wal.watermark";

const WATERMARK_LEN: usize = 12;

/// Read-only view of the current watermark, as consumed by the cleaner and
/// replay.
pub trait WatermarkSource: Send + Sync {
    /// The latest persisted watermark, or `None` if none has been recorded.
    fn watermark(&self) -> WalResult<Option<Lsn>>;
}

impl<F> WatermarkSource for F
where
    F: Fn() -> WalResult<Option<Lsn>> + Send + Sync,
{
    fn watermark(&self) -> WalResult<Option<Lsn>> {
        self()
    }
}

/// Stores the watermark as a checksummed file in the log directory.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    /// A store for the watermark of the log in `wal_dir`.
    pub fn new(wal_dir: impl AsRef<Path>) -> Self {
        Self {
            path: wal_dir.as_ref().join(WATERMARK_FILE),
        }
    }

    /// Path of the watermark file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted watermark.
    ///
    /// Returns `None` if nothing has been persisted yet and
    /// `CorruptedRecord` if the file fails its checksum.
    pub fn load(&self) -> WalResult<Option<Lsn>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode(&bytes).map(Some).inspect_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Unreadable watermark file");
        })
    }

    /// Persist `lsn` as the new watermark and return the value now stored.
    ///
    /// The watermark never regresses: if a higher value is already on disk
    /// it is kept and returned.
    pub fn persist(&self, lsn: Lsn) -> WalResult<Lsn> {
        if let Some(current) = self.load()? {
            if current >= lsn {
                debug!(requested = %lsn, stored = %current, "Watermark not lowered");
                return Ok(current);
            }
        }

        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp)?;
        file.write_all(&encode(lsn))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        debug!(watermark = %lsn, "Persisted watermark");
        Ok(lsn)
    }
}

impl WatermarkSource for FileWatermarkStore {
    fn watermark(&self) -> WalResult<Option<Lsn>> {
        self.load()
    }
}

fn encode(lsn: Lsn) -> [u8; WATERMARK_LEN] {
    let lsn_bytes = lsn.get().to_be_bytes();
    let crc = crc32fast::hash(&lsn_bytes);

    let mut buf = [0u8; WATERMARK_LEN];
    buf[..8].copy_from_slice(&lsn_bytes);
    buf[8..].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn decode(bytes: &[u8]) -> WalResult<Lsn> {
    if bytes.len() != WATERMARK_LEN {
        return Err(WalError::corrupted(format!(
            "watermark file is {} bytes, expected {WATERMARK_LEN}",
            bytes.len()
        )));
    }

    let mut lsn_bytes = [0u8; 8];
    lsn_bytes.copy_from_slice(&bytes[..8]);
    let stored_crc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let computed_crc = crc32fast::hash(&lsn_bytes);

    if stored_crc != computed_crc {
        return Err(WalError::corrupted(format!(
            "watermark CRC mismatch: stored={stored_crc:#010x}, computed={computed_crc:#010x}"
        )));
    }

    Ok(Lsn::new(u64::from_be_bytes(lsn_bytes)))
}
