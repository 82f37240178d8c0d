// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Kestrel Write-Ahead Log - Frame codec
//
// A frame is the unit of durability: one Lsn plus an opaque payload,
// bracketed by a leading and a trailing magic marker so a torn write is
// detectable even when the length field itself was damaged.
//
// On-disk binary format (all integers big-endian):
//   [4 bytes: MAGIC_START]   -- ASCII "WALS"
//   [1 byte:  VERSION]       -- 1
//   [4 bytes: FRAME_LEN]     -- HEADER_LEN + payload length
//   [2 bytes: HEADER_LEN]    -- 8 for version 1 (the Lsn)
//   [8 bytes: LSN]           -- unsigned
//   [N bytes: PAYLOAD]       -- FRAME_LEN - HEADER_LEN bytes
//   [4 bytes: MAGIC_END]     -- ASCII "WALE"

use crate::error::{WalError, WalResult};
use crate::lsn::Lsn;

/// Leading frame marker.
pub const MAGIC_START: [u8; 4] = *b"WALS";

/// Trailing frame marker.
pub const MAGIC_END: [u8; 4] = *b"WALE";

/// The only frame version this codec reads or writes.
pub const FRAME_VERSION: u8 = 1;

/// Header length for version 1: the 8-byte Lsn.
pub const HEADER_LEN: u16 = 8;

/// Maximum payload size: 16 MiB.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Bytes preceding the payload.
pub const PREFIX_LEN: usize = MAGIC_START.len() + 1 + 4 + 2 + HEADER_LEN as usize;

/// Size of a frame carrying an empty payload.
pub const MIN_FRAME_SIZE: usize = PREFIX_LEN + MAGIC_END.len();

/// Encoded size of a frame carrying `payload_len` bytes.
pub const fn encoded_len(payload_len: usize) -> usize {
    MIN_FRAME_SIZE + payload_len
}

/// Reject payloads over the frame maximum. No I/O has happened when this
/// fails.
pub fn check_payload_len(len: usize) -> WalResult<()> {
    if len > MAX_PAYLOAD_BYTES {
        return Err(WalError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// One fully validated log record.
///
/// Two frames are equal when their Lsn and payload are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    lsn: Lsn,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, rejecting oversized payloads.
    pub fn new(lsn: Lsn, payload: impl Into<Vec<u8>>) -> WalResult<Self> {
        let payload = payload.into();
        check_payload_len(payload.len())?;
        Ok(Self { lsn, payload })
    }

    /// The frame's sequence number.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// The opaque record bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Size of this frame on disk.
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.payload.len())
    }

    /// Encode this frame to its on-disk bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode_parts(self.lsn, &self.payload)
    }

    /// Decode exactly one frame from the start of `bytes`.
    ///
    /// Bytes after the trailing marker are ignored; use
    /// [`Frame::decode_prefix`] to learn how many were consumed.
    pub fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        Self::decode_prefix(bytes).map(|(frame, _)| frame)
    }

    /// Decode one frame from the start of `bytes`, returning it with the
    /// number of bytes it occupied.
    ///
    /// Either a fully validated frame is returned or `CorruptedRecord`; no
    /// partial payload is ever exposed.
    pub fn decode_prefix(bytes: &[u8]) -> WalResult<(Self, usize)> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(WalError::corrupted(format!(
                "frame too small: {} bytes, minimum {MIN_FRAME_SIZE}",
                bytes.len()
            )));
        }

        if bytes[0..4] != MAGIC_START {
            return Err(WalError::corrupted("invalid frame start magic"));
        }

        let version = bytes[4];
        if version != FRAME_VERSION {
            return Err(WalError::corrupted(format!(
                "unsupported frame version {version}"
            )));
        }

        let frame_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let header_len = u16::from_be_bytes([bytes[9], bytes[10]]);
        if header_len != HEADER_LEN {
            return Err(WalError::corrupted(format!(
                "unexpected header length {header_len}, expected {HEADER_LEN}"
            )));
        }

        let payload_len = frame_len
            .checked_sub(HEADER_LEN as usize)
            .ok_or_else(|| {
                WalError::corrupted(format!(
                    "frame length {frame_len} shorter than header length {HEADER_LEN}"
                ))
            })?;
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(WalError::corrupted(format!(
                "declared payload length {payload_len} exceeds maximum {MAX_PAYLOAD_BYTES}"
            )));
        }

        let total = encoded_len(payload_len);
        if bytes.len() < total {
            return Err(WalError::corrupted(format!(
                "truncated frame: need {total} bytes, have {}",
                bytes.len()
            )));
        }

        let mut lsn_bytes = [0u8; 8];
        lsn_bytes.copy_from_slice(&bytes[11..PREFIX_LEN]);
        let lsn = Lsn::new(u64::from_be_bytes(lsn_bytes));

        let payload_end = PREFIX_LEN + payload_len;
        if bytes[payload_end..total] != MAGIC_END {
            return Err(WalError::corrupted("invalid frame end magic"));
        }

        let frame = Self {
            lsn,
            payload: bytes[PREFIX_LEN..payload_end].to_vec(),
        };
        Ok((frame, total))
    }
}

/// Serialize `(lsn, payload)` without building a `Frame` first.
pub fn serialize(lsn: Lsn, payload: &[u8]) -> WalResult<Vec<u8>> {
    check_payload_len(payload.len())?;
    Ok(encode_parts(lsn, payload))
}

fn encode_parts(lsn: Lsn, payload: &[u8]) -> Vec<u8> {
    let frame_len = (HEADER_LEN as usize + payload.len()) as u32;
    let mut buffer = Vec::with_capacity(encoded_len(payload.len()));

    buffer.extend_from_slice(&MAGIC_START);
    buffer.push(FRAME_VERSION);
    buffer.extend_from_slice(&frame_len.to_be_bytes());
    buffer.extend_from_slice(&HEADER_LEN.to_be_bytes());
    buffer.extend_from_slice(&lsn.get().to_be_bytes());
    buffer.extend_from_slice(payload);
    buffer.extend_from_slice(&MAGIC_END);

    buffer
}
