//! Continuation snapshot binary format
//!
//! Layout:
//! - header: magic, version, endianness marker, capture timestamp
//! - tagged segments: `tag(u8) len(u32) payload`
//! - trailer: SHA-256 checksum over header and segments
//!
//! All integers are little-endian; the endianness marker makes a
//! byte-swapped reader fail loudly instead of misparsing.

use crate::scheduler::WakeSlot;
use sha2::{Digest, Sha256};
use std::io::Read;
use thiserror::Error;

/// Identifies a continuation snapshot
pub const MAGIC: [u8; 8] = *b"PLTCONT\0";

/// Current format version
pub const VERSION: u16 = 1;

/// Written as a u32; reads back scrambled under the wrong byte order
pub const ENDIAN_MARKER: u32 = 0x0102_0304;

const CHECKSUM_LEN: usize = 32;
const HEADER_LEN: usize = 8 + 2 + 4 + 8;

// Segment tags
pub(crate) const SEG_FLAGS: u8 = 1;
pub(crate) const SEG_STATE: u8 = 2;
pub(crate) const SEG_FRAME: u8 = 3;
pub(crate) const SEG_PENDING_EXC: u8 = 4;
pub(crate) const SEG_CHANNEL: u8 = 5;

/// Errors produced while sealing or opening a snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The bytes do not start with the snapshot magic
    #[error("not a continuation snapshot (bad magic)")]
    BadMagic,

    /// The snapshot was written by an incompatible format version
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    /// The endianness marker did not read back correctly
    #[error("snapshot endianness mismatch")]
    EndianMismatch,

    /// The trailer checksum does not match the content
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,

    /// The byte stream ended inside a header or segment
    #[error("snapshot truncated")]
    Truncated,

    /// A segment payload failed to parse
    #[error("malformed snapshot: {0}")]
    Malformed(&'static str),

    /// An underlying read or write failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append the snapshot header to a buffer under construction
pub(crate) fn write_header(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&ENDIAN_MARKER.to_le_bytes());
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    buf.extend_from_slice(&timestamp.to_le_bytes());
}

/// Append one tagged segment
pub(crate) fn write_segment(buf: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    buf.push(tag);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Append the checksum trailer, finishing the snapshot
pub(crate) fn seal(buf: &mut Vec<u8>) {
    let digest = Sha256::digest(&buf[..]);
    buf.extend_from_slice(&digest);
}

/// Verify checksum and header; returns the segment bytes
pub(crate) fn open(bytes: &[u8]) -> Result<&[u8], SnapshotError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(SnapshotError::Truncated);
    }
    let (content, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let digest = Sha256::digest(content);
    if digest.as_slice() != checksum {
        return Err(SnapshotError::ChecksumMismatch);
    }

    if content[0..8] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u16::from_le_bytes([content[8], content[9]]);
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let marker = u32::from_le_bytes([content[10], content[11], content[12], content[13]]);
    if marker != ENDIAN_MARKER {
        return Err(SnapshotError::EndianMismatch);
    }
    // Timestamp is informational; skip it.
    Ok(&content[HEADER_LEN..])
}

/// Iterate the tagged segments of an opened snapshot
pub(crate) fn segments(mut body: &[u8]) -> impl Iterator<Item = Result<(u8, Vec<u8>), SnapshotError>> + '_ {
    std::iter::from_fn(move || {
        if body.is_empty() {
            return None;
        }
        if body.len() < 5 {
            body = &[];
            return Some(Err(SnapshotError::Truncated));
        }
        let tag = body[0];
        let len = u32::from_le_bytes([body[1], body[2], body[3], body[4]]) as usize;
        if body.len() < 5 + len {
            body = &[];
            return Some(Err(SnapshotError::Truncated));
        }
        let payload = body[5..5 + len].to_vec();
        body = &body[5 + len..];
        Some(Ok((tag, payload)))
    })
}

/// Encode an in-flight channel payload
pub(crate) fn write_wake_slot(buf: &mut Vec<u8>, slot: &WakeSlot) -> std::io::Result<()> {
    match slot {
        WakeSlot::Value(value) => {
            buf.push(0);
            value.encode(buf)
        }
        WakeSlot::Exception(exc) => {
            buf.push(1);
            exc.encode(buf)
        }
        WakeSlot::Closed => {
            buf.push(2);
            Ok(())
        }
    }
}

/// Decode an in-flight channel payload
pub(crate) fn read_wake_slot(reader: &mut impl Read) -> Result<WakeSlot, SnapshotError> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    match tag[0] {
        0 => Ok(WakeSlot::Value(crate::value::Value::decode(reader)?)),
        1 => Ok(WakeSlot::Exception(crate::exception::Exc::decode(reader)?)),
        2 => Ok(WakeSlot::Closed),
        _ => Err(SnapshotError::Malformed("unknown payload tag")),
    }
}
