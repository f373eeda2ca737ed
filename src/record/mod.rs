//! # On-disk record types
//!
//! Two record types make up the store:
//!
//! - [`BlockRecord`]: one per block, appended to the current data segment.
//! - [`IndexRecord`]: fixed-width (52 bytes) metadata entry locating one
//!   `BlockRecord`, appended to the single index file.
//!
//! ## Block record layout
//!
//! ```text
//! [height: u32 LE][hash: 32 bytes][compression: u8][payload_len: CompactSize][payload]
//! ```
//!
//! ## Index record layout
//!
//! ```text
//! [height: u32][hash: 32 bytes][payload_size: u32][segment_tag: u32][start: u32][end: u32]
//! ```
//!
//! `end - start` always equals the full encoded size of the block record
//! (header + length prefix + payload), not just `payload_size`.


mod encoding_impls;

use std::fmt;
use std::str::FromStr;

use crate::encoding::CompactSize;

/// Size of the fixed part of a [`BlockRecord`]: height + hash + compression tag.
pub const BLOCK_HEADER_SIZE: usize = 4 + BlockHash::LEN + 1;

/// Size of one encoded [`IndexRecord`].
pub const INDEX_RECORD_SIZE: usize = 4 + BlockHash::LEN + 4 + 4 + 4 + 4;

/// Largest payload accepted by the codec (256 MiB).
///
/// Decoded length prefixes above this are rejected before any allocation,
/// so a corrupted prefix cannot trigger a huge read.
pub const MAX_PAYLOAD_LEN: u32 = 256 * 1024 * 1024;

/// Compression tag for an uncompressed payload. Other values are reserved.
pub const COMPRESSION_NONE: u8 = 0;

// ------------------------------------------------------------------------------------------------
// BlockHash
// ------------------------------------------------------------------------------------------------

/// 256-bit block identifier.
///
/// Stored on disk as the 32 array bytes in order. `Display` and `FromStr`
/// use lowercase hex of the same byte order.
///
/// Bitcoin-style node RPCs (`getblockhash`, `getbestblockhash`) print hashes
/// byte-reversed. Feeding such a string to `FromStr` stores the reversed
/// bytes, which is not the layout other tools write for the same block; use
/// [`BlockHash::from_rpc_hex`] / [`BlockHash::to_rpc_hex`] at that boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Encoded width in bytes.
    pub const LEN: usize = 32;

    /// Parses the byte-reversed hex form printed by node RPCs.
    pub fn from_rpc_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut hash: Self = s.parse()?;
        hash.0.reverse();
        Ok(hash)
    }

    /// Byte-reversed hex, as node RPCs print it.
    pub fn to_rpc_hex(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({self})")
    }
}

impl FromStr for BlockHash {
    type Err = hex::FromHexError;

    /// Parses exactly 64 hex characters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

// ------------------------------------------------------------------------------------------------
// BlockRecord
// ------------------------------------------------------------------------------------------------

/// The immutable payload persisted once per block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Block height, starting at 1.
    pub height: u32,

    /// Block identifier.
    pub hash: BlockHash,

    /// Payload compression tag ([`COMPRESSION_NONE`] for raw bytes).
    pub compression: u8,

    /// Raw block bytes.
    pub payload: Vec<u8>,
}

impl BlockRecord {
    /// Full encoded size of a block record whose payload is `payload_len` bytes.
    pub const fn pack_size_for(payload_len: u32) -> usize {
        BLOCK_HEADER_SIZE + CompactSize::encoded_len(payload_len) + payload_len as usize
    }

    /// Full encoded size of this record, computed without encoding it.
    ///
    /// Payloads that do not fit in a `u32` cannot be encoded anyway; for
    /// those the result is only an estimate.
    pub fn pack_size(&self) -> usize {
        let len = self.payload.len();
        let prefix = CompactSize::encoded_len(u32::try_from(len).unwrap_or(u32::MAX));
        BLOCK_HEADER_SIZE + prefix + len
    }

    /// Length of the payload alone, as stored in [`IndexRecord::payload_size`].
    pub fn payload_size(&self) -> u32 {
        u32::try_from(self.payload.len()).unwrap_or(u32::MAX)
    }
}

// ------------------------------------------------------------------------------------------------
// IndexRecord
// ------------------------------------------------------------------------------------------------

/// Fixed-width index entry locating one [`BlockRecord`] inside a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Height of the described block.
    pub height: u32,

    /// Hash of the described block.
    pub hash: BlockHash,

    /// Byte length of the payload only.
    pub payload_size: u32,

    /// Tag of the segment holding the block record.
    pub segment_tag: u32,

    /// Offset of the first byte of the block record.
    pub start_offset: u32,

    /// Offset one past the last byte of the block record.
    pub end_offset: u32,
}

impl IndexRecord {
    /// Encoded width in bytes.
    pub const SIZE: usize = INDEX_RECORD_SIZE;

    /// On-disk size of the described block record.
    pub fn record_len(&self) -> u32 {
        self.end_offset.saturating_sub(self.start_offset)
    }

    /// Byte position of the index entry for `height` inside the index file.
    ///
    /// Height 0 has no entry; callers must reject it first.
    pub fn position_of(height: u32) -> u64 {
        u64::from(height.saturating_sub(1)) * Self::SIZE as u64
    }
}
