//! Deterministic binary encoding for the on-disk record formats.
//!
//! This module provides the [`Encode`] and [`Decode`] traits used by the
//! segment and index files.  The format is hand-written and byte-stable:
//! a file written by one build of the store is readable by every other.
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                          |
//! |--------------------|---------------------------------------------------|
//! | `u8`               | 1 byte                                            |
//! | `u16`              | 2 bytes, little-endian                            |
//! | `u32`              | 4 bytes, little-endian                            |
//! | `[u8; N]`          | `N` raw bytes (fixed-size, no length prefix)      |
//! | [`CompactSize`]    | 1, 3 or 5 bytes (see below)                       |
//!
//! # Compact size
//!
//! Variable-length payloads are prefixed with a compact size, the same
//! scheme used by Bitcoin-style block serialization:
//!
//! | Value range             | Bytes                           |
//! |-------------------------|---------------------------------|
//! | `0 ..= 252`             | `[value as u8]`                 |
//! | `253 ..= 0xFFFF`        | `[0xFD][u16 LE]`                |
//! | `0x1_0000 ..= u32::MAX` | `[0xFE][u32 LE]`                |
//!
//! The `0xFF` marker (64-bit sizes) is never produced and is rejected on
//! decode, as is any non-canonical encoding (e.g. `0xFD` carrying a value
//! that fits in one byte).  This keeps encode and decode exact inverses.
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()`, `expect()`, or any other
//! panicking path.  All errors are propagated via [`EncodingError`].


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// One-byte marker announcing a `u16` compact size.
pub const COMPACT_U16_MARKER: u8 = 0xFD;

/// One-byte marker announcing a `u32` compact size.
pub const COMPACT_U32_MARKER: u8 = 0xFE;

/// One-byte marker announcing a `u64` compact size (unsupported).
pub const COMPACT_U64_MARKER: u8 = 0xFF;

/// Largest value encoded as a single compact-size byte.
const COMPACT_SINGLE_MAX: u32 = 252;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("truncated record (need {needed} bytes, have {available})")]
    TruncatedRecord {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A compact-size prefix used a marker or width that is not allowed.
    #[error("invalid compact size: {0}")]
    InvalidCompactSize(String),

    /// A length exceeded its safety limit or the `u32` range.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations **must** produce deterministic output: the same
/// logical value always yields the exact same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` on success so that callers can
/// advance a cursor through a buffer containing multiple encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
///
/// Returns `(value, bytes_consumed)`.
#[cfg(test)]
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes, returning
/// [`EncodingError::TruncatedRecord`] if not.
#[inline]
pub(crate) fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::TruncatedRecord {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Convert a `usize` length to `u32`, returning [`EncodingError::LengthOverflow`]
/// if the value exceeds `u32::MAX`.
#[inline]
pub(crate) fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Unsigned integers
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u16 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u16 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 2)?;
        Ok((u16::from_le_bytes([buf[0], buf[1]]), 2))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        Ok((u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 4))
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-size byte arrays
// ------------------------------------------------------------------------------------------------

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(&buf[..N]);
        Ok((arr, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Compact size
// ------------------------------------------------------------------------------------------------

/// A length encoded with the compact-size scheme described in the
/// [module-level documentation](self).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactSize(pub u32);

impl CompactSize {
    /// Number of bytes the compact encoding of `value` occupies.
    ///
    /// Used to predict record sizes (and therefore file offsets) without
    /// encoding anything.
    #[inline]
    pub const fn encoded_len(value: u32) -> usize {
        if value <= COMPACT_SINGLE_MAX {
            1
        } else if value <= u16::MAX as u32 {
            3
        } else {
            5
        }
    }

    /// Returns the number of bytes the prefix itself needs, based only on
    /// the first (marker) byte.  Lets stream readers know how much more to
    /// read before the full value can be decoded.
    pub fn len_from_marker(marker: u8) -> Result<usize, EncodingError> {
        match marker {
            COMPACT_U16_MARKER => Ok(3),
            COMPACT_U32_MARKER => Ok(5),
            COMPACT_U64_MARKER => Err(EncodingError::InvalidCompactSize(
                "64-bit compact sizes are not supported".into(),
            )),
            _ => Ok(1),
        }
    }
}

impl Encode for CompactSize {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let value = self.0;
        if value <= COMPACT_SINGLE_MAX {
            buf.push(value as u8);
        } else if let Ok(short) = u16::try_from(value) {
            buf.push(COMPACT_U16_MARKER);
            short.encode_to(buf)?;
        } else {
            buf.push(COMPACT_U32_MARKER);
            value.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for CompactSize {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (marker, mut offset) = u8::decode_from(buf)?;
        let value = match marker {
            COMPACT_U16_MARKER => {
                let (v, n) = u16::decode_from(&buf[offset..])?;
                offset += n;
                let v = u32::from(v);
                if v <= COMPACT_SINGLE_MAX {
                    return Err(EncodingError::InvalidCompactSize(format!(
                        "non-canonical u16 encoding of {v}"
                    )));
                }
                v
            }
            COMPACT_U32_MARKER => {
                let (v, n) = u32::decode_from(&buf[offset..])?;
                offset += n;
                if v <= u32::from(u16::MAX) {
                    return Err(EncodingError::InvalidCompactSize(format!(
                        "non-canonical u32 encoding of {v}"
                    )));
                }
                v
            }
            COMPACT_U64_MARKER => {
                return Err(EncodingError::InvalidCompactSize(
                    "64-bit compact sizes are not supported".into(),
                ));
            }
            small => u32::from(small),
        };
        Ok((CompactSize(value), offset))
    }
}
