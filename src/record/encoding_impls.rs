//! Encode / Decode implementations for the record types.
//!
//! These are split into a separate file for readability; the types
//! themselves live in `super` (i.e., `src/record/mod.rs`).

use crate::encoding::{self, CompactSize, Decode, Encode, EncodingError};

use super::{BlockHash, BlockRecord, IndexRecord, MAX_PAYLOAD_LEN};

// ------------------------------------------------------------------------------------------------
// BlockHash
// ------------------------------------------------------------------------------------------------

impl Encode for BlockHash {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)
    }
}

impl Decode for BlockHash {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, n) = <[u8; 32]>::decode_from(buf)?;
        Ok((Self(bytes), n))
    }
}

// ------------------------------------------------------------------------------------------------
// BlockRecord
// ------------------------------------------------------------------------------------------------

impl Encode for BlockRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let len = encoding::len_to_u32(self.payload.len())?;
        if len > MAX_PAYLOAD_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "payload length {len} exceeds MAX_PAYLOAD_LEN ({MAX_PAYLOAD_LEN})"
            )));
        }
        buf.reserve(self.pack_size());
        self.height.encode_to(buf)?;
        self.hash.encode_to(buf)?;
        self.compression.encode_to(buf)?;
        CompactSize(len).encode_to(buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

impl Decode for BlockRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (height, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (hash, n) = BlockHash::decode_from(&buf[offset..])?;
        offset += n;
        let (compression, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (CompactSize(len), n) = CompactSize::decode_from(&buf[offset..])?;
        offset += n;
        if len > MAX_PAYLOAD_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "payload length {len} exceeds MAX_PAYLOAD_LEN ({MAX_PAYLOAD_LEN})"
            )));
        }
        let len = len as usize;
        encoding::require(&buf[offset..], len)?;
        let payload = buf[offset..offset + len].to_vec();
        offset += len;
        Ok((
            Self {
                height,
                hash,
                compression,
                payload,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// IndexRecord
// ------------------------------------------------------------------------------------------------

impl Encode for IndexRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.height.encode_to(buf)?;
        self.hash.encode_to(buf)?;
        self.payload_size.encode_to(buf)?;
        self.segment_tag.encode_to(buf)?;
        self.start_offset.encode_to(buf)?;
        self.end_offset.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        encoding::require(buf, IndexRecord::SIZE)?;
        let mut offset = 0;
        let (height, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (hash, n) = BlockHash::decode_from(&buf[offset..])?;
        offset += n;
        let (payload_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (segment_tag, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (start_offset, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (end_offset, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                height,
                hash,
                payload_size,
                segment_tag,
                start_offset,
                end_offset,
            },
            offset,
        ))
    }
}
