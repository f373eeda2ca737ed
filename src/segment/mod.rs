//! # Segment Store
//!
//! Block records are appended to a sequence of numbered data files called
//! **segments**, named `<prefix>.<tag>` (`raw_block.0`, `raw_block.1`, …).
//! Exactly one segment, the highest tag, is open for appending; every
//! lower-tagged segment is immutable.
//!
//! # On-disk layout
//!
//! A segment is a plain concatenation of encoded [`BlockRecord`]s with no
//! header, footer or padding:
//!
//! ```text
//! [BlockRecord][BlockRecord][BlockRecord]...
//! ```
//!
//! Record boundaries are recovered either from the index (start/end
//! offsets) or by decoding sequentially from offset 0.
//!
//! # Rotation
//!
//! Before each append, if the current segment is larger than the configured
//! size limit, it is synced and closed and segment `tag + 1` is opened at
//! offset 0.  Rotation never touches block heights.
//!
//! # Concurrency model
//!
//! - The write path is guarded by a single `Mutex<SegmentWriter>`; only one
//!   append may be in flight at a time.
//! - [`SegmentStore::read_at`] opens its own file handle per call and never
//!   touches the writer's cursor, so reads do not contend with appends.
//!   Readers only ever target byte ranges that an index entry has already
//!   committed.
//!
//! # Failure handling
//!
//! A failed write leaves an unknown number of bytes at the tail of the
//! segment.  The writer is then **poisoned**: every later append fails with
//! [`SegmentError::WriterPoisoned`] instead of landing at a wrong offset.
//! Recovery is a restart, where startup verification detects the mismatch.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, CompactSize, Decode, EncodingError};
use crate::record::{BLOCK_HEADER_SIZE, BlockRecord, MAX_PAYLOAD_LEN};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The bytes at a position do not decode as a block record.
    #[error("Corrupt record in segment {tag} at offset {offset}: {source}")]
    CorruptRecord {
        /// Segment tag.
        tag: u32,
        /// Byte offset the decode started at.
        offset: u64,
        /// What the decoder found.
        #[source]
        source: EncodingError,
    },

    /// Appending the record would push the segment past `u32::MAX` bytes.
    #[error("Segment {tag} offset overflow: {offset} + {len} exceeds u32::MAX")]
    OffsetOverflow {
        /// Segment tag.
        tag: u32,
        /// Current write offset.
        offset: u32,
        /// Encoded record length.
        len: u32,
    },

    /// Rotation found a non-empty file where a fresh segment was expected.
    #[error("Segment {tag} already exists with {len} bytes")]
    StaleSegment {
        /// Tag of the segment that should have been empty.
        tag: u32,
        /// Its actual length.
        len: u64,
    },

    /// A previous write failed; the tail of the segment is unknown.
    #[error("Segment writer poisoned after failed write to segment {tag}")]
    WriterPoisoned {
        /// Tag of the segment that saw the failure.
        tag: u32,
    },

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Naming / discovery
// ------------------------------------------------------------------------------------------------

/// Location and file-name prefix shared by all segments of a store.
#[derive(Debug, Clone)]
pub struct SegmentNaming {
    dir: PathBuf,
    prefix: String,
}

impl SegmentNaming {
    pub fn new(dir: impl AsRef<Path>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
        }
    }

    /// Path of the segment with the given tag: `<dir>/<prefix>.<tag>`.
    pub fn path(&self, tag: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", self.prefix, tag))
    }

    /// Finds the current segment tag by stepping upward from 0 while the
    /// next-tagged file exists, stopping at the first gap.
    ///
    /// Linear in the number of segments; only called at startup and during
    /// rebuild.
    pub fn discover_latest_tag(&self) -> Result<u32, SegmentError> {
        let mut tag = 0u32;
        while let Some(next) = tag.checked_add(1) {
            if !self.path(next).try_exists()? {
                break;
            }
            tag = next;
        }
        Ok(tag)
    }

    /// Opens the segment for `tag` in append mode, creating it if absent.
    ///
    /// Returns the file and whether it was created. A created file has its
    /// directory entry fsynced before this returns, so an index entry that
    /// later points into it cannot outlive the file across a power loss.
    pub fn open_append(&self, tag: u32) -> Result<(File, bool), SegmentError> {
        let path = self.path(tag);
        let existed = path.try_exists()?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if !existed {
            self.sync_dir()?;
            debug!(path = %path.display(), tag, "created segment");
        }
        Ok((file, !existed))
    }

    /// Fsyncs the directory holding the segments.
    pub fn sync_dir(&self) -> Result<(), SegmentError> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Length in bytes of the segment file for `tag`, or 0 if it does not exist.
    pub fn file_len(&self, tag: u32) -> Result<u64, SegmentError> {
        match std::fs::metadata(self.path(tag)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentSlot
// ------------------------------------------------------------------------------------------------

/// Where an appended record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSlot {
    /// Segment tag.
    pub tag: u32,
    /// First byte of the record.
    pub start: u32,
    /// One past the last byte of the record.
    pub end: u32,
}

// ------------------------------------------------------------------------------------------------
// SegmentWriter
// ------------------------------------------------------------------------------------------------

/// The single append cursor of a [`SegmentStore`].
///
/// Obtained through [`SegmentStore::lock_writer`]; holding the guard is what
/// makes an append exclusive.
#[derive(Debug)]
pub struct SegmentWriter {
    naming: SegmentNaming,
    file: File,
    tag: u32,
    offset: u32,
    size_limit: u64,
    poisoned: bool,
}

impl SegmentWriter {
    /// Opens (creating if absent) the segment for `tag` in append mode.
    /// The write offset starts at the current file length.
    fn open_segment(naming: SegmentNaming, tag: u32, size_limit: u64) -> Result<Self, SegmentError> {
        let path = naming.path(tag);
        let (file, _) = naming.open_append(tag)?;

        let len = file.metadata()?.len();
        let offset = u32::try_from(len).map_err(|_| {
            SegmentError::Internal(format!(
                "segment {} is {len} bytes, larger than u32 offsets allow",
                path.display()
            ))
        })?;

        info!(path = %path.display(), tag, offset, "opened segment");

        Ok(Self {
            naming,
            file,
            tag,
            offset,
            size_limit,
            poisoned: false,
        })
    }

    /// Tag of the segment currently open for append.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Current write offset (= length of the current segment).
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether a previous failure disabled this writer.
    #[cfg(test)]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Disables further appends.
    ///
    /// Called by the owner when a step that must follow a successful
    /// append (the index write) fails, so the store cannot move past a
    /// block that has data but no index entry.
    pub fn poison(&mut self) {
        if !self.poisoned {
            warn!(tag = self.tag, offset = self.offset, "segment writer poisoned");
        }
        self.poisoned = true;
    }

    /// Appends one record and returns the byte range it occupies.
    ///
    /// Rotates to a new segment first if the current one is over the size
    /// limit. The write is followed by `sync_data` so the range is durable
    /// before the caller records it in the index.
    pub fn append(&mut self, record: &BlockRecord) -> Result<SegmentSlot, SegmentError> {
        if self.poisoned {
            return Err(SegmentError::WriterPoisoned { tag: self.tag });
        }

        if u64::from(self.offset) > self.size_limit {
            self.rotate()?;
        }

        let bytes = encoding::encode_to_vec(record)?;
        let len = encoding::len_to_u32(bytes.len())?;
        let start = self.offset;
        let end = start
            .checked_add(len)
            .ok_or(SegmentError::OffsetOverflow {
                tag: self.tag,
                offset: start,
                len,
            })?;

        if let Err(e) = self
            .file
            .write_all(&bytes)
            .and_then(|()| self.file.sync_data())
        {
            error!(tag = self.tag, offset = start, "segment write failed: {e}");
            self.poisoned = true;
            return Err(e.into());
        }
        self.offset = end;

        trace!(
            tag = self.tag,
            start,
            end,
            height = record.height,
            "appended block record"
        );

        Ok(SegmentSlot {
            tag: self.tag,
            start,
            end,
        })
    }

    /// Closes the current segment and opens `tag + 1` at offset 0.
    fn rotate(&mut self) -> Result<(), SegmentError> {
        self.file.sync_all()?;

        let next = self
            .tag
            .checked_add(1)
            .ok_or_else(|| SegmentError::Internal("segment tag overflow".into()))?;

        let existing = self.naming.file_len(next)?;
        if existing != 0 {
            return Err(SegmentError::StaleSegment {
                tag: next,
                len: existing,
            });
        }

        info!(
            from = self.tag,
            to = next,
            size = self.offset,
            limit = self.size_limit,
            "rotating segment"
        );

        let new_writer = Self::open_segment(self.naming.clone(), next, self.size_limit)?;
        *self = new_writer;
        Ok(())
    }

    /// Flushes file contents and metadata of the current segment.
    pub fn sync(&self) -> Result<(), SegmentError> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all() {
            error!("Failed to sync segment {} on drop: {}", self.tag, e);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentStore
// ------------------------------------------------------------------------------------------------

/// Manages the set of data segments: one exclusive writer plus lock-free
/// positioned reads.
#[derive(Debug)]
pub struct SegmentStore {
    naming: SegmentNaming,
    writer: Mutex<SegmentWriter>,
}

impl SegmentStore {
    /// Opens the store with segment `tag` as the current (append) segment.
    pub fn open(naming: SegmentNaming, tag: u32, size_limit: u64) -> Result<Self, SegmentError> {
        let writer = SegmentWriter::open_segment(naming.clone(), tag, size_limit)?;
        Ok(Self {
            naming,
            writer: Mutex::new(writer),
        })
    }

    /// Acquires the segment-write lock.
    pub fn lock_writer(&self) -> Result<MutexGuard<'_, SegmentWriter>, SegmentError> {
        self.writer
            .lock()
            .map_err(|_| SegmentError::Internal("Mutex poisoned".into()))
    }

    /// Appends a record under the segment-write lock.
    #[cfg(test)]
    pub fn append(&self, record: &BlockRecord) -> Result<SegmentSlot, SegmentError> {
        self.lock_writer()?.append(record)
    }

    /// `(tag, offset)` of the append cursor.
    pub fn cursor(&self) -> Result<(u32, u32), SegmentError> {
        let writer = self.lock_writer()?;
        Ok((writer.tag(), writer.offset()))
    }

    /// Reads exactly one record starting at `offset` in segment `tag`.
    ///
    /// Opens an independent handle, so it neither takes the write lock nor
    /// moves the writer's cursor. Decode problems are reported as
    /// [`SegmentError::CorruptRecord`]; nothing on disk is changed.
    pub fn read_at(&self, tag: u32, offset: u64) -> Result<BlockRecord, SegmentError> {
        let path = self.naming.path(tag);
        let mut file = File::open(&path)?;
        let available = file.metadata()?.len().saturating_sub(offset);
        file.seek(SeekFrom::Start(offset))?;

        let corrupt = |source: EncodingError| SegmentError::CorruptRecord {
            tag,
            offset,
            source,
        };

        // Fixed header plus the compact-size marker byte.
        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE + 5);
        read_more(&mut file, &mut buf, BLOCK_HEADER_SIZE + 1, available).map_err(corrupt)?;

        let prefix_len =
            CompactSize::len_from_marker(buf[BLOCK_HEADER_SIZE]).map_err(corrupt)?;
        read_more(&mut file, &mut buf, prefix_len - 1, available).map_err(corrupt)?;

        let (CompactSize(payload_len), _) =
            CompactSize::decode_from(&buf[BLOCK_HEADER_SIZE..]).map_err(corrupt)?;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(corrupt(EncodingError::LengthOverflow(format!(
                "payload length {payload_len} exceeds MAX_PAYLOAD_LEN ({MAX_PAYLOAD_LEN})"
            ))));
        }
        read_more(&mut file, &mut buf, payload_len as usize, available).map_err(corrupt)?;

        let (record, consumed) = BlockRecord::decode_from(&buf).map_err(corrupt)?;
        debug!(tag, offset, consumed, height = record.height, "read block record");
        Ok(record)
    }

    /// Flushes the current segment.
    pub fn sync(&self) -> Result<(), SegmentError> {
        self.lock_writer()?.sync()
    }
}

/// Reads `extra` more bytes onto the end of `buf`.
///
/// `available` is the number of bytes the file holds past the read start;
/// asking for more than that, or a short read, is a truncated record.
fn read_more(
    file: &mut File,
    buf: &mut Vec<u8>,
    extra: usize,
    available: u64,
) -> Result<(), EncodingError> {
    let have = buf.len();
    let needed = have + extra;
    let truncated = EncodingError::TruncatedRecord {
        needed,
        available: usize::try_from(available).unwrap_or(usize::MAX),
    };
    if needed as u64 > available {
        return Err(truncated);
    }
    buf.resize(needed, 0);
    file.read_exact(&mut buf[have..]).map_err(|_| truncated)
}
