//! # Index Store
//!
//! A single append-only file of fixed-width [`IndexRecord`]s, one per
//! block, in height order.  The record at position `k` (0-based) describes
//! the block at height `k + 1`, so a height resolves to a file position
//! with one multiplication and no search.
//!
//! # On-disk layout
//!
//! ```text
//! [IndexRecord 52B][IndexRecord 52B][IndexRecord 52B]...
//! ```
//!
//! The file is never rotated and has no header. Its length must always be
//! an exact multiple of [`IndexRecord::SIZE`]; anything else means a crash
//! interrupted a previous append and is reported as
//! [`IndexError::InvalidIndexSize`].  The trailing partial record is never
//! trimmed automatically; an explicit rebuild regenerates the file.
//!
//! # Concurrency model
//!
//! - Appends and [`IndexStore::latest`] go through the `Mutex<File>`
//!   (the index-write lock), independent of the segment-write lock.
//! - [`IndexStore::replay`] and [`IndexStore::read_at`] open their own
//!   handles, so readers never move the writer's cursor.

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
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;
use tracing::{error, info, trace, warn};

use crate::encoding::{self, Decode, EncodingError};
use crate::record::IndexRecord;

const RECORD_SIZE: u64 = IndexRecord::SIZE as u64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The index length is not a multiple of the record width.
    #[error(
        "Invalid index size {size} (not a multiple of {record_size}); rebuild required"
    )]
    InvalidIndexSize {
        /// Actual file length.
        size: u64,
        /// Expected record width.
        record_size: u64,
    },

    /// The index holds no records.
    #[error("Index is empty")]
    EmptyIndex,

    /// A positioned read asked for a height the index does not cover.
    #[error("Height {height} not in index (holds {count} records)")]
    HeightOutOfRange {
        /// Requested height.
        height: u32,
        /// Number of records in the index.
        count: u64,
    },

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fails with [`IndexError::InvalidIndexSize`] unless `size` is a whole
/// number of records.
fn check_size(size: u64) -> Result<u64, IndexError> {
    if size % RECORD_SIZE != 0 {
        return Err(IndexError::InvalidIndexSize {
            size,
            record_size: RECORD_SIZE,
        });
    }
    Ok(size / RECORD_SIZE)
}

// ------------------------------------------------------------------------------------------------
// IndexStore
// ------------------------------------------------------------------------------------------------

/// The append-only block index.
#[derive(Debug)]
pub struct IndexStore {
    /// Index file handle (index-write lock).
    inner_file: Mutex<File>,

    /// Path to the index file on disk.
    path: PathBuf,

    /// Makes the next `append` fail before writing.
    #[cfg(test)]
    fail_append: std::sync::atomic::AtomicBool,
}

impl IndexStore {
    /// Opens (creating if absent) the index file in append mode.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidIndexSize`] if the existing file is not a whole
    /// number of records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        let size = file.metadata()?.len();
        let count = check_size(size)?;

        info!(path = %path_ref.display(), records = count, "opened block index");

        Ok(Self {
            inner_file: Mutex::new(file),
            path: path_ref.to_path_buf(),
            #[cfg(test)]
            fail_append: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, File>, IndexError> {
        self.inner_file
            .lock()
            .map_err(|_| IndexError::Internal("Mutex poisoned".into()))
    }

    /// Appends one 52-byte record and syncs it.
    ///
    /// Must only be called once the block record it points at is durably
    /// in its segment.
    pub fn append(&self, record: &IndexRecord) -> Result<(), IndexError> {
        let bytes = encoding::encode_to_vec(record)?;
        debug_assert_eq!(bytes.len(), IndexRecord::SIZE);

        let mut guard = self.lock()?;

        #[cfg(test)]
        if self
            .fail_append
            .swap(false, std::sync::atomic::Ordering::AcqRel)
        {
            return Err(io::Error::other("injected index write failure").into());
        }

        if let Err(e) = guard.write_all(&bytes).and_then(|()| guard.sync_data()) {
            error!(height = record.height, "index append failed: {e}");
            return Err(e.into());
        }

        trace!(
            height = record.height,
            tag = record.segment_tag,
            start = record.start_offset,
            end = record.end_offset,
            "appended index record"
        );
        Ok(())
    }

    /// Arms a one-shot failure of the next [`append`](Self::append).
    #[cfg(test)]
    pub fn fail_next_append(&self) {
        self.fail_append
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Reads the last record of the index (the chain tip).
    ///
    /// # Errors
    ///
    /// - [`IndexError::EmptyIndex`] if the file has zero length.
    /// - [`IndexError::InvalidIndexSize`] if the length is not a whole
    ///   number of records.
    pub fn latest(&self) -> Result<IndexRecord, IndexError> {
        let mut guard = self.lock()?;
        let size = guard.metadata()?.len();
        check_size(size)?;
        if size == 0 {
            return Err(IndexError::EmptyIndex);
        }

        guard.seek(SeekFrom::Start(size - RECORD_SIZE))?;
        let mut buf = [0u8; IndexRecord::SIZE];
        guard.read_exact(&mut buf)?;
        let (record, _) = IndexRecord::decode_from(&buf)?;
        Ok(record)
    }

    /// Positioned read of the record for `height` through an independent handle.
    pub fn read_at(&self, height: u32) -> Result<IndexRecord, IndexError> {
        let mut file = File::open(&self.path)?;
        let count = file.metadata()?.len() / RECORD_SIZE;
        if height == 0 || u64::from(height) > count {
            return Err(IndexError::HeightOutOfRange { height, count });
        }

        file.seek(SeekFrom::Start(IndexRecord::position_of(height)))?;
        let mut buf = [0u8; IndexRecord::SIZE];
        file.read_exact(&mut buf)?;
        let (record, _) = IndexRecord::decode_from(&buf)?;

        if record.height != height {
            warn!(
                expected = height,
                found = record.height,
                "index record height does not match its position"
            );
        }
        Ok(record)
    }

    /// Returns a lazy iterator over every record, from the first to the
    /// last, using a freshly opened handle.
    ///
    /// Each call starts over from offset 0. Records appended after the
    /// call are not yielded.
    pub fn replay(&self) -> Result<IndexIter, IndexError> {
        let file = File::open(&self.path)?;
        let size = file.metadata()?.len();
        let remaining = check_size(size)?;

        info!(path = %self.path.display(), records = remaining, "starting index replay");

        Ok(IndexIter {
            reader: BufReader::new(file),
            remaining,
        })
    }

    /// Current length of the index file in bytes.
    pub fn size_bytes(&self) -> Result<u64, IndexError> {
        Ok(self.lock()?.metadata()?.len())
    }

    /// Number of whole records in the index.
    #[cfg(test)]
    pub fn record_count(&self) -> Result<u64, IndexError> {
        Ok(self.size_bytes()? / RECORD_SIZE)
    }

    /// Flushes file contents and metadata.
    pub fn sync(&self) -> Result<(), IndexError> {
        self.lock()?.sync_all()?;
        Ok(())
    }
}

impl Drop for IndexStore {
    fn drop(&mut self) {
        match self.inner_file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!("Failed to sync index on drop: {}", e);
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!("Failed to sync index (poisoned) on drop: {}", e);
                } else {
                    warn!("Recovered and synced index after poisoned lock");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// IndexIter
// ------------------------------------------------------------------------------------------------

/// Streaming index replay iterator.
///
/// Reads one 52-byte record per step from its own buffered handle. The
/// number of records is fixed when the iterator is created.
pub struct IndexIter {
    /// Independent read handle.
    reader: BufReader<File>,

    /// Records left to yield.
    remaining: u64,
}

impl Iterator for IndexIter {
    type Item = Result<IndexRecord, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let mut buf = [0u8; IndexRecord::SIZE];
        if let Err(e) = self.reader.read_exact(&mut buf) {
            self.remaining = 0;
            return Some(Err(IndexError::Io(e)));
        }

        match IndexRecord::decode_from(&buf) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e.into()))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}
