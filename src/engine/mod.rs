//! # Block Store Engine
//!
//! Ties the segment store, the index store and the in-memory lookup tables
//! into one append-only chain of blocks.
//!
//! ## Design Overview
//!
//! ```text
//!            append_block(height, hash, compression, payload)
//!                                │
//!            ┌───────────────────┼─────────────────────────┐
//!            ▼                   ▼                         ▼
//!   segment  raw_block.<tag>   index  raw_block_index    lookup tables
//!   (BlockRecord, rotated)     (52-byte IndexRecord)     height ↔ hash
//! ```
//!
//! Every block is first written to the current data segment, then described
//! by one fixed-width entry in the index, then published in the lookup
//! tables. A block is visible to readers only once all three steps are done.
//!
//! ## Startup
//!
//! [`Engine::open`] locates the current segment by probing tags upward from
//! zero, checks that the index tip points exactly at the end of that
//! segment, then replays the whole index to rebuild the lookup tables.
//! Nothing is ever repaired during startup: any disagreement is reported
//! as [`EngineError::IndexDataMismatch`] and the caller decides whether to
//! run [`Engine::rebuild_index`].
//!
//! ## Concurrency Model
//!
//! - The segment-write lock (inside [`SegmentStore`]) is held for a whole
//!   append step, so appends are strictly sequential.
//! - The index-write lock (inside [`IndexStore`]) is independent of it.
//! - The lookup tables sit behind an `RwLock`; readers take it only long
//!   enough to resolve a height or hash.
//! - Readers open their own file handles for index and segment reads and
//!   never touch the writer's cursor.
//!
//! ## Guarantees
//!
//! - **Durability:** both the block record and its index entry are synced
//!   before `append_block` returns.
//! - **No skipped index step:** if the index append fails after the data
//!   append succeeded, the segment writer is poisoned and the engine refuses
//!   further appends until it is reopened (and, if needed, rebuilt).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::encoding::EncodingError;
use crate::index::{IndexError, IndexStore};
use crate::record::{BlockHash, BlockRecord, IndexRecord};
use crate::segment::{SegmentError, SegmentNaming, SegmentStore};

mod lookup;
mod rebuild;
mod verify;

pub use rebuild::RebuildSummary;

use lookup::LookupTables;

#[cfg(test)]
mod tests;

/// Default file name of the index inside the data directory.
pub const DEFAULT_INDEX_NAME: &str = "raw_block_index";

/// Default file-name prefix of data segments.
pub const DEFAULT_SEGMENT_PREFIX: &str = "raw_block";

/// Default rotation threshold (1 GiB).
pub const DEFAULT_SEGMENT_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the segment store.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Error originating from the index store.
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index and data segments disagree.
    #[error("Index/data mismatch: {0}; rebuild required")]
    IndexDataMismatch(String),

    /// A block was offered at a height other than the next one.
    #[error("Out-of-sequence block: expected height {expected}, got {got}")]
    OutOfSequence {
        /// The only height that may be appended next.
        expected: u32,
        /// The height that was offered.
        got: u32,
    },

    /// A block hash is already stored at another height.
    #[error("Duplicate block hash {hash} (already stored at height {height})")]
    DuplicateHash {
        /// The offending hash.
        hash: BlockHash,
        /// Height the hash is already stored at.
        height: u32,
    },

    /// A block record read back from a segment does not match its index entry.
    #[error("Block record at height {height} does not match its index entry: {reason}")]
    RecordMismatch {
        /// Height being read.
        height: u32,
        /// Which field disagreed.
        reason: String,
    },

    /// A segment could not be decoded into a contiguous chain during rebuild.
    #[error("Corrupt record in segment {tag} at offset {offset}: {reason}")]
    CorruptRecord {
        /// Segment tag.
        tag: u32,
        /// Byte offset the decode started at.
        offset: u64,
        /// What went wrong.
        reason: String,
    },

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration for an [`Engine`] instance.
///
/// File names are relative to the data directory passed to
/// [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// File name of the index.
    pub index_name: String,

    /// File-name prefix of data segments (`<prefix>.<tag>`).
    pub segment_prefix: String,

    /// A segment larger than this many bytes is rotated before the next append.
    pub segment_size_limit: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index_name: DEFAULT_INDEX_NAME.to_string(),
            segment_prefix: DEFAULT_SEGMENT_PREFIX.to_string(),
            segment_size_limit: DEFAULT_SEGMENT_SIZE_LIMIT,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Height of the newest stored block (0 when empty).
    pub chain_height: u32,
    /// Tag of the segment open for append.
    pub current_segment: u32,
    /// Write offset inside the current segment.
    pub write_offset: u32,
    /// Number of segments on disk (`current_segment + 1`).
    pub segment_count: u32,
    /// Length of the index file in bytes.
    pub index_bytes: u64,
}

#[derive(Debug)]
struct EngineInner {
    /// Data segments; owns the segment-write lock.
    segments: SegmentStore,

    /// Block index; owns the index-write lock.
    index: IndexStore,

    /// In-memory height ↔ hash tables.
    lookup: RwLock<LookupTables>,

    /// Directory holding the index and all segments.
    data_dir: PathBuf,
}

/// The block store engine handle.
///
/// Thread-safe; clones share the same underlying stores.
#[derive(Debug)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Acquires a read lock on the lookup tables.
    fn read_lookup(&self) -> Result<std::sync::RwLockReadGuard<'_, LookupTables>, EngineError> {
        self.inner
            .lookup
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    /// Acquires a write lock on the lookup tables.
    fn write_lookup(&self) -> Result<std::sync::RwLockWriteGuard<'_, LookupTables>, EngineError> {
        self.inner
            .lookup
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) a block store rooted at the given directory.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Index`] with [`IndexError::InvalidIndexSize`] if the
    ///   index length is not a whole number of records.
    /// - [`EngineError::IndexDataMismatch`] if the index tip does not point
    ///   at the end of the current segment, or the index does not hold a
    ///   gap-free chain of unique hashes.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let base = path.as_ref();
        fs::create_dir_all(base)?;

        // 1. Locate the current segment.
        let naming = SegmentNaming::new(base, config.segment_prefix.clone());
        let tag = naming.discover_latest_tag()?;

        // 2. Open both stores.
        let index = IndexStore::open(base.join(&config.index_name))?;
        let segments = SegmentStore::open(naming, tag, config.segment_size_limit)?;

        // 3. Index tip must point at the end of the current segment.
        let tip = verify::verify_tip(&index, &segments)?;

        // 4. Replay the index into the lookup tables.
        let lookup = LookupTables::from_replay(index.replay()?)?;
        let tip_height = tip.map_or(0, |record| record.height);
        if lookup.chain_height() != tip_height {
            return Err(EngineError::IndexDataMismatch(format!(
                "replayed {} records but the index tip is height {tip_height}",
                lookup.chain_height()
            )));
        }

        info!(
            path = %base.display(),
            chain_height = tip_height,
            segment = tag,
            "block store opened"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                segments,
                index,
                lookup: RwLock::new(lookup),
                data_dir: base.to_path_buf(),
            }),
        })
    }

    /// Flushes the current segment and the index, then fsyncs the data
    /// directory so newly created segment files are durable.
    pub fn close(&self) -> Result<(), EngineError> {
        self.inner.segments.sync()?;
        self.inner.index.sync()?;

        if let Ok(dir) = fs::File::open(&self.inner.data_dir) {
            dir.sync_all()?;
        }

        debug!(path = %self.inner.data_dir.display(), "engine synced for close");
        Ok(())
    }

    /// Regenerates the index of the store at `path` from its segments.
    ///
    /// Must not be called while an [`Engine`] is open on the same directory.
    pub fn rebuild_index(
        path: impl AsRef<Path>,
        config: &EngineConfig,
    ) -> Result<RebuildSummary, EngineError> {
        rebuild::rebuild_index(path.as_ref(), config)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Appends one block and returns its index entry.
    ///
    /// `height` must be exactly `block_count() + 1` and `hash` must not be
    /// stored yet. The segment-write lock is held from the sequence check
    /// until the lookup tables are updated, so two appends can never race
    /// for the same height.
    pub fn append_block(
        &self,
        height: u32,
        hash: BlockHash,
        compression: u8,
        payload: Vec<u8>,
    ) -> Result<IndexRecord, EngineError> {
        let mut writer = self.inner.segments.lock_writer()?;
        self.read_lookup()?.check_next(height, &hash)?;

        let record = BlockRecord {
            height,
            hash,
            compression,
            payload,
        };
        let slot = writer.append(&record)?;

        let entry = IndexRecord {
            height,
            hash,
            payload_size: record.payload_size(),
            segment_tag: slot.tag,
            start_offset: slot.start,
            end_offset: slot.end,
        };
        if let Err(e) = self.inner.index.append(&entry) {
            error!(height, "index append failed after data append: {e}");
            writer.poison();
            return Err(e.into());
        }

        if let Err(e) = self.write_lookup().and_then(|mut tables| tables.insert(height, hash)) {
            writer.poison();
            return Err(e);
        }

        trace!(
            height,
            %hash,
            tag = slot.tag,
            start = slot.start,
            end = slot.end,
            "engine append_block"
        );
        Ok(entry)
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Height of the newest stored block, or 0 for an empty store.
    pub fn block_count(&self) -> Result<u32, EngineError> {
        Ok(self.read_lookup()?.chain_height())
    }

    /// Hash of the block at `height`, if stored.
    pub fn hash_for_height(&self, height: u32) -> Result<Option<BlockHash>, EngineError> {
        Ok(self.read_lookup()?.hash_for_height(height))
    }

    /// Height of the block with `hash`, if stored.
    pub fn height_for_hash(&self, hash: &BlockHash) -> Result<Option<u32>, EngineError> {
        Ok(self.read_lookup()?.height_for_hash(hash))
    }

    /// Index entry of the block at `height`, read from disk.
    ///
    /// The entry must carry the height and hash the lookup tables hold for
    /// that position, otherwise [`EngineError::RecordMismatch`] is returned.
    pub fn index_record(&self, height: u32) -> Result<Option<IndexRecord>, EngineError> {
        let Some(expected_hash) = self.hash_for_height(height)? else {
            return Ok(None);
        };

        let entry = self.inner.index.read_at(height)?;
        if entry.height != height {
            return Err(EngineError::RecordMismatch {
                height,
                reason: format!("index entry carries height {}", entry.height),
            });
        }
        if entry.hash != expected_hash {
            return Err(EngineError::RecordMismatch {
                height,
                reason: format!("index entry hash {} != {expected_hash}", entry.hash),
            });
        }
        Ok(Some(entry))
    }

    /// Full block record at `height`, if stored.
    ///
    /// Resolves height → index entry → segment range, then checks the
    /// decoded record against the entry before returning it.
    pub fn block_by_height(&self, height: u32) -> Result<Option<BlockRecord>, EngineError> {
        let Some(entry) = self.index_record(height)? else {
            return Ok(None);
        };

        let record = self
            .inner
            .segments
            .read_at(entry.segment_tag, u64::from(entry.start_offset))?;

        if record.height != entry.height {
            return Err(EngineError::RecordMismatch {
                height,
                reason: format!("segment record carries height {}", record.height),
            });
        }
        if record.hash != entry.hash {
            return Err(EngineError::RecordMismatch {
                height,
                reason: format!("segment record hash {} != {}", record.hash, entry.hash),
            });
        }
        let pack_size = record.pack_size();
        if pack_size != entry.record_len() as usize {
            return Err(EngineError::RecordMismatch {
                height,
                reason: format!(
                    "segment record is {pack_size} bytes, index range is {}",
                    entry.record_len()
                ),
            });
        }

        debug!(height, tag = entry.segment_tag, offset = entry.start_offset, "read block");
        Ok(Some(record))
    }

    /// Full block record with `hash`, if stored.
    pub fn block_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockRecord>, EngineError> {
        match self.height_for_hash(hash)? {
            Some(height) => self.block_by_height(height),
            None => Ok(None),
        }
    }

    /// Raw payload of the block at `height`, if stored.
    pub fn raw_block_by_height(&self, height: u32) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.block_by_height(height)?.map(|record| record.payload))
    }

    /// Raw payload of the block with `hash`, if stored.
    pub fn raw_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.block_by_hash(hash)?.map(|record| record.payload))
    }

    /// Current engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let chain_height = self.block_count()?;
        let (current_segment, write_offset) = self.inner.segments.cursor()?;
        let index_bytes = self.inner.index.size_bytes()?;

        Ok(EngineStats {
            chain_height,
            current_segment,
            write_offset,
            segment_count: current_segment.saturating_add(1),
            index_bytes,
        })
    }
}
