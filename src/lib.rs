//! # rawblockdb
//!
//! An embeddable, append-only store for raw blockchain blocks. Blocks are
//! written once, in height order, into size-bounded data segments and
//! located through a fixed-width on-disk index, with in-memory tables for
//! height ↔ hash lookups.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rawblockdb::{BlockHash, BlockStore, StoreConfig, COMPRESSION_NONE};
//!
//! let store = BlockStore::open("/tmp/block_data", StoreConfig::default()).unwrap();
//!
//! // Append the next block.
//! let hash = BlockHash([0xAA; 32]);
//! store.append_block(1, hash, COMPRESSION_NONE, vec![0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
//!
//! // Look it up.
//! assert_eq!(store.block_count().unwrap(), 1);
//! assert_eq!(store.hash_for_height(1).unwrap(), Some(hash));
//! assert_eq!(store.height_for_hash(&hash).unwrap(), Some(1));
//! assert_eq!(
//!     store.raw_block_by_hash(&hash).unwrap(),
//!     Some(vec![0xDE, 0xAD, 0xBE, 0xEF])
//! );
//!
//! // Graceful shutdown
//! store.close().unwrap();
//! ```
//!
//! ## On-disk layout
//!
//! ```text
//! <data dir>/
//!   raw_block.0        block records, rotated once larger than 1 GiB
//!   raw_block.1
//!   ...
//!   raw_block_index    one 52-byte record per block, in height order
//! ```
//!
//! ## Features
//!
//! - **Durable appends**: block data and its index entry are synced before
//!   `append_block` returns.
//! - **Startup verification**: the index tip must match the end of the
//!   current segment; the store refuses to open otherwise.
//! - **Explicit repair**: [`BlockStore::rebuild_index`] regenerates the index
//!   from the segments alone.
//! - **Lock-free reads**: queries use their own file handles and never wait
//!   on the writer's cursor.
//! - **Ingestion driver**: [`sync::Syncer`] pulls blocks from any
//!   [`sync::BlockSource`] into the store on a background thread.

pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod index;
pub(crate) mod record;
pub(crate) mod segment;
pub mod sync;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use engine::{Engine, EngineConfig, EngineStats};
use thiserror::Error;
use tracing::{info, warn};

pub use encoding::EncodingError;
pub use engine::{
    DEFAULT_INDEX_NAME, DEFAULT_SEGMENT_PREFIX, DEFAULT_SEGMENT_SIZE_LIMIT, EngineError,
    RebuildSummary,
};
pub use index::IndexError;
pub use record::{
    BlockHash, BlockRecord, COMPRESSION_NONE, INDEX_RECORD_SIZE, IndexRecord, MAX_PAYLOAD_LEN,
};
pub use segment::SegmentError;

/// Largest accepted segment size limit (2 GiB).
///
/// Offsets are `u32`; a segment may exceed the limit by one record, so the
/// limit plus the largest record must stay below `u32::MAX`.
pub const MAX_SEGMENT_SIZE_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`BlockStore`] instance.
///
/// All fields have defaults via [`StoreConfig::default()`]. The
/// configuration is validated when passed to [`BlockStore::open`] or
/// [`BlockStore::rebuild_index`].
///
/// # Example
///
/// ```rust
/// use rawblockdb::StoreConfig;
///
/// // Defaults: raw_block.<tag>, raw_block_index, 1 GiB segments
/// let config = StoreConfig::default();
///
/// // Or customize
/// let config = StoreConfig {
///     segment_size_limit: 256 * 1024 * 1024,
///     ..StoreConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// File name of the index inside the data directory.
    ///
    /// Default: `raw_block_index`. Must be a plain, non-empty file name.
    pub index_name: String,

    /// File-name prefix of data segments; segment `n` is `<prefix>.<n>`.
    ///
    /// Default: `raw_block`. Must be a plain, non-empty file name.
    pub segment_prefix: String,

    /// A segment larger than this many bytes is closed and the next block
    /// goes to a new segment.
    ///
    /// Default: 1 GiB. Must be in `1 ..= 2 GiB`.
    pub segment_size_limit: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            index_name: engine.index_name,
            segment_prefix: engine.segment_prefix,
            segment_size_limit: engine.segment_size_limit,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), StoreError> {
        check_file_name("index_name", &self.index_name)?;
        check_file_name("segment_prefix", &self.segment_prefix)?;
        if self.index_name.starts_with(&format!("{}.", self.segment_prefix)) {
            return Err(StoreError::InvalidConfig(
                "index_name must not look like a segment file".into(),
            ));
        }
        if self.segment_size_limit < 1 {
            return Err(StoreError::InvalidConfig(
                "segment_size_limit must be >= 1".into(),
            ));
        }
        if self.segment_size_limit > MAX_SEGMENT_SIZE_LIMIT {
            return Err(StoreError::InvalidConfig(format!(
                "segment_size_limit must be <= {MAX_SEGMENT_SIZE_LIMIT}"
            )));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            index_name: self.index_name.clone(),
            segment_prefix: self.segment_prefix.clone(),
            segment_size_limit: self.segment_size_limit,
        }
    }
}

fn check_file_name(field: &str, name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidConfig(format!("{field} must not be empty")));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(StoreError::InvalidConfig(format!(
            "{field} must be a plain file name, got {name:?}"
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`BlockStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("block store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Height, hash or payload constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Point-in-time statistics returned by [`BlockStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Height of the newest block (0 for an empty store).
    pub chain_height: u32,
    /// Tag of the segment currently open for appends.
    pub current_segment: u32,
    /// Byte offset the next block record will be written at (before rotation).
    pub write_offset: u32,
    /// Number of segment files.
    pub segment_count: u32,
    /// Size of the index file in bytes.
    pub index_bytes: u64,
}

impl From<EngineStats> for StoreStats {
    fn from(stats: EngineStats) -> Self {
        Self {
            chain_height: stats.chain_height,
            current_segment: stats.current_segment,
            write_offset: stats.write_offset,
            segment_count: stats.segment_count,
            index_bytes: stats.index_bytes,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main block store handle.
///
/// # Thread safety
///
/// `BlockStore` is `Send + Sync` and can be shared across threads via
/// `Arc<BlockStore>`. Appends are serialized internally; reads run
/// concurrently with appends and with each other.
///
/// # Shutdown
///
/// Call [`BlockStore::close`] for a graceful shutdown. If the handle is
/// dropped without calling `close`, the destructor syncs on a best-effort
/// basis and only logs failures.
pub struct BlockStore {
    engine: Engine,
    closed: AtomicBool,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BlockStore {
    /// Opens (or creates) a block store in the given directory.
    ///
    /// The directory is created if missing. An existing store is verified
    /// (index tip against the current segment) and its index replayed into
    /// memory.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidConfig`] if any configuration parameter is out
    ///   of range.
    /// - [`EngineError::IndexDataMismatch`] or [`IndexError::InvalidIndexSize`]
    ///   (wrapped in [`StoreError::Engine`]) if the files on disk disagree;
    ///   run [`BlockStore::rebuild_index`] to repair.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let engine = Engine::open(&path, config.to_engine_config())?;

        info!(
            path = %path.as_ref().display(),
            segment_size_limit = config.segment_size_limit,
            "block store ready"
        );

        Ok(Self {
            engine,
            closed: AtomicBool::new(false),
        })
    }

    /// Regenerates the index of the store at `path` from its data segments.
    ///
    /// The store must not be open while this runs. On failure the previous
    /// index is left untouched.
    pub fn rebuild_index(
        path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<RebuildSummary, StoreError> {
        config.validate()?;
        Ok(Engine::rebuild_index(path, &config.to_engine_config())?)
    }

    /// Gracefully shuts down the store.
    ///
    /// Syncs the current segment, the index and the data directory.
    /// Subsequent operations on this handle return [`StoreError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // Already closed.
        }

        self.engine.close()?;

        info!("block store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Appends the next block and returns its index entry.
    ///
    /// The block record and its index entry are both synced to disk before
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] if `height` is not
    /// `block_count() + 1`, `hash` is already stored, or the payload is
    /// larger than [`MAX_PAYLOAD_LEN`].
    pub fn append_block(
        &self,
        height: u32,
        hash: BlockHash,
        compression: u8,
        payload: impl Into<Vec<u8>>,
    ) -> Result<IndexRecord, StoreError> {
        self.check_open()?;

        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN as usize {
            return Err(StoreError::InvalidArgument(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
                payload.len()
            )));
        }
        if height == 0 {
            return Err(StoreError::InvalidArgument(
                "heights start at 1".into(),
            ));
        }

        match self.engine.append_block(height, hash, compression, payload) {
            Ok(entry) => Ok(entry),
            Err(e @ (EngineError::OutOfSequence { .. } | EngineError::DuplicateHash { .. })) => {
                Err(StoreError::InvalidArgument(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Height of the newest stored block, or 0 for an empty store.
    pub fn block_count(&self) -> Result<u32, StoreError> {
        self.check_open()?;
        Ok(self.engine.block_count()?)
    }

    /// Hash of the block at `height`. Returns `Ok(None)` if not stored.
    pub fn hash_for_height(&self, height: u32) -> Result<Option<BlockHash>, StoreError> {
        self.check_open()?;
        Ok(self.engine.hash_for_height(height)?)
    }

    /// Height of the block with `hash`. Returns `Ok(None)` if not stored.
    pub fn height_for_hash(&self, hash: &BlockHash) -> Result<Option<u32>, StoreError> {
        self.check_open()?;
        Ok(self.engine.height_for_hash(hash)?)
    }

    /// Raw payload of the block with `hash`. Returns `Ok(None)` if not stored.
    ///
    /// Resolves hash → height through the lookup tables, height → index
    /// entry through a positioned index read, then reads the block record
    /// from its segment.
    pub fn raw_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        Ok(self.engine.raw_block_by_hash(hash)?)
    }

    /// Raw payload of the block at `height`. Returns `Ok(None)` if not stored.
    pub fn raw_block_by_height(&self, height: u32) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        Ok(self.engine.raw_block_by_height(height)?)
    }

    /// Full block record (including the compression tag) at `height`.
    pub fn block_by_height(&self, height: u32) -> Result<Option<BlockRecord>, StoreError> {
        self.check_open()?;
        Ok(self.engine.block_by_height(height)?)
    }

    /// Index entry of the block at `height`. Returns `Ok(None)` if not stored.
    pub fn index_record(&self, height: u32) -> Result<Option<IndexRecord>, StoreError> {
        self.check_open()?;
        Ok(self.engine.index_record(height)?)
    }

    /// Current store statistics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.check_open()?;
        Ok(self.engine.stats()?.into())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::Closed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.engine.close() {
                warn!("block store sync on drop failed: {e}");
            }
        }
    }
}
