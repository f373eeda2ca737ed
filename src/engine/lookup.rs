//! In-memory height ↔ hash tables.
//!
//! `hashes[k]` is the hash of the block at height `k + 1`; `heights` is the
//! inverse map. Both are rebuilt from the index on every open and extended
//! by each successful append.

use std::collections::HashMap;

use tracing::info;

use super::EngineError;
use crate::index::IndexError;
use crate::record::{BlockHash, IndexRecord};

#[derive(Debug, Default)]
pub(crate) struct LookupTables {
    hashes: Vec<BlockHash>,
    heights: HashMap<BlockHash, u32>,
}

impl LookupTables {
    /// Builds the tables from an index replay.
    ///
    /// The record at position `k` must carry height `k + 1` and no hash may
    /// appear twice; anything else is an [`EngineError::IndexDataMismatch`].
    pub(crate) fn from_replay<I>(records: I) -> Result<Self, EngineError>
    where
        I: Iterator<Item = Result<IndexRecord, IndexError>>,
    {
        let (lower, _) = records.size_hint();
        let mut tables = Self {
            hashes: Vec::with_capacity(lower),
            heights: HashMap::with_capacity(lower),
        };

        for (position, record) in records.enumerate() {
            let record = record?;
            tables.insert(record.height, record.hash).map_err(|e| {
                EngineError::IndexDataMismatch(format!("index position {position}: {e}"))
            })?;
        }

        info!(chain_height = tables.chain_height(), "lookup tables rebuilt from index");
        Ok(tables)
    }

    /// Height of the newest block, or 0 when empty.
    pub(crate) fn chain_height(&self) -> u32 {
        u32::try_from(self.hashes.len()).unwrap_or(u32::MAX)
    }

    /// Fails unless `(height, hash)` may be appended next.
    pub(crate) fn check_next(&self, height: u32, hash: &BlockHash) -> Result<(), EngineError> {
        let expected = self
            .chain_height()
            .checked_add(1)
            .ok_or_else(|| EngineError::Internal("chain height overflow".into()))?;
        if height != expected {
            return Err(EngineError::OutOfSequence {
                expected,
                got: height,
            });
        }
        if let Some(&existing) = self.heights.get(hash) {
            return Err(EngineError::DuplicateHash {
                hash: *hash,
                height: existing,
            });
        }
        Ok(())
    }

    /// Publishes the block at `height`.
    pub(crate) fn insert(&mut self, height: u32, hash: BlockHash) -> Result<(), EngineError> {
        self.check_next(height, &hash)?;
        self.hashes.push(hash);
        self.heights.insert(hash, height);
        Ok(())
    }

    pub(crate) fn hash_for_height(&self, height: u32) -> Option<BlockHash> {
        let position = usize::try_from(height.checked_sub(1)?).ok()?;
        self.hashes.get(position).copied()
    }

    pub(crate) fn height_for_hash(&self, hash: &BlockHash) -> Option<u32> {
        self.heights.get(hash).copied()
    }
}
