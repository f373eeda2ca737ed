//! # Index Rebuilder
//!
//! Regenerates the index purely from segment contents. This is the only
//! repair path the store has; it is never run implicitly by
//! [`Engine::open`](super::Engine::open).
//!
//! ## Procedure
//!
//! 1. Probe segment tags upward from 0 to find the last one.
//! 2. Memory-map each segment read-only and decode [`BlockRecord`]s from
//!    offset 0 until the decoded sizes add up to the file length.
//! 3. Emit one [`IndexRecord`] per block into `<index>.tmp`, checking that
//!    heights continue the chain and hashes are unique.
//! 4. Sync the temporary file, rename it over the index and fsync the
//!    directory.
//! 5. Remove empty segments above the last one holding data (left behind
//!    when a crash follows a rotation), so the rebuilt index tip lands in
//!    the current segment again.
//!
//! Any failure removes the temporary file and leaves the previous index
//! exactly as it was. The output depends only on segment bytes, so two
//! rebuilds of the same data produce byte-identical indexes.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use tracing::{debug, info, warn};

use super::{EngineConfig, EngineError};
use crate::encoding::{Decode, Encode};
use crate::record::{BlockHash, BlockRecord, IndexRecord};
use crate::segment::SegmentNaming;

const REBUILD_TMP_SUFFIX: &str = ".tmp";

/// Outcome of a successful rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Number of segment files left in the store.
    pub segments: u32,
    /// Number of blocks indexed (= new chain height).
    pub blocks: u32,
    /// Size of the new index in bytes.
    pub index_bytes: u64,
    /// CRC32 of the new index file.
    pub index_crc32: u32,
}

/// Rebuilds the index of the store in `dir`.
pub(crate) fn rebuild_index(
    dir: &Path,
    config: &EngineConfig,
) -> Result<RebuildSummary, EngineError> {
    let naming = SegmentNaming::new(dir, config.segment_prefix.clone());
    let last_tag = naming.discover_latest_tag()?;
    let index_path = dir.join(&config.index_name);
    let tmp_path = dir.join(format!("{}{}", config.index_name, REBUILD_TMP_SUFFIX));

    info!(path = %dir.display(), last_tag, "rebuilding block index");

    let (mut summary, keep_tag) = match write_index(&naming, last_tag, &tmp_path) {
        Ok(done) => done,
        Err(e) => {
            warn!("index rebuild aborted, previous index kept: {e}");
            if let Err(rm) = fs::remove_file(&tmp_path) {
                debug!("could not remove {}: {rm}", tmp_path.display());
            }
            return Err(e);
        }
    };

    fs::rename(&tmp_path, &index_path)?;

    for tag in (keep_tag + 1..=last_tag).rev() {
        info!(tag, "removing empty trailing segment");
        fs::remove_file(naming.path(tag))?;
        summary.segments -= 1;
    }
    File::open(dir)?.sync_all()?;

    info!(
        segments = summary.segments,
        blocks = summary.blocks,
        index_bytes = summary.index_bytes,
        crc32 = format_args!("{:08x}", summary.index_crc32),
        "block index rebuilt"
    );
    Ok(summary)
}

/// Scans all segments and writes the new index to `tmp_path`.
///
/// Also returns the highest tag that must be kept: the last segment holding
/// data, or 0.
fn write_index(
    naming: &SegmentNaming,
    last_tag: u32,
    tmp_path: &Path,
) -> Result<(RebuildSummary, u32), EngineError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)?;
    let mut out = BufWriter::new(file);

    let mut hasher = Crc32::new();
    let mut seen: HashSet<BlockHash> = HashSet::new();
    let mut blocks = 0u32;
    let mut segments = 0u32;
    let mut keep_tag = 0u32;
    let mut buf = Vec::with_capacity(IndexRecord::SIZE);

    for tag in 0..=last_tag {
        let file = match File::open(naming.path(tag)) {
            Ok(file) => file,
            // A store that never received a block may not even have segment 0.
            Err(e) if e.kind() == io::ErrorKind::NotFound && last_tag == 0 => break,
            Err(e) => return Err(e.into()),
        };
        segments += 1;

        if file.metadata()?.len() == 0 {
            debug!(tag, "skipping empty segment");
            continue;
        }

        keep_tag = tag;

        // SAFETY: segments below the current tag are immutable, and the
        // store must not be open while rebuilding, so nothing writes to the
        // file while it is mapped. The map is read-only and every slice is
        // bounds-checked by the decoder.
        let mmap = unsafe { Mmap::map(&file)? };

        let mut offset = 0usize;
        while offset < mmap.len() {
            let at = offset as u64;
            let corrupt = move |reason: String| EngineError::CorruptRecord {
                tag,
                offset: at,
                reason,
            };

            let (record, consumed) =
                BlockRecord::decode_from(&mmap[offset..]).map_err(|e| corrupt(e.to_string()))?;

            let expected = blocks
                .checked_add(1)
                .ok_or_else(|| corrupt("chain height overflow".into()))?;
            if record.height != expected {
                return Err(corrupt(format!(
                    "expected height {expected}, found {}",
                    record.height
                )));
            }
            if !seen.insert(record.hash) {
                return Err(corrupt(format!(
                    "duplicate hash {} at height {}",
                    record.hash, record.height
                )));
            }

            let end = offset + consumed;
            let (Ok(start_offset), Ok(end_offset)) = (u32::try_from(offset), u32::try_from(end))
            else {
                return Err(corrupt(format!("record end {end} exceeds u32 offsets")));
            };

            let entry = IndexRecord {
                height: record.height,
                hash: record.hash,
                payload_size: record.payload_size(),
                segment_tag: tag,
                start_offset,
                end_offset,
            };
            buf.clear();
            entry.encode_to(&mut buf)?;
            hasher.update(&buf);
            out.write_all(&buf)?;

            blocks = expected;
            offset = end;
        }

        debug!(tag, blocks, bytes = mmap.len(), "segment indexed");
    }

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    let summary = RebuildSummary {
        segments,
        blocks,
        index_bytes: u64::from(blocks) * IndexRecord::SIZE as u64,
        index_crc32: hasher.finalize(),
    };
    Ok((summary, keep_tag))
}
