use std::path::Path;

use crate::record::{BlockHash, BlockRecord, COMPRESSION_NONE};
use crate::segment::{SegmentNaming, SegmentStore};
use tracing_subscriber::EnvFilter;

/// Segment file-name prefix used by all segment tests.
pub const PREFIX: &str = "raw_block";

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic record whose hash bytes are all derived from `height`.
pub fn block(height: u32, payload_len: usize) -> BlockRecord {
    let mut hash = [0u8; 32];
    hash[..4].copy_from_slice(&height.to_le_bytes());
    hash[31] = 0xB1;
    BlockRecord {
        height,
        hash: BlockHash(hash),
        compression: COMPRESSION_NONE,
        payload: (0..payload_len).map(|i| (i as u8) ^ (height as u8)).collect(),
    }
}

/// Opens a segment store rooted at `dir`, resuming at the latest tag.
pub fn open_store(dir: &Path, size_limit: u64) -> SegmentStore {
    init_tracing();
    let naming = SegmentNaming::new(dir, PREFIX);
    let tag = naming.discover_latest_tag().unwrap();
    SegmentStore::open(naming, tag, size_limit).expect("open segment store")
}
