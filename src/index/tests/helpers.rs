use crate::record::{BlockHash, IndexRecord};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Index entry for `height`, laid out as if every block record were
/// `record_len` bytes in segment 0.
pub fn entry(height: u32, record_len: u32) -> IndexRecord {
    let mut hash = [0u8; 32];
    hash[..4].copy_from_slice(&height.to_be_bytes());
    IndexRecord {
        height,
        hash: BlockHash(hash),
        payload_size: record_len - 38,
        segment_tag: 0,
        start_offset: (height - 1) * record_len,
        end_offset: height * record_len,
    }
}
