use crate::engine::{Engine, EngineConfig};
use crate::record::{BlockHash, COMPRESSION_NONE, IndexRecord};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Default file names with a 1 GiB segment limit (no rotation in tests).
pub fn default_config() -> EngineConfig {
    init_tracing();
    EngineConfig::default()
}

/// Tiny segment limit so a handful of blocks forces rotation.
pub fn small_segment_config(limit: u64) -> EngineConfig {
    init_tracing();
    EngineConfig {
        segment_size_limit: limit,
        ..EngineConfig::default()
    }
}

pub fn open_engine(dir: &Path, config: EngineConfig) -> Engine {
    Engine::open(dir, config).expect("open engine")
}

/// Deterministic, unique hash for `height`.
pub fn hash_of(height: u32) -> BlockHash {
    let mut bytes = [0x5Au8; 32];
    bytes[..4].copy_from_slice(&height.to_be_bytes());
    BlockHash(bytes)
}

/// Deterministic payload for `height`.
pub fn payload_of(height: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ height as u8).collect()
}

/// Appends blocks `from..=to` with payloads of `len` bytes.
pub fn append_range(engine: &Engine, from: u32, to: u32, len: usize) -> Vec<IndexRecord> {
    (from..=to)
        .map(|h| {
            engine
                .append_block(h, hash_of(h), COMPRESSION_NONE, payload_of(h, len))
                .expect("append_block")
        })
        .collect()
}
