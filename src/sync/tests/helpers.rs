use crate::sync::BlockSource;
use crate::{BlockHash, BlockStore, StoreConfig};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open_store(dir: &Path) -> Arc<BlockStore> {
    init_tracing();
    Arc::new(BlockStore::open(dir, StoreConfig::default()).expect("open store"))
}

pub fn remote_hash(height: u32) -> BlockHash {
    let mut bytes = [0xC3u8; 32];
    bytes[28..].copy_from_slice(&height.to_le_bytes());
    BlockHash(bytes)
}

pub fn remote_block(height: u32) -> Vec<u8> {
    format!("block-{height:06}").into_bytes()
}

#[derive(Debug, thiserror::Error)]
#[error("mock node unavailable")]
pub struct Unavailable;

/// Chain state shared between a test and its [`MockSource`].
#[derive(Default)]
pub struct MockChain {
    /// `(hash, raw block)` for heights `1..=len`.
    pub blocks: Mutex<Vec<(BlockHash, Vec<u8>)>>,
    /// Number of upcoming calls that fail with [`Unavailable`].
    pub failures: AtomicU32,
    /// `block_hash` for this height fails once (0 = never).
    pub fail_at_height: AtomicU32,
    /// Height whose `raw_block` call raises `stop_flag` (0 = never).
    pub stop_at: AtomicU32,
    /// Flag to raise when `stop_at` is reached.
    pub stop_flag: Mutex<Option<Arc<AtomicBool>>>,
}

impl MockChain {
    pub fn with_height(height: u32) -> Arc<Self> {
        let chain = Arc::new(Self::default());
        chain.grow_to(height);
        chain
    }

    pub fn grow_to(&self, height: u32) {
        let mut blocks = self.blocks.lock().unwrap();
        while (blocks.len() as u32) < height {
            let h = blocks.len() as u32 + 1;
            blocks.push((remote_hash(h), remote_block(h)));
        }
    }

    fn fail_once(&self) -> Result<(), Unavailable> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Unavailable);
        }
        Ok(())
    }
}

/// In-memory [`BlockSource`] backed by a [`MockChain`].
pub struct MockSource(pub Arc<MockChain>);

impl BlockSource for MockSource {
    type Error = Unavailable;

    fn block_count(&mut self) -> Result<u32, Unavailable> {
        self.0.fail_once()?;
        Ok(self.0.blocks.lock().unwrap().len() as u32)
    }

    fn block_hash(&mut self, height: u32) -> Result<BlockHash, Unavailable> {
        self.0.fail_once()?;
        if self
            .0
            .fail_at_height
            .compare_exchange(height, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(Unavailable);
        }
        let blocks = self.0.blocks.lock().unwrap();
        blocks
            .get(height as usize - 1)
            .map(|(hash, _)| *hash)
            .ok_or(Unavailable)
    }

    fn raw_block(&mut self, hash: &BlockHash) -> Result<Vec<u8>, Unavailable> {
        self.0.fail_once()?;
        let blocks = self.0.blocks.lock().unwrap();
        let position = blocks
            .iter()
            .position(|(h, _)| h == hash)
            .ok_or(Unavailable)?;

        if position as u32 + 1 == self.0.stop_at.load(Ordering::SeqCst) {
            if let Some(flag) = self.0.stop_flag.lock().unwrap().as_ref() {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(blocks[position].1.clone())
    }
}

/// Polls `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
