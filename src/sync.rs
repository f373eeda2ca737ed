//! # Ingestion driver
//!
//! Pulls blocks from a [`BlockSource`] (typically a full node's RPC
//! interface) and appends them to a [`BlockStore`] in height order.
//!
//! ```text
//!   source.block_count()  ──►  for h in store.block_count()+1 ..= remote:
//!                                  hash = source.block_hash(h)
//!                                  raw  = source.raw_block(&hash)
//!                                  store.append_block(h, hash, 0, raw)
//! ```
//!
//! [`Syncer::sync_to_tip`] does one catch-up pass on the calling thread.
//! [`Syncer::spawn`] repeats it on a background thread, sleeping for the
//! poll interval once caught up; [`SyncHandle::stop`] wakes and joins it.
//!
//! Cancellation is observed only between whole blocks, so a stop request
//! never leaves a block half-ingested.
//!
//! # Failure policy
//!
//! - Source errors (node unreachable, timeouts) are logged and retried on
//!   the next poll.
//! - Store errors end the loop; they are returned from [`SyncHandle::stop`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{BlockHash, BlockStore, COMPRESSION_NONE, StoreError};

#[cfg(test)]
mod tests;

/// Upstream provider of blocks, e.g. a node's `getblockcount` /
/// `getblockhash` / `getblock` RPCs.
pub trait BlockSource {
    /// Transport error type.
    type Error: std::error::Error + Send + 'static;

    /// Height of the source's best block.
    fn block_count(&mut self) -> Result<u32, Self::Error>;

    /// Hash of the block at `height`.
    ///
    /// RPC text is byte-reversed; parse it with [`BlockHash::from_rpc_hex`].
    fn block_hash(&mut self, height: u32) -> Result<BlockHash, Self::Error>;

    /// Serialized block with the given hash.
    fn raw_block(&mut self, hash: &BlockHash) -> Result<Vec<u8>, Self::Error>;
}

/// Errors returned by the ingestion driver.
#[derive(Debug, Error)]
pub enum SyncError<E: std::error::Error + 'static> {
    /// The block source failed.
    #[error("block source error: {0}")]
    Source(#[source] E),

    /// The store rejected a block or failed to persist it.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The background thread could not be started.
    #[error("failed to spawn sync thread: {0}")]
    Spawn(io::Error),

    /// The background thread panicked.
    #[error("sync thread panicked")]
    Panicked,
}

// ------------------------------------------------------------------------------------------------
// Syncer
// ------------------------------------------------------------------------------------------------

/// Drives a [`BlockSource`] into a [`BlockStore`].
pub struct Syncer<S> {
    store: Arc<BlockStore>,
    source: S,
    stop: Arc<AtomicBool>,
}

impl<S: BlockSource> Syncer<S> {
    pub fn new(store: Arc<BlockStore>, source: S) -> Self {
        Self {
            store,
            source,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that makes [`sync_to_tip`](Self::sync_to_tip) return
    /// after the block in progress.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Appends every block the source has beyond the local tip.
    ///
    /// Returns the number of blocks appended. Stops early, between two
    /// blocks, once the stop flag is set.
    pub fn sync_to_tip(&mut self) -> Result<u32, SyncError<S::Error>> {
        let remote = self.source.block_count().map_err(SyncError::Source)?;
        let mut local = self.store.block_count()?;

        if remote <= local {
            debug!(local, remote, "already at source tip");
            return Ok(0);
        }

        let mut appended = 0u32;
        while local < remote {
            if self.stop.load(Ordering::Acquire) {
                info!(local, remote, "sync interrupted by stop request");
                break;
            }

            let height = local + 1;
            let hash = self.source.block_hash(height).map_err(SyncError::Source)?;
            let raw = self.source.raw_block(&hash).map_err(SyncError::Source)?;
            let size = raw.len();
            self.store.append_block(height, hash, COMPRESSION_NONE, raw)?;

            debug!(height, %hash, size, "block ingested");
            appended += 1;
            local = height;
        }

        if appended > 0 {
            info!(appended, height = local, remote, "sync pass finished");
        }
        Ok(appended)
    }

    /// Runs [`sync_to_tip`](Self::sync_to_tip) in a loop on a named
    /// background thread, waiting `poll_interval` between passes.
    pub fn spawn(mut self, poll_interval: Duration) -> Result<SyncHandle<S::Error>, SyncError<S::Error>>
    where
        S: Send + 'static,
    {
        let (wake_tx, wake_rx) = channel::bounded::<()>(1);
        let stop = self.stop_flag();

        let thread = thread::Builder::new()
            .name("rawblockdb-sync".into())
            .spawn(move || {
                info!(?poll_interval, "sync loop started");
                loop {
                    match self.sync_to_tip() {
                        Ok(_) => {}
                        Err(SyncError::Source(e)) => {
                            warn!("block source error, retrying in {poll_interval:?}: {e}");
                        }
                        Err(e) => {
                            error!("sync loop stopped: {e}");
                            return Err(e);
                        }
                    }

                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    match wake_rx.recv_timeout(poll_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("sync loop stopped");
                Ok(())
            })
            .map_err(SyncError::Spawn)?;

        Ok(SyncHandle {
            stop,
            wake: wake_tx,
            thread: Some(thread),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// SyncHandle
// ------------------------------------------------------------------------------------------------

/// Handle to a background sync loop started by [`Syncer::spawn`].
///
/// Dropping the handle stops and joins the loop, discarding its result.
pub struct SyncHandle<E: std::error::Error + 'static> {
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
    thread: Option<thread::JoinHandle<Result<(), SyncError<E>>>>,
}

impl<E: std::error::Error + 'static> SyncHandle<E> {
    /// Whether the loop has already exited (after a store error).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Requests a stop, wakes the loop if it is waiting, and joins it.
    ///
    /// A block being ingested is finished first. Returns the store error
    /// that ended the loop, if any.
    pub fn stop(mut self) -> Result<(), SyncError<E>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), SyncError<E>> {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake.try_send(());

        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| SyncError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl<E: std::error::Error + 'static> Drop for SyncHandle<E> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("sync loop ended with error: {e}");
        }
    }
}
