//! Background sync loop tests (`Syncer::spawn` / `SyncHandle`).
//!
//! Coverage:
//! - Loop follows a growing source chain
//! - `stop()` wakes a loop sleeping on a long poll interval
//! - Source errors are retried on the next poll
//! - A store error ends the loop and is returned from `stop()`

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::StoreError;
    use crate::sync::tests::helpers::*;
    use crate::sync::{SyncError, Syncer};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn background__follows_growing_chain() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        let chain = MockChain::with_height(10);

        let handle = Syncer::new(store.clone(), MockSource(chain.clone()))
            .spawn(Duration::from_millis(10))
            .unwrap();

        assert!(wait_until(WAIT, || store.block_count().unwrap() == 10));

        chain.grow_to(30);
        assert!(wait_until(WAIT, || store.block_count().unwrap() == 30));

        handle.stop().unwrap();
        assert_eq!(
            store.raw_block_by_height(30).unwrap(),
            Some(remote_block(30))
        );
    }

    /// # Scenario
    /// The loop is idle, waiting on a one-hour poll interval.
    ///
    /// # Expected behavior
    /// `stop()` returns promptly instead of waiting out the interval.
    #[test]
    fn background__stop_wakes_idle_loop() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        let chain = MockChain::with_height(2);

        let handle = Syncer::new(store.clone(), MockSource(chain))
            .spawn(Duration::from_secs(3600))
            .unwrap();
        assert!(wait_until(WAIT, || store.block_count().unwrap() == 2));

        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() < WAIT);
    }

    #[test]
    fn background__source_errors_are_retried() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        let chain = MockChain::with_height(5);
        chain.failures.store(3, Ordering::SeqCst);

        let handle = Syncer::new(store.clone(), MockSource(chain.clone()))
            .spawn(Duration::from_millis(5))
            .unwrap();

        assert!(wait_until(WAIT, || store.block_count().unwrap() == 5));
        assert_eq!(chain.failures.load(Ordering::SeqCst), 0);
        assert!(!handle.is_finished());
        handle.stop().unwrap();
    }

    #[test]
    fn background__store_error_ends_loop() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path());
        let chain = MockChain::with_height(4);
        chain.blocks.lock().unwrap()[3].0 = remote_hash(2);

        let handle = Syncer::new(store.clone(), MockSource(chain))
            .spawn(Duration::from_millis(5))
            .unwrap();

        assert!(wait_until(WAIT, || handle.is_finished()));
        assert_eq!(store.block_count().unwrap(), 3);

        let err = handle.stop().unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(StoreError::InvalidArgument(_))
        ));
    }
}
