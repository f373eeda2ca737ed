//! Index rebuild tests.
//!
//! Coverage:
//! - Rebuilding twice yields byte-identical indexes (and equal CRCs)
//! - Rebuilt index equals the one written by normal appends
//! - Rebuild repairs a missing or partially-written index
//! - Rebuild spans rotated segments
//! - Rebuild removes the empty segment left by a crash after rotation
//! - Corrupt segment data aborts the rebuild and keeps the old index
//! - Rebuild of an empty directory yields an empty index

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineError};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn index_bytes(dir: &std::path::Path) -> Vec<u8> {
        fs::read(dir.join("raw_block_index")).unwrap()
    }

    /// # Scenario
    /// Rebuild the index of a healthy store twice.
    ///
    /// # Expected behavior
    /// Both rebuilt files equal the index written by the appends, and the
    /// two summaries are equal.
    #[test]
    fn rebuild__twice_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path(), small_segment_config(500));
            append_range(&engine, 1, 30, 40);
            engine.close().unwrap();
        }
        let original = index_bytes(tmp.path());

        let first = Engine::rebuild_index(tmp.path(), &small_segment_config(500)).unwrap();
        let after_first = index_bytes(tmp.path());
        let second = Engine::rebuild_index(tmp.path(), &small_segment_config(500)).unwrap();
        let after_second = index_bytes(tmp.path());

        assert_eq!(after_first, original);
        assert_eq!(after_second, after_first);
        assert_eq!(first, second);
        assert_eq!(first.blocks, 30);
        assert_eq!(first.index_bytes, 30 * 52);
        assert_eq!(first.index_crc32, crc32fast::hash(&original));
        assert!(first.segments > 1);
        assert!(!tmp.path().join("raw_block_index.tmp").exists());
    }

    #[test]
    fn rebuild__restores_missing_index() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path(), small_segment_config(300));
            append_range(&engine, 1, 12, 50);
        }
        fs::remove_file(tmp.path().join("raw_block_index")).unwrap();

        let summary = Engine::rebuild_index(tmp.path(), &small_segment_config(300)).unwrap();
        assert_eq!(summary.blocks, 12);

        let engine = open_engine(tmp.path(), small_segment_config(300));
        assert_eq!(engine.block_count().unwrap(), 12);
        for h in 1..=12 {
            assert_eq!(engine.height_for_hash(&hash_of(h)).unwrap(), Some(h));
            assert_eq!(engine.raw_block_by_height(h).unwrap(), Some(payload_of(h, 50)));
        }
    }

    /// # Scenario
    /// A crash during an index append leaves a partial trailing record.
    ///
    /// # Expected behavior
    /// Open fails with `InvalidIndexSize`; after a rebuild it succeeds with
    /// the full chain.
    #[test]
    fn rebuild__repairs_partial_index_record() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path(), default_config());
            append_range(&engine, 1, 4, 10);
        }
        OpenOptions::new()
            .append(true)
            .open(tmp.path().join("raw_block_index"))
            .unwrap()
            .write_all(&[0xEE; 20])
            .unwrap();
        assert!(Engine::open(tmp.path(), default_config()).is_err());

        Engine::rebuild_index(tmp.path(), &default_config()).unwrap();

        let engine = open_engine(tmp.path(), default_config());
        assert_eq!(engine.block_count().unwrap(), 4);
    }

    #[test]
    fn rebuild__removes_empty_segment_left_after_rotation() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path(), default_config());
            append_range(&engine, 1, 3, 10);
        }
        fs::write(tmp.path().join("raw_block.1"), b"").unwrap();
        assert!(Engine::open(tmp.path(), default_config()).is_err());

        let summary = Engine::rebuild_index(tmp.path(), &default_config()).unwrap();
        assert_eq!(summary.segments, 1);
        assert!(!tmp.path().join("raw_block.1").exists());

        let engine = open_engine(tmp.path(), default_config());
        assert_eq!(engine.block_count().unwrap(), 3);
        append_range(&engine, 4, 4, 10);
    }

    /// # Scenario
    /// A torn write leaves half a block record at the end of the segment.
    ///
    /// # Expected behavior
    /// Rebuild fails with `CorruptRecord` at the offset of the torn record,
    /// the previous index is untouched and no temporary file remains.
    #[test]
    fn rebuild__torn_tail_aborts_and_keeps_index() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path(), default_config());
            append_range(&engine, 1, 3, 10);
        }
        let before = index_bytes(tmp.path());
        let segment = tmp.path().join("raw_block.0");
        let end = fs::metadata(&segment).unwrap().len();
        OpenOptions::new()
            .append(true)
            .open(&segment)
            .unwrap()
            .write_all(&[4, 0, 0, 0, 1, 2, 3])
            .unwrap();

        let err = Engine::rebuild_index(tmp.path(), &default_config()).unwrap_err();
        match err {
            EngineError::CorruptRecord { tag, offset, .. } => {
                assert_eq!(tag, 0);
                assert_eq!(offset, end);
            }
            other => panic!("expected CorruptRecord, got {other:?}"),
        }

        assert_eq!(index_bytes(tmp.path()), before);
        assert!(!tmp.path().join("raw_block_index.tmp").exists());
    }

    #[test]
    fn rebuild__height_gap_aborts() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path(), default_config());
            append_range(&engine, 1, 3, 10);
        }
        // Overwrite the height of block 2 (second record starts at 48).
        let segment = tmp.path().join("raw_block.0");
        let mut bytes = fs::read(&segment).unwrap();
        bytes[48..52].copy_from_slice(&7u32.to_le_bytes());
        fs::write(&segment, &bytes).unwrap();

        let err = Engine::rebuild_index(tmp.path(), &default_config()).unwrap_err();
        match err {
            EngineError::CorruptRecord { offset, reason, .. } => {
                assert_eq!(offset, 48);
                assert!(reason.contains("expected height 2"), "{reason}");
            }
            other => panic!("expected CorruptRecord, got {other:?}"),
        }
    }

    #[test]
    fn rebuild__empty_directory() {
        let tmp = TempDir::new().unwrap();

        let summary = Engine::rebuild_index(tmp.path(), &default_config()).unwrap();
        assert_eq!(summary.blocks, 0);
        assert_eq!(summary.index_bytes, 0);
        assert_eq!(index_bytes(tmp.path()), Vec::<u8>::new());

        let engine = open_engine(tmp.path(), default_config());
        assert_eq!(engine.block_count().unwrap(), 0);
    }
}
