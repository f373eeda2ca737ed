//! Segment rotation as seen through the engine.
//!
//! Coverage:
//! - The block that triggers rotation is indexed at `tag + 1`, offset 0
//! - Blocks in older segments stay readable
//! - Reopen after rotation resumes on the newest segment
//! - Heights are continuous across segment boundaries

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::tests::helpers::*;
    use tempfile::TempDir;

    /// # Scenario
    /// Segment limit of 100 bytes with 61-byte records.
    ///
    /// # Actions
    /// Append blocks 1..=5.
    ///
    /// # Expected behavior
    /// Segment 0 holds blocks 1-2 (122 bytes), block 3 starts segment 1 at
    /// offset 0, block 5 starts segment 2.
    #[test]
    fn rotation__triggering_block_starts_next_segment() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(tmp.path(), small_segment_config(100));

        let entries = append_range(&engine, 1, 5, 23);

        let placement: Vec<_> = entries
            .iter()
            .map(|e| (e.height, e.segment_tag, e.start_offset, e.end_offset))
            .collect();
        assert_eq!(
            placement,
            vec![
                (1, 0, 0, 61),
                (2, 0, 61, 122),
                (3, 1, 0, 61),
                (4, 1, 61, 122),
                (5, 2, 0, 61),
            ]
        );

        assert!(tmp.path().join("raw_block.0").exists());
        assert!(tmp.path().join("raw_block.1").exists());
        assert!(tmp.path().join("raw_block.2").exists());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.current_segment, 2);
        assert_eq!(stats.segment_count, 3);
        assert_eq!(stats.write_offset, 61);
    }

    #[test]
    fn rotation__old_segments_stay_readable() {
        let tmp = TempDir::new().unwrap();
        let engine = open_engine(tmp.path(), small_segment_config(100));
        append_range(&engine, 1, 9, 23);

        for h in 1..=9 {
            assert_eq!(
                engine.raw_block_by_hash(&hash_of(h)).unwrap(),
                Some(payload_of(h, 23))
            );
        }
    }

    /// # Scenario
    /// Rotate, drop the engine, reopen and keep appending.
    ///
    /// # Expected behavior
    /// The reopened engine verifies against the newest segment and the
    /// next block continues in it.
    #[test]
    fn rotation__reopen_resumes_newest_segment() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open_engine(tmp.path(), small_segment_config(100));
            append_range(&engine, 1, 3, 23);
            engine.close().unwrap();
        }

        let engine = open_engine(tmp.path(), small_segment_config(100));
        assert_eq!(engine.block_count().unwrap(), 3);
        assert_eq!(engine.stats().unwrap().current_segment, 1);

        let entries = append_range(&engine, 4, 5, 23);
        assert_eq!(
            (entries[0].segment_tag, entries[0].start_offset),
            (1, 61)
        );
        assert_eq!(
            (entries[1].segment_tag, entries[1].start_offset),
            (2, 0)
        );
    }

    #[test]
    fn rotation__single_oversized_block_per_segment() {
        let tmp = TempDir::new().unwrap();
        // Every record is larger than the limit.
        let engine = open_engine(tmp.path(), small_segment_config(1));
        let entries = append_range(&engine, 1, 4, 64);

        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.segment_tag, i as u32);
            assert_eq!(entry.start_offset, 0);
        }
    }
}
