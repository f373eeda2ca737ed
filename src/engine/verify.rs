//! Startup consistency check between the index tip and the current segment.

use tracing::{debug, warn};

use super::EngineError;
use crate::index::{IndexError, IndexStore};
use crate::record::IndexRecord;
use crate::segment::SegmentStore;

/// Checks that the last index entry ends exactly where the current segment
/// ends.
///
/// - Empty index: the current segment must be tag 0 and hold no bytes.
/// - Otherwise: the tip's segment tag must be the current tag and its end
///   offset the current segment's length.
///
/// Returns the tip (or `None` for an empty store). Never modifies either file.
pub(crate) fn verify_tip(
    index: &IndexStore,
    segments: &SegmentStore,
) -> Result<Option<IndexRecord>, EngineError> {
    let (tag, length) = segments.cursor()?;

    let tip = match index.latest() {
        Ok(tip) => tip,
        Err(IndexError::EmptyIndex) => {
            if tag != 0 || length != 0 {
                warn!(tag, length, "empty index but segment data present");
                return Err(EngineError::IndexDataMismatch(format!(
                    "index is empty but current segment is tag {tag} with {length} bytes \
                     (expected tag 0 with 0 bytes)"
                )));
            }
            debug!("empty store verified");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if tip.segment_tag != tag {
        warn!(index_tag = tip.segment_tag, segment_tag = tag, "segment tag mismatch");
        return Err(EngineError::IndexDataMismatch(format!(
            "index tip (height {}) is in segment {}, current segment is {tag}",
            tip.height, tip.segment_tag
        )));
    }

    if tip.end_offset != length {
        warn!(
            index_end = tip.end_offset,
            segment_len = length,
            tag,
            "segment length mismatch"
        );
        return Err(EngineError::IndexDataMismatch(format!(
            "index tip (height {}) ends at offset {} but segment {tag} is {length} bytes",
            tip.height, tip.end_offset
        )));
    }

    debug!(height = tip.height, tag, length, "index tip verified");
    Ok(Some(tip))
}
