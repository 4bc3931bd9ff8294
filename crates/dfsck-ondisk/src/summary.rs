//! Segment summary blocks.
//!
//! Only the footer is interpreted here: its `entry_type` byte says whether
//! the segment holds node blocks or data blocks. The per-slot entries are
//! opaque to the dedup checker.

use dfsck_types::{BLOCK_SIZE, ParseError, SegmentCategory, read_le_u32, read_u8};

pub const SUMMARY_ENTRY_TYPE: usize = BLOCK_SIZE - 5;
pub const SUMMARY_CHECK_SUM: usize = BLOCK_SIZE - 4;
pub const SUMMARY_TYPE_DATA: u8 = 0;
pub const SUMMARY_TYPE_NODE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryFooter {
    pub entry_type: u8,
    pub check_sum: u32,
}

impl SummaryFooter {
    /// Category the footer claims. Any non-node value reads as data.
    #[must_use]
    pub fn category(&self) -> SegmentCategory {
        if self.entry_type == SUMMARY_TYPE_NODE {
            SegmentCategory::Node
        } else {
            SegmentCategory::Data
        }
    }
}

/// Owned summary block buffer.
///
/// Invariant: length == [`BLOCK_SIZE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryBlock {
    bytes: Vec<u8>,
}

impl SummaryBlock {
    pub fn new(bytes: Vec<u8>) -> Result<Self, ParseError> {
        if bytes.len() != BLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn footer(&self) -> Result<SummaryFooter, ParseError> {
        Ok(SummaryFooter {
            entry_type: read_u8(&self.bytes, SUMMARY_ENTRY_TYPE)?,
            check_sum: read_le_u32(&self.bytes, SUMMARY_CHECK_SUM)?,
        })
    }

    /// Category recorded in the footer.
    #[must_use]
    pub fn category(&self) -> SegmentCategory {
        // Length is fixed at construction, so the footer read cannot fail.
        self.footer()
            .map_or(SegmentCategory::Data, |footer| footer.category())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format_summary;

    #[test]
    fn footer_category_round_trips() {
        let node = SummaryBlock::new(format_summary(SegmentCategory::Node)).expect("node");
        let data = SummaryBlock::new(format_summary(SegmentCategory::Data)).expect("data");
        assert_eq!(node.category(), SegmentCategory::Node);
        assert_eq!(data.category(), SegmentCategory::Data);
        assert_eq!(node.footer().expect("footer").entry_type, SUMMARY_TYPE_NODE);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(SummaryBlock::new(vec![0_u8; 512]).is_err());
    }
}
