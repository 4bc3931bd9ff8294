//! Extra-flags block, stored in the last block of checkpoint segment 0.
//!
//! Layout: `needFsck: u32` at offset 0, 4088 reserved bytes, `crc: u32` at
//! offset 4092. The crc is carried but not verified.

use dfsck_types::{BLOCK_SIZE, EXTRA_NEED_FSCK_FLAG, ParseError, read_le_u32, write_le_u32};

const NEED_FSCK: usize = 0;
const CRC: usize = BLOCK_SIZE - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraFlagsBlock {
    pub need_fsck: u32,
    pub crc: u32,
}

impl ExtraFlagsBlock {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() != BLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        Ok(Self {
            need_fsck: read_le_u32(block, NEED_FSCK)?,
            crc: read_le_u32(block, CRC)?,
        })
    }

    #[must_use]
    pub fn needs_fsck(&self) -> bool {
        self.need_fsck == EXTRA_NEED_FSCK_FLAG
    }
}

/// Zero the `needFsck` field of a raw extra-flags block.
pub fn clear_need_fsck(block: &mut [u8]) -> Result<(), ParseError> {
    write_le_u32(block, NEED_FSCK, 0)
}
