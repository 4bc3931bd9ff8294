#![forbid(unsafe_code)]
//! Shared identifiers and on-disk constants for the dedup fsck core.
//!
//! Everything here is plain data: node ids, block addresses, segment
//! numbers, the closed set of node-block kinds, and the persisted dedup
//! flag bits. Parsing helpers return [`ParseError`]; the runtime error type
//! lives in `dfsck-error`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of every metadata and data block handled by the checker.
pub const BLOCK_SIZE: usize = 4096;

/// Number of `u32` address slots in the inode body (`i_addr`).
pub const DEF_ADDRS_PER_INODE: usize = 923;
/// Number of address slots in a direct node block.
pub const ADDRS_PER_BLOCK: usize = 1018;
/// Number of child nid slots in an (double) indirect node block.
pub const NIDS_PER_BLOCK: usize = 1018;
/// Inline xattr reservation (in address slots) when the inode does not
/// carry an explicit size.
pub const DEFAULT_INLINE_XATTR_ADDRS: usize = 50;
/// Number of child node slots in an inode (`i_nid`).
pub const NODES_PER_INODE: usize = 5;

/// Superblock feature bit announcing content deduplication.
pub const FEATURE_DEDUP: u32 = 0x8000;

/// Magic value stored in the extra-flags block when a full check is due
/// (ASCII "FSCK").
pub const EXTRA_NEED_FSCK_FLAG: u32 = 0x4653_434B;

/// Identifier of a node block. Zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Physical block address on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddress(pub u32);

impl BlockAddress {
    /// Block not allocated.
    pub const NULL: Self = Self(0);
    /// Block allocated but not yet tracked by the validity bitmap.
    pub const NEW: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[must_use]
    pub fn is_new(self) -> bool {
        self == Self::NEW
    }

    /// True for `NULL` and `NEW`.
    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self.is_null() || self.is_new()
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }
}

/// Segment number within the main area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegNo(pub u32);

/// Structural role of a node block.
///
/// The reclamation recursion follows a fixed shape: an inode points at
/// direct, indirect, and double-indirect nodes; a double-indirect node
/// points at indirect nodes; an indirect node points at direct nodes; a
/// direct node points only at data blocks. Depth below an inode is at most
/// [`NodeType::MAX_DEPTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Inode,
    DirectNode,
    IndirectNode,
    DoubleIndirectNode,
}

impl NodeType {
    pub const MAX_DEPTH: usize = 3;

    /// Type of the children referenced by a node of this type, or `None`
    /// when the node only references data blocks.
    #[must_use]
    pub fn child_type(self) -> Option<Self> {
        match self {
            Self::Inode | Self::DirectNode => None,
            Self::IndirectNode => Some(Self::DirectNode),
            Self::DoubleIndirectNode => Some(Self::IndirectNode),
        }
    }

    /// Type implied by an inode's `i_nid` slot.
    #[must_use]
    pub fn for_inode_slot(slot: InodeNidSlot) -> Self {
        match slot {
            InodeNidSlot::Direct0 | InodeNidSlot::Direct1 => Self::DirectNode,
            InodeNidSlot::Indirect0 | InodeNidSlot::Indirect1 => Self::IndirectNode,
            InodeNidSlot::DoubleIndirect => Self::DoubleIndirectNode,
        }
    }
}

/// Semantic role of each of the five `i_nid` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeNidSlot {
    Direct0,
    Direct1,
    Indirect0,
    Indirect1,
    DoubleIndirect,
}

impl InodeNidSlot {
    pub const ALL: [Self; NODES_PER_INODE] = [
        Self::Direct0,
        Self::Direct1,
        Self::Indirect0,
        Self::Indirect1,
        Self::DoubleIndirect,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Direct0 => 0,
            Self::Direct1 => 1,
            Self::Indirect0 => 2,
            Self::Indirect1 => 3,
            Self::DoubleIndirect => 4,
        }
    }
}

/// Block category used to partition readahead lanes and summary tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentCategory {
    Data,
    Node,
}

impl SegmentCategory {
    pub const ALL: [Self; 2] = [Self::Data, Self::Node];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Data => 0,
            Self::Node => 1,
        }
    }
}

bitflags! {
    /// Persisted dedup state bits (`i_dedup_flags`).
    ///
    /// Bit `0x4` is unassigned on disk and must stay that way.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DedupFlags: u32 {
        const DEDUPED = 0x0000_0001;
        const INNER = 0x0000_0002;
        const REVOKE = 0x0000_0008;
        const DOING_DEDUP = 0x0000_0010;
    }
}

/// File type the generic node checker validates an inode against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Holder of deduplicated data shared by outer inodes.
    DedupInner,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Overwrite a little-endian `u32` in place.
#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let Some(end) = offset.checked_add(4) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for SegNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SegmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Node => write!(f, "node"),
        }
    }
}
