//! Node block views: inode, direct node, (double) indirect node.
//!
//! Every node block ends with a 24-byte footer naming the node id it was
//! written for and the inode that owns it. An inode block is a node block
//! whose footer has `nid == ino`.

use dfsck_types::{
    ADDRS_PER_BLOCK, BLOCK_SIZE, BlockAddress, DEF_ADDRS_PER_INODE, DEFAULT_INLINE_XATTR_ADDRS,
    DedupFlags, FEATURE_DEDUP, NIDS_PER_BLOCK, NODES_PER_INODE, NodeId, ParseError, read_le_u16,
    read_le_u32, read_le_u64, read_u8, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── Layout ──────────────────────────────────────────────────────────────────

pub const FOOTER_OFFSET: usize = BLOCK_SIZE - 24;
const FOOTER_NID: usize = FOOTER_OFFSET;
const FOOTER_INO: usize = FOOTER_OFFSET + 4;
const FOOTER_FLAG: usize = FOOTER_OFFSET + 8;
const FOOTER_CP_VER: usize = FOOTER_OFFSET + 12;
const FOOTER_NEXT_BLKADDR: usize = FOOTER_OFFSET + 20;

pub const I_MODE: usize = 0;
pub const I_INLINE: usize = 3;
pub const I_LINKS: usize = 12;
pub const I_XATTR_NID: usize = 76;
pub const I_EXT: usize = 348;
pub const I_ADDR: usize = 360;
pub const I_NID: usize = I_ADDR + DEF_ADDRS_PER_INODE * 4;

/// `i_inline` bit: inline xattr space is reserved at the end of `i_addr`.
pub const INLINE_XATTR: u8 = 0x01;
/// `i_inline` bit: the extra-attribute region occupies the head of `i_addr`.
pub const EXTRA_ATTR: u8 = 0x20;

/// Offsets inside the extra-attribute region (relative to `I_ADDR`).
pub const EXTRA_ISIZE: usize = 0;
pub const EXTRA_INLINE_XATTR_SIZE: usize = 2;
pub const EXTRA_DEDUP_FLAGS: usize = 36;
pub const EXTRA_INNER_INO: usize = 40;
/// Minimum `i_extra_isize` for the dedup fields to be present.
pub const EXTRA_DEDUP_FIELDS_END: u16 = 44;

// ── Footer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFooter {
    pub nid: NodeId,
    pub ino: NodeId,
    pub flag: u32,
    pub cp_ver: u64,
    pub next_blkaddr: BlockAddress,
}

impl NodeFooter {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        ensure_block(block)?;
        Ok(Self {
            nid: NodeId(read_le_u32(block, FOOTER_NID)?),
            ino: NodeId(read_le_u32(block, FOOTER_INO)?),
            flag: read_le_u32(block, FOOTER_FLAG)?,
            cp_ver: read_le_u64(block, FOOTER_CP_VER)?,
            next_blkaddr: BlockAddress(read_le_u32(block, FOOTER_NEXT_BLKADDR)?),
        })
    }

    #[must_use]
    pub fn is_inode(&self) -> bool {
        self.nid == self.ino
    }
}

fn ensure_block(block: &[u8]) -> Result<(), ParseError> {
    if block.len() != BLOCK_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BLOCK_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }
    Ok(())
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Extent-cache record stored in the inode (`i_ext`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentInfo {
    pub fofs: u32,
    pub blk: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeBlock {
    pub footer: NodeFooter,
    pub mode: u16,
    pub inline: u8,
    pub links: u32,
    pub xattr_nid: NodeId,
    pub extent: ExtentInfo,
    /// Zero when the inode has no extra-attribute region.
    pub extra_isize: u16,
    pub inline_xattr_size: u16,
    /// Raw `i_dedup_flags`, present only when the region covers it.
    pub dedup_flags: Option<u32>,
    /// Raw `i_inner_ino`, present only when the region covers it.
    pub inner_ino: Option<NodeId>,
    /// Data block addresses owned directly by the inode.
    pub addrs: Vec<BlockAddress>,
    pub nids: [NodeId; NODES_PER_INODE],
}

impl InodeBlock {
    /// Parse an inode from a full node block.
    ///
    /// The footer is parsed but not required to describe an inode; callers
    /// that care check [`NodeFooter::is_inode`].
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        ensure_block(block)?;
        let footer = NodeFooter::parse_from_block(block)?;
        let inline = read_u8(block, I_INLINE)?;

        let has_extra = inline & EXTRA_ATTR != 0;
        let (extra_isize, inline_xattr_size) = if has_extra {
            (
                read_le_u16(block, I_ADDR + EXTRA_ISIZE)?,
                read_le_u16(block, I_ADDR + EXTRA_INLINE_XATTR_SIZE)?,
            )
        } else {
            (0, 0)
        };
        if usize::from(extra_isize) > DEF_ADDRS_PER_INODE * 4 || extra_isize % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "i_extra_isize",
                reason: "must be a multiple of 4 inside i_addr",
            });
        }

        let (dedup_flags, inner_ino) = if extra_isize >= EXTRA_DEDUP_FIELDS_END {
            (
                Some(read_le_u32(block, I_ADDR + EXTRA_DEDUP_FLAGS)?),
                Some(NodeId(read_le_u32(block, I_ADDR + EXTRA_INNER_INO)?)),
            )
        } else {
            (None, None)
        };

        let inline_xattr_addrs = if inline & INLINE_XATTR == 0 {
            0
        } else if has_extra && inline_xattr_size != 0 {
            usize::from(inline_xattr_size)
        } else {
            DEFAULT_INLINE_XATTR_ADDRS
        };
        let first = usize::from(extra_isize) / 4;
        let Some(end) = DEF_ADDRS_PER_INODE.checked_sub(inline_xattr_addrs) else {
            return Err(ParseError::InvalidField {
                field: "i_inline_xattr_size",
                reason: "larger than i_addr",
            });
        };
        if first > end {
            return Err(ParseError::InvalidField {
                field: "i_extra_isize",
                reason: "extra region overlaps inline xattr space",
            });
        }
        let addrs = (first..end)
            .map(|idx| read_le_u32(block, I_ADDR + idx * 4).map(BlockAddress))
            .collect::<Result<Vec<_>, _>>()?;

        let mut nids = [NodeId::NONE; NODES_PER_INODE];
        for (idx, nid) in nids.iter_mut().enumerate() {
            *nid = NodeId(read_le_u32(block, I_NID + idx * 4)?);
        }

        Ok(Self {
            footer,
            mode: read_le_u16(block, I_MODE)?,
            inline,
            links: read_le_u32(block, I_LINKS)?,
            xattr_nid: NodeId(read_le_u32(block, I_XATTR_NID)?),
            extent: ExtentInfo {
                fofs: read_le_u32(block, I_EXT)?,
                blk: read_le_u32(block, I_EXT + 4)?,
                len: read_le_u32(block, I_EXT + 8)?,
            },
            extra_isize,
            inline_xattr_size,
            dedup_flags,
            inner_ino,
            addrs,
            nids,
        })
    }

    #[must_use]
    pub fn has_extra_attr(&self) -> bool {
        self.inline & EXTRA_ATTR != 0
    }

    /// Whether the dedup fields may be interpreted at all: the block is an
    /// inode, the filesystem enables dedup, and the extra region is large
    /// enough to contain `i_inner_ino`.
    #[must_use]
    pub fn dedup_fields_present(&self, features: u32) -> bool {
        self.footer.is_inode()
            && features & FEATURE_DEDUP != 0
            && self.has_extra_attr()
            && self.inner_ino.is_some()
    }

    /// Dedup flags with unknown bits (including the reserved `0x4`) dropped.
    #[must_use]
    pub fn dedup_flags(&self) -> DedupFlags {
        DedupFlags::from_bits_truncate(self.dedup_flags.unwrap_or(0))
    }
}

/// Rewrite `i_links` of a raw inode block in place. Nothing else changes.
pub fn set_inode_links(block: &mut [u8], links: u32) -> Result<(), ParseError> {
    ensure_block(block)?;
    write_le_u32(block, I_LINKS, links)
}

// ── Direct / indirect nodes ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectNode {
    pub footer: NodeFooter,
    pub addrs: Vec<BlockAddress>,
}

impl DirectNode {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        ensure_block(block)?;
        let addrs = (0..ADDRS_PER_BLOCK)
            .map(|idx| read_le_u32(block, idx * 4).map(BlockAddress))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            footer: NodeFooter::parse_from_block(block)?,
            addrs,
        })
    }
}

/// Indirect and double-indirect nodes share this layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectNode {
    pub footer: NodeFooter,
    pub nids: Vec<NodeId>,
}

impl IndirectNode {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        ensure_block(block)?;
        let nids = (0..NIDS_PER_BLOCK)
            .map(|idx| read_le_u32(block, idx * 4).map(NodeId))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            footer: NodeFooter::parse_from_block(block)?,
            nids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{InodeSpec, format_direct_node, format_indirect_node, format_inode};

    #[test]
    fn footer_identifies_inodes() {
        let block = format_inode(&InodeSpec::new(NodeId(7)));
        let footer = NodeFooter::parse_from_block(&block).expect("footer");
        assert_eq!(footer.nid, NodeId(7));
        assert!(footer.is_inode());

        let dnode = format_direct_node(NodeId(8), NodeId(7), &[]);
        let footer = NodeFooter::parse_from_block(&dnode).expect("footer");
        assert!(!footer.is_inode());
    }

    #[test]
    fn rejects_short_block() {
        assert!(matches!(
            InodeBlock::parse_from_block(&[0_u8; 100]),
            Err(ParseError::InsufficientData { needed: 4096, .. })
        ));
    }

    #[test]
    fn plain_inode_uses_every_address_slot() {
        let mut spec = InodeSpec::new(NodeId(3));
        spec.links = 2;
        spec.addrs = vec![BlockAddress(100), BlockAddress::NEW];
        let inode = InodeBlock::parse_from_block(&format_inode(&spec)).expect("inode");
        assert_eq!(inode.links, 2);
        assert_eq!(inode.addrs.len(), DEF_ADDRS_PER_INODE);
        assert_eq!(inode.addrs[0], BlockAddress(100));
        assert_eq!(inode.addrs[1], BlockAddress::NEW);
        assert_eq!(inode.dedup_flags, None);
        assert!(!inode.dedup_fields_present(FEATURE_DEDUP));
    }

    #[test]
    fn extra_region_shifts_addresses_and_exposes_dedup_fields() {
        let mut spec = InodeSpec::new(NodeId(9)).with_dedup(DedupFlags::DEDUPED, NodeId(40));
        spec.addrs = vec![BlockAddress(555)];
        spec.inline_xattr = true;
        let inode = InodeBlock::parse_from_block(&format_inode(&spec)).expect("inode");

        assert_eq!(inode.extra_isize, EXTRA_DEDUP_FIELDS_END);
        assert_eq!(
            inode.addrs.len(),
            DEF_ADDRS_PER_INODE - 11 - DEFAULT_INLINE_XATTR_ADDRS
        );
        assert_eq!(inode.addrs[0], BlockAddress(555));
        assert_eq!(inode.inner_ino, Some(NodeId(40)));
        assert_eq!(inode.dedup_flags(), DedupFlags::DEDUPED);
        assert!(inode.dedup_fields_present(FEATURE_DEDUP));
        assert!(!inode.dedup_fields_present(0));
    }

    #[test]
    fn short_extra_region_hides_dedup_fields() {
        let mut spec = InodeSpec::new(NodeId(9)).with_dedup(DedupFlags::INNER, NodeId(0));
        spec.extra_isize = Some(36);
        let inode = InodeBlock::parse_from_block(&format_inode(&spec)).expect("inode");
        assert!(inode.has_extra_attr());
        assert_eq!(inode.inner_ino, None);
        assert!(!inode.dedup_fields_present(FEATURE_DEDUP));
    }

    #[test]
    fn set_links_touches_only_the_links_field() {
        let mut spec = InodeSpec::new(NodeId(5));
        spec.links = 5;
        let original = format_inode(&spec);
        let mut patched = original.clone();
        set_inode_links(&mut patched, 2).expect("patch");

        let inode = InodeBlock::parse_from_block(&patched).expect("inode");
        assert_eq!(inode.links, 2);
        let changed: Vec<usize> = original
            .iter()
            .zip(&patched)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        assert!(changed.iter().all(|i| (I_LINKS..I_LINKS + 4).contains(i)));
    }

    #[test]
    fn indirect_and_direct_nodes_have_full_complements() {
        let direct = DirectNode::parse_from_block(&format_direct_node(
            NodeId(2),
            NodeId(1),
            &[BlockAddress(900)],
        ))
        .expect("direct");
        assert_eq!(direct.addrs.len(), ADDRS_PER_BLOCK);
        assert_eq!(direct.addrs[0], BlockAddress(900));
        assert!(direct.addrs[1].is_null());

        let indirect =
            IndirectNode::parse_from_block(&format_indirect_node(NodeId(3), NodeId(1), &[NodeId(2)]))
                .expect("indirect");
        assert_eq!(indirect.nids.len(), NIDS_PER_BLOCK);
        assert_eq!(indirect.nids[0], NodeId(2));
        assert!(indirect.nids[1].is_none());
    }
}
