//! Block writers: the inverse of the views in [`crate::node`] and
//! [`crate::summary`].
//!
//! Test suites use these to build small synthetic node graphs.

use crate::node::{
    EXTRA_ATTR, EXTRA_DEDUP_FIELDS_END, EXTRA_DEDUP_FLAGS, EXTRA_INLINE_XATTR_SIZE,
    EXTRA_INNER_INO, EXTRA_ISIZE, FOOTER_OFFSET, I_ADDR, I_EXT, I_INLINE, I_LINKS, I_MODE, I_NID,
    I_XATTR_NID, INLINE_XATTR, ExtentInfo,
};
use crate::summary::{SUMMARY_ENTRY_TYPE, SUMMARY_TYPE_DATA, SUMMARY_TYPE_NODE};
use dfsck_types::{
    ADDRS_PER_BLOCK, BLOCK_SIZE, BlockAddress, DedupFlags, NIDS_PER_BLOCK, NODES_PER_INODE, NodeId,
    SegmentCategory,
};

/// Regular file mode (`S_IFREG | 0644`).
pub const DEFAULT_FILE_MODE: u16 = 0o100_644;

/// Description of an inode block to format.
#[derive(Debug, Clone)]
pub struct InodeSpec {
    pub nid: NodeId,
    pub ino: NodeId,
    pub mode: u16,
    pub links: u32,
    pub xattr_nid: NodeId,
    pub extent: ExtentInfo,
    pub inline_xattr: bool,
    /// `Some` adds an extra-attribute region of this size.
    pub extra_isize: Option<u16>,
    pub inline_xattr_size: u16,
    pub dedup_flags: u32,
    pub inner_ino: NodeId,
    /// Data addresses, starting at the first slot after the extra region.
    pub addrs: Vec<BlockAddress>,
    pub nids: [NodeId; NODES_PER_INODE],
}

impl InodeSpec {
    #[must_use]
    pub fn new(nid: NodeId) -> Self {
        Self {
            nid,
            ino: nid,
            mode: DEFAULT_FILE_MODE,
            links: 1,
            xattr_nid: NodeId::NONE,
            extent: ExtentInfo::default(),
            inline_xattr: false,
            extra_isize: None,
            inline_xattr_size: 0,
            dedup_flags: 0,
            inner_ino: NodeId::NONE,
            addrs: Vec::new(),
            nids: [NodeId::NONE; NODES_PER_INODE],
        }
    }

    /// Add an extra region large enough for the dedup fields and fill them.
    #[must_use]
    pub fn with_dedup(mut self, flags: DedupFlags, inner_ino: NodeId) -> Self {
        self.extra_isize = Some(EXTRA_DEDUP_FIELDS_END);
        self.dedup_flags = flags.bits();
        self.inner_ino = inner_ino;
        self
    }
}

fn put_u16(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_footer(block: &mut [u8], nid: NodeId, ino: NodeId) {
    put_u32(block, FOOTER_OFFSET, nid.0);
    put_u32(block, FOOTER_OFFSET + 4, ino.0);
}

/// Format an inode block.
///
/// # Panics
///
/// Panics when `spec.addrs` does not fit in the inode's data slots.
#[must_use]
pub fn format_inode(spec: &InodeSpec) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    put_u16(&mut block, I_MODE, spec.mode);

    let mut inline = 0_u8;
    if spec.inline_xattr {
        inline |= INLINE_XATTR;
    }
    if spec.extra_isize.is_some() {
        inline |= EXTRA_ATTR;
    }
    block[I_INLINE] = inline;
    put_u32(&mut block, I_LINKS, spec.links);
    put_u32(&mut block, I_XATTR_NID, spec.xattr_nid.0);
    put_u32(&mut block, I_EXT, spec.extent.fofs);
    put_u32(&mut block, I_EXT + 4, spec.extent.blk);
    put_u32(&mut block, I_EXT + 8, spec.extent.len);

    let mut first_slot = 0;
    if let Some(extra_isize) = spec.extra_isize {
        put_u16(&mut block, I_ADDR + EXTRA_ISIZE, extra_isize);
        put_u16(
            &mut block,
            I_ADDR + EXTRA_INLINE_XATTR_SIZE,
            spec.inline_xattr_size,
        );
        if extra_isize >= EXTRA_DEDUP_FIELDS_END {
            put_u32(&mut block, I_ADDR + EXTRA_DEDUP_FLAGS, spec.dedup_flags);
            put_u32(&mut block, I_ADDR + EXTRA_INNER_INO, spec.inner_ino.0);
        }
        first_slot = usize::from(extra_isize) / 4;
    }
    for (idx, addr) in spec.addrs.iter().enumerate() {
        let offset = I_ADDR + (first_slot + idx) * 4;
        assert!(offset + 4 <= I_NID, "too many inode addresses");
        put_u32(&mut block, offset, addr.0);
    }
    for (idx, nid) in spec.nids.iter().enumerate() {
        put_u32(&mut block, I_NID + idx * 4, nid.0);
    }
    put_footer(&mut block, spec.nid, spec.ino);
    block
}

/// Format a direct node holding `addrs` in its leading slots.
///
/// # Panics
///
/// Panics when more than `ADDRS_PER_BLOCK` addresses are given.
#[must_use]
pub fn format_direct_node(nid: NodeId, ino: NodeId, addrs: &[BlockAddress]) -> Vec<u8> {
    assert!(addrs.len() <= ADDRS_PER_BLOCK, "too many direct addresses");
    let mut block = vec![0_u8; BLOCK_SIZE];
    for (idx, addr) in addrs.iter().enumerate() {
        put_u32(&mut block, idx * 4, addr.0);
    }
    put_footer(&mut block, nid, ino);
    block
}

/// Format an indirect or double-indirect node holding `nids` in its
/// leading slots.
///
/// # Panics
///
/// Panics when more than `NIDS_PER_BLOCK` nids are given.
#[must_use]
pub fn format_indirect_node(nid: NodeId, ino: NodeId, nids: &[NodeId]) -> Vec<u8> {
    assert!(nids.len() <= NIDS_PER_BLOCK, "too many child nids");
    let mut block = vec![0_u8; BLOCK_SIZE];
    for (idx, child) in nids.iter().enumerate() {
        put_u32(&mut block, idx * 4, child.0);
    }
    put_footer(&mut block, nid, ino);
    block
}

/// Format an empty summary block whose footer claims `category`.
#[must_use]
pub fn format_summary(category: SegmentCategory) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    block[SUMMARY_ENTRY_TYPE] = match category {
        SegmentCategory::Node => SUMMARY_TYPE_NODE,
        SegmentCategory::Data => SUMMARY_TYPE_DATA,
    };
    block
}

/// Format an extra-flags block carrying `need_fsck`.
#[must_use]
pub fn format_extra_flags(need_fsck: u32) -> Vec<u8> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    put_u32(&mut block, 0, need_fsck);
    block
}
