//! Reclamation of an unreachable node subtree.
//!
//! [`NodeGraphReclaimer::free_subtree`] walks the node graph below a root
//! and clears the validity bit of every node and data block it reaches,
//! releasing the matching valid counters. The walk follows the fixed shape
//! of [`NodeType`]:
//!
//! ```text
//! Inode ──┬── xattr node          (bit only)
//!         ├── i_addr[..]          data blocks
//!         ├── i_nid[0..2] ──> DirectNode ──> data blocks
//!         ├── i_nid[2..4] ──> IndirectNode ──> DirectNode
//!         └── i_nid[4]    ──> DoubleIndirectNode ──> IndirectNode
//! ```
//!
//! A bit is tested before it is cleared and counters move only on a
//! set→clear transition, so a block reachable twice is released once. The
//! `NEW` sentinel is never bitmap-tracked; it releases a block on every
//! visit.
//!
//! A node that cannot be located, read, or parsed is damage, not a caller
//! error: it is logged, counted in [`ReclaimStats::unreadable`], and its own
//! subtree is skipped while the rest of the walk continues. Only an
//! invariant violation aborts the walk.

use crate::context::ScanContext;
use crate::corruption;
use crate::store::BlockStore;
use dfsck_error::{FsckError, Result};
use dfsck_ondisk::{DirectNode, IndirectNode, InodeBlock};
use dfsck_types::{BlockAddress, InodeNidSlot, NodeId, NodeType};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

/// What one [`NodeGraphReclaimer::free_subtree`] call released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimStats {
    /// Node blocks (including xattr nodes) whose bit was cleared.
    pub nodes: u64,
    /// Data blocks whose bit was cleared.
    pub data_blocks: u64,
    /// `NEW` data addresses released without a bitmap bit.
    pub new_blocks: u64,
    /// Node ids visited, whether or not their bit was still set.
    pub visited: u64,
    /// Nodes skipped because their block could not be located, read, or
    /// parsed.
    pub unreadable: u64,
}

impl ReclaimStats {
    /// Total decrement applied to the valid-block counter.
    #[must_use]
    pub fn blocks_released(&self) -> u64 {
        self.nodes + self.data_blocks + self.new_blocks
    }
}

pub struct NodeGraphReclaimer<'a> {
    store: &'a dyn BlockStore,
}

impl<'a> NodeGraphReclaimer<'a> {
    #[must_use]
    pub fn new(store: &'a dyn BlockStore) -> Self {
        Self { store }
    }

    /// Release every block reachable from `nid`, treating it as a node of
    /// type `ty`. A zero or out-of-range `nid` is a no-op.
    pub fn free_subtree(
        &self,
        ctx: &mut ScanContext,
        nid: NodeId,
        ty: NodeType,
    ) -> Result<ReclaimStats> {
        let mut stats = ReclaimStats::default();
        self.free_node(ctx, nid, ty, 0, &mut stats)?;
        debug!(
            nid = nid.0,
            ?ty,
            nodes = stats.nodes,
            data_blocks = stats.data_blocks,
            new_blocks = stats.new_blocks,
            unreadable = stats.unreadable,
            "subtree reclaimed"
        );
        Ok(stats)
    }

    fn free_node(
        &self,
        ctx: &mut ScanContext,
        nid: NodeId,
        ty: NodeType,
        depth: usize,
        stats: &mut ReclaimStats,
    ) -> Result<()> {
        match self.release_node(ctx, nid, ty, depth, stats) {
            Err(err) if !err.is_fatal_invariant() => {
                warn!(nid = nid.0, ?ty, depth, error = %err, "node unreadable, subtree skipped");
                stats.unreadable += 1;
                Ok(())
            }
            other => other,
        }
    }

    fn release_node(
        &self,
        ctx: &mut ScanContext,
        nid: NodeId,
        ty: NodeType,
        depth: usize,
        stats: &mut ReclaimStats,
    ) -> Result<()> {
        if depth > NodeType::MAX_DEPTH {
            error!(nid = nid.0, depth, "node graph deeper than an inode tree");
            return Err(FsckError::InvariantViolation(format!(
                "nid {nid} reached at depth {depth}, limit {}",
                NodeType::MAX_DEPTH
            )));
        }
        if nid.is_none() || !self.store.is_valid_nid(nid) {
            return Ok(());
        }

        let info = self.store.node_info(nid)?;
        if info.blk_addr.is_sentinel() || !self.store.is_valid_block_address(info.blk_addr) {
            trace!(nid = nid.0, addr = info.blk_addr.0, "node has no block to reclaim");
            return Ok(());
        }
        let block = self.store.read_block(info.blk_addr)?;
        stats.visited += 1;

        if ctx.bitmap.clear(info.blk_addr) {
            stats.nodes += 1;
            if ty == NodeType::Inode {
                ctx.counters.release_inode();
            } else {
                ctx.counters.release_node();
            }
        }

        let raw = block.as_slice();
        match ty {
            NodeType::Inode => {
                let inode = InodeBlock::parse_from_block(raw)
                    .map_err(|err| corruption(info.blk_addr, &err))?;
                self.free_xattr_node(ctx, inode.xattr_nid, stats);
                Self::free_data_blocks(ctx, self.store, &inode.addrs, stats);
                for slot in InodeNidSlot::ALL {
                    let child = inode.nids[slot.index()];
                    if child.is_none() {
                        continue;
                    }
                    self.free_node(ctx, child, NodeType::for_inode_slot(slot), depth + 1, stats)?;
                }
            }
            NodeType::DirectNode => {
                let node = DirectNode::parse_from_block(raw)
                    .map_err(|err| corruption(info.blk_addr, &err))?;
                Self::free_data_blocks(ctx, self.store, &node.addrs, stats);
            }
            NodeType::IndirectNode | NodeType::DoubleIndirectNode => {
                let node = IndirectNode::parse_from_block(raw)
                    .map_err(|err| corruption(info.blk_addr, &err))?;
                let Some(child_ty) = ty.child_type() else {
                    return Ok(());
                };
                for child in node.nids {
                    self.free_node(ctx, child, child_ty, depth + 1, stats)?;
                }
            }
        }
        Ok(())
    }

    /// The xattr node only gives back its own block.
    fn free_xattr_node(
        &self,
        ctx: &mut ScanContext,
        xattr_nid: NodeId,
        stats: &mut ReclaimStats,
    ) {
        if xattr_nid.is_none() || !self.store.is_valid_nid(xattr_nid) {
            return;
        }
        let info = match self.store.node_info(xattr_nid) {
            Ok(info) => info,
            Err(err) => {
                warn!(nid = xattr_nid.0, error = %err, "xattr node unreadable");
                stats.unreadable += 1;
                return;
            }
        };
        if ctx.bitmap.clear(info.blk_addr) {
            stats.nodes += 1;
            ctx.counters.release_node();
        }
    }

    fn free_data_blocks(
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        addrs: &[BlockAddress],
        stats: &mut ReclaimStats,
    ) {
        for &addr in addrs {
            if addr.is_null() || !store.is_valid_block_address(addr) {
                continue;
            }
            if addr.is_new() {
                ctx.counters.release_block();
                stats.new_blocks += 1;
            } else if ctx.bitmap.clear(addr) {
                ctx.counters.release_block();
                stats.data_blocks += 1;
            }
        }
    }
}
