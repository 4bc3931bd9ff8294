//! Collaborator seams.
//!
//! The checker does not parse superblocks or walk the node address table
//! itself. It consumes three collaborators:
//!
//! - [`BlockStore`]: block I/O plus node-id and address validation and the
//!   nid → address mapping.
//! - [`NodeChecker`]: the generic node sanity checker that validates an
//!   arbitrary inode and updates shared counters as a side effect.
//! - [`QuotaAccounting`]: per-inode usage accounting.
//!
//! [`DeviceBlockStore`] is the stock `BlockStore` over any
//! [`BlockDevice`], driven by a node address table the caller loaded.

use crate::context::ScanContext;
use crate::corruption;
use crate::dedup::DedupView;
use dfsck_block::{BlockBuf, BlockDevice, Readahead};
use dfsck_error::{FsckError, Result};
use dfsck_ondisk::InodeBlock;
use dfsck_types::{BlockAddress, FileType, NodeId};
use std::collections::HashMap;

/// Location of a node block, as recorded in the node address table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub nid: NodeId,
    /// Owning inode.
    pub ino: NodeId,
    pub blk_addr: BlockAddress,
    pub version: u8,
}

pub trait BlockStore {
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf>;

    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;

    /// Whether repairs may be written to the underlying device.
    fn is_writable(&self) -> bool;

    /// Whether `nid` lies inside the filesystem's node id range.
    fn is_valid_nid(&self, nid: NodeId) -> bool;

    /// Whether `addr` is a sentinel or lies inside the main area.
    fn is_valid_block_address(&self, addr: BlockAddress) -> bool;

    /// Map a node id to its block address.
    fn node_info(&self, nid: NodeId) -> Result<NodeInfo>;
}

pub trait NodeChecker {
    /// Parse and validate `nid` as an inode of `file_type`.
    ///
    /// An `Err` that is not a fatal invariant violation means the inode is
    /// invalid; the caller records it as such and carries on.
    fn validate_and_read_inode(
        &mut self,
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        nid: NodeId,
        file_type: FileType,
    ) -> Result<InodeBlock>;
}

pub trait QuotaAccounting {
    fn account_inode_usage(&mut self, nid: NodeId, inode: &InodeBlock);
}

/// Quota accounting disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuota;

impl QuotaAccounting for NoQuota {
    fn account_inode_usage(&mut self, _nid: NodeId, _inode: &InodeBlock) {}
}

/// Minimal [`NodeChecker`]: the footer must name `nid` as an inode, and a
/// dedup inner inode must carry the `INNER` flag.
///
/// It leaves the shared counters alone; full checkers account the inode's
/// own block when they accept it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FooterNodeChecker;

impl NodeChecker for FooterNodeChecker {
    fn validate_and_read_inode(
        &mut self,
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        nid: NodeId,
        file_type: FileType,
    ) -> Result<InodeBlock> {
        let info = store.node_info(nid)?;
        if info.blk_addr.is_sentinel() || !store.is_valid_block_address(info.blk_addr) {
            return Err(FsckError::Corruption {
                block: info.blk_addr.as_u64(),
                detail: format!("nid {nid} maps outside the main area"),
            });
        }
        let block = store.read_block(info.blk_addr)?;
        let inode = InodeBlock::parse_from_block(block.as_slice())
            .map_err(|err| corruption(info.blk_addr, &err))?;

        if inode.footer.nid != nid || !inode.footer.is_inode() {
            return Err(FsckError::Corruption {
                block: info.blk_addr.as_u64(),
                detail: format!(
                    "footer nid={} ino={} does not describe inode {nid}",
                    inode.footer.nid, inode.footer.ino
                ),
            });
        }
        if file_type == FileType::DedupInner && !DedupView::new(&inode, ctx.features).is_inner() {
            return Err(FsckError::Corruption {
                block: info.blk_addr.as_u64(),
                detail: format!("inode {nid} is not a dedup inner inode"),
            });
        }
        Ok(inode)
    }
}

/// Main-area geometry needed for id and address validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// First block of the main area.
    pub main_blkaddr: u32,
    /// Total blocks on the device.
    pub block_count: u32,
    /// Exclusive upper bound of node ids.
    pub max_nid: u32,
    /// First block of checkpoint segment 0.
    pub cp_blkaddr: u32,
    pub log_blocks_per_seg: u32,
}

impl Geometry {
    #[must_use]
    pub fn is_valid_nid(&self, nid: NodeId) -> bool {
        !nid.is_none() && nid.0 < self.max_nid
    }

    #[must_use]
    pub fn is_valid_block_address(&self, addr: BlockAddress) -> bool {
        addr.is_sentinel() || (addr.0 >= self.main_blkaddr && addr.0 < self.block_count)
    }

    #[must_use]
    pub fn blocks_per_seg(&self) -> u32 {
        1_u32.checked_shl(self.log_blocks_per_seg).unwrap_or(0)
    }

    /// Blocks covered by the validity bitmap.
    #[must_use]
    pub fn main_blocks(&self) -> u32 {
        self.block_count.saturating_sub(self.main_blkaddr)
    }
}

/// [`BlockStore`] over a block device and an in-memory node address table.
#[derive(Debug)]
pub struct DeviceBlockStore<D: BlockDevice> {
    device: D,
    geometry: Geometry,
    nat: HashMap<NodeId, NodeInfo>,
}

impl<D: BlockDevice> DeviceBlockStore<D> {
    pub fn new(device: D, geometry: Geometry) -> Result<Self> {
        if u64::from(geometry.block_count) > device.block_count() {
            return Err(FsckError::Format(format!(
                "geometry block_count={} exceeds device block_count={}",
                geometry.block_count,
                device.block_count()
            )));
        }
        if geometry.main_blkaddr > geometry.block_count {
            return Err(FsckError::Format(format!(
                "main_blkaddr={} beyond block_count={}",
                geometry.main_blkaddr, geometry.block_count
            )));
        }
        Ok(Self {
            device,
            geometry,
            nat: HashMap::new(),
        })
    }

    /// Record where `nid` lives.
    pub fn map_node(&mut self, nid: NodeId, ino: NodeId, blk_addr: BlockAddress) {
        self.nat.insert(
            nid,
            NodeInfo {
                nid,
                ino,
                blk_addr,
                version: 0,
            },
        );
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: BlockDevice> BlockStore for DeviceBlockStore<D> {
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf> {
        self.device.read_block(addr)
    }

    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()> {
        self.device.write_block(addr, data)
    }

    fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    fn is_writable(&self) -> bool {
        self.device.is_writable()
    }

    fn is_valid_nid(&self, nid: NodeId) -> bool {
        self.geometry.is_valid_nid(nid)
    }

    fn is_valid_block_address(&self, addr: BlockAddress) -> bool {
        self.geometry.is_valid_block_address(addr)
    }

    /// An in-range nid without a table entry is unallocated and maps to
    /// `NULL_ADDR`.
    fn node_info(&self, nid: NodeId) -> Result<NodeInfo> {
        if !self.geometry.is_valid_nid(nid) {
            return Err(FsckError::NotFound(format!("nid {nid} outside the node id range")));
        }
        Ok(self.nat.get(&nid).copied().unwrap_or(NodeInfo {
            nid,
            ino: NodeId::NONE,
            blk_addr: BlockAddress::NULL,
            version: 0,
        }))
    }
}

impl<D: BlockDevice + Readahead> Readahead for DeviceBlockStore<D> {
    fn readahead(&self, addr: BlockAddress) {
        self.device.readahead(addr);
    }
}
