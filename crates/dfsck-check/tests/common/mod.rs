//! Shared fixture: a small in-memory image with a node address table.

#![allow(dead_code)]

use dfsck_block::{ByteBlockDevice, ByteDevice};
use dfsck_check::{
    BlockStore, DeviceBlockStore, FooterNodeChecker, Geometry, NodeChecker, QuotaAccounting,
    ScanContext, ValidCounters, ValidityBitmap,
};
use dfsck_error::{FsckError, Result};
use dfsck_ondisk::InodeBlock;
use dfsck_types::{BLOCK_SIZE, BlockAddress, FEATURE_DEDUP, FileType, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub const MAIN_BLKADDR: u32 = 64;
pub const BLOCK_COUNT: u32 = 1024;

pub fn geometry() -> Geometry {
    Geometry {
        main_blkaddr: MAIN_BLKADDR,
        block_count: BLOCK_COUNT,
        max_nid: 500,
        cp_blkaddr: 2,
        log_blocks_per_seg: 5,
    }
}

#[derive(Debug, Default)]
pub struct DeviceState {
    pub bytes: Vec<u8>,
    pub writes: usize,
    pub syncs: usize,
    pub prefetched: Vec<u64>,
}

/// Memory-backed device whose state stays inspectable after the store
/// takes ownership of it.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    pub state: Arc<Mutex<DeviceState>>,
    writable: bool,
}

impl MemoryByteDevice {
    pub fn new(blocks: u32, writable: bool) -> Self {
        let len = usize::try_from(blocks).expect("blocks") * BLOCK_SIZE;
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                bytes: vec![0_u8; len],
                ..DeviceState::default()
            })),
            writable,
        }
    }

    pub fn put_block(&self, addr: BlockAddress, data: &[u8]) {
        let start = usize::try_from(addr.0).expect("addr") * BLOCK_SIZE;
        self.state.lock().bytes[start..start + BLOCK_SIZE].copy_from_slice(data);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.state.lock().bytes.len()).expect("len")
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| FsckError::Format("offset".into()))?;
        let state = self.state.lock();
        let src = state
            .bytes
            .get(start..start + buf.len())
            .ok_or_else(|| FsckError::Format("read out of bounds".into()))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FsckError::ReadOnly);
        }
        let start = usize::try_from(offset).map_err(|_| FsckError::Format("offset".into()))?;
        let mut state = self.state.lock();
        state
            .bytes
            .get_mut(start..start + buf.len())
            .ok_or_else(|| FsckError::Format("write out of bounds".into()))?
            .copy_from_slice(buf);
        state.writes += 1;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().syncs += 1;
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn prefetch(&self, offset: u64, _len: usize) {
        self.state.lock().prefetched.push(offset);
    }
}

pub type Store = DeviceBlockStore<ByteBlockDevice<MemoryByteDevice>>;

/// Image under construction: blocks go to the device, nodes to the
/// address table, and every written main-area block is marked valid.
pub struct Image {
    pub device: MemoryByteDevice,
    nodes: Vec<(NodeId, BlockAddress)>,
    valid: Vec<BlockAddress>,
    inodes: u64,
    node_blocks: u64,
}

impl Image {
    pub fn new(writable: bool) -> Self {
        Self {
            device: MemoryByteDevice::new(BLOCK_COUNT, writable),
            nodes: Vec::new(),
            valid: Vec::new(),
            inodes: 0,
            node_blocks: 0,
        }
    }

    pub fn inode(&mut self, nid: u32, addr: u32, block: &[u8]) -> &mut Self {
        self.inodes += 1;
        self.node(nid, addr, block)
    }

    pub fn node(&mut self, nid: u32, addr: u32, block: &[u8]) -> &mut Self {
        self.device.put_block(BlockAddress(addr), block);
        self.nodes.push((NodeId(nid), BlockAddress(addr)));
        self.valid.push(BlockAddress(addr));
        self.node_blocks += 1;
        self
    }

    pub fn data(&mut self, addr: u32) -> &mut Self {
        self.valid.push(BlockAddress(addr));
        self
    }

    pub fn block(&mut self, addr: u32, block: &[u8]) -> &mut Self {
        self.device.put_block(BlockAddress(addr), block);
        self
    }

    pub fn build(&self) -> (Store, ScanContext) {
        let device =
            ByteBlockDevice::with_default_block_size(self.device.clone()).expect("block device");
        let mut store = DeviceBlockStore::new(device, geometry()).expect("store");
        for &(nid, addr) in &self.nodes {
            store.map_node(nid, nid, addr);
        }
        let mut bitmap = ValidityBitmap::new(MAIN_BLKADDR, BLOCK_COUNT - MAIN_BLKADDR);
        for &addr in &self.valid {
            assert!(bitmap.set(addr), "block {addr} outside main area");
        }
        let counters = ValidCounters {
            blocks: u64::try_from(self.valid.len()).expect("len"),
            nodes: self.node_blocks,
            inodes: self.inodes,
        };
        (store, ScanContext::new(bitmap, counters, FEATURE_DEDUP))
    }
}

/// [`FooterNodeChecker`] that counts how often each nid is validated.
#[derive(Debug, Default)]
pub struct CountingChecker {
    pub calls: HashMap<NodeId, usize>,
}

impl NodeChecker for CountingChecker {
    fn validate_and_read_inode(
        &mut self,
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        nid: NodeId,
        file_type: FileType,
    ) -> Result<InodeBlock> {
        *self.calls.entry(nid).or_default() += 1;
        FooterNodeChecker.validate_and_read_inode(ctx, store, nid, file_type)
    }
}

#[derive(Debug, Default)]
pub struct RecordingQuota {
    pub accounted: Vec<(NodeId, u32)>,
}

impl QuotaAccounting for RecordingQuota {
    fn account_inode_usage(&mut self, nid: NodeId, inode: &InodeBlock) {
        self.accounted.push((nid, inode.links));
    }
}

/// Read and parse the inode at `nid` through the store.
pub fn read_inode(store: &dyn BlockStore, nid: u32) -> InodeBlock {
    let info = store.node_info(NodeId(nid)).expect("node info");
    let block = store.read_block(info.blk_addr).expect("read");
    InodeBlock::parse_from_block(block.as_slice()).expect("parse")
}
