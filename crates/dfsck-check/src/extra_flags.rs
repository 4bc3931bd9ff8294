//! The need-fsck flag kept in the last block of checkpoint segment 0.
//!
//! The filesystem sets the flag when it wants a full check on next boot.
//! Seeing it forces repair mode for the pass; a repairing pass clears it
//! once it is done.

use crate::context::ScanContext;
use crate::corruption;
use crate::report::{FindingKind, Subject};
use crate::store::{BlockStore, Geometry};
use dfsck_error::{FsckError, Result};
use dfsck_ondisk::ExtraFlagsBlock;
use dfsck_ondisk::extra::clear_need_fsck;
use dfsck_types::BlockAddress;
use tracing::{debug, info};

/// Address of the extra-flags block.
pub fn extra_flags_address(geometry: &Geometry) -> Result<BlockAddress> {
    geometry
        .cp_blkaddr
        .checked_add(geometry.blocks_per_seg())
        .and_then(|end| end.checked_sub(1))
        .map(BlockAddress)
        .ok_or_else(|| {
            FsckError::Format(format!(
                "extra flags block out of range: cp_blkaddr={} log_blocks_per_seg={}",
                geometry.cp_blkaddr, geometry.log_blocks_per_seg
            ))
        })
}

/// Record a finding and turn repair mode on when the flag is set.
///
/// Returns whether the flag was set.
pub fn check_need_fsck_flag(
    ctx: &mut ScanContext,
    store: &dyn BlockStore,
    geometry: &Geometry,
) -> Result<bool> {
    let addr = extra_flags_address(geometry)?;
    let block = store.read_block(addr)?;
    let flags =
        ExtraFlagsBlock::parse_from_block(block.as_slice()).map_err(|err| corruption(addr, &err))?;
    if !flags.needs_fsck() {
        debug!(addr = addr.0, value = flags.need_fsck, "need-fsck flag clear");
        return Ok(false);
    }
    ctx.report.record(
        FindingKind::NeedFsckFlagSet,
        Subject::Device,
        format!("need-fsck flag set in block {addr}"),
    );
    ctx.fix_on = true;
    info!(addr = addr.0, "need-fsck flag set, repair mode forced on");
    Ok(true)
}

/// Zero the flag on disk and sync. Only runs in repair mode on a writable
/// store, and only writes when the field is non-zero.
///
/// Returns whether the block was rewritten.
pub fn clear_need_fsck_flag(
    ctx: &ScanContext,
    store: &dyn BlockStore,
    geometry: &Geometry,
) -> Result<bool> {
    if !ctx.fix_on || !store.is_writable() {
        return Ok(false);
    }
    let addr = extra_flags_address(geometry)?;
    let mut block = store.read_block(addr)?;
    let flags =
        ExtraFlagsBlock::parse_from_block(block.as_slice()).map_err(|err| corruption(addr, &err))?;
    if flags.need_fsck == 0 {
        return Ok(false);
    }
    clear_need_fsck(block.as_mut_slice()).map_err(|err| corruption(addr, &err))?;
    store.write_block(addr, block.as_slice())?;
    store.sync()?;
    info!(addr = addr.0, "need-fsck flag cleared");
    Ok(true)
}
