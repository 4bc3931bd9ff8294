//! Scan context: the single owner of everything a pass mutates.

use crate::report::FsckReport;
use dfsck_types::BlockAddress;
use serde::Serialize;

// ── Validity bitmap ─────────────────────────────────────────────────────────

/// Per-block validity bits for the main area.
///
/// Bit `i` describes block `base + i`. Addresses outside the covered range
/// read as clear and cannot be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityBitmap {
    base: u32,
    len: u32,
    bits: Vec<u8>,
}

impl ValidityBitmap {
    /// All-clear bitmap covering `[base, base + len)`.
    #[must_use]
    pub fn new(base: u32, len: u32) -> Self {
        let bytes = usize::try_from(len.div_ceil(8)).unwrap_or(0);
        Self {
            base,
            len,
            bits: vec![0_u8; bytes],
        }
    }

    fn index(&self, addr: BlockAddress) -> Option<usize> {
        let idx = addr.0.checked_sub(self.base)?;
        if idx >= self.len {
            return None;
        }
        usize::try_from(idx).ok()
    }

    #[must_use]
    pub fn test(&self, addr: BlockAddress) -> bool {
        self.index(addr)
            .is_some_and(|idx| (self.bits[idx / 8] >> (idx % 8)) & 1 == 1)
    }

    /// Mark `addr` valid. Returns `false` when it lies outside the bitmap.
    pub fn set(&mut self, addr: BlockAddress) -> bool {
        let Some(idx) = self.index(addr) else {
            return false;
        };
        self.bits[idx / 8] |= 1 << (idx % 8);
        true
    }

    /// Clear `addr` if set. Returns whether a set bit was cleared, so a
    /// second clear of the same bit is a no-op.
    pub fn clear(&mut self, addr: BlockAddress) -> bool {
        if !self.test(addr) {
            return false;
        }
        if let Some(idx) = self.index(addr) {
            self.bits[idx / 8] &= !(1 << (idx % 8));
        }
        true
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set(&self) -> u64 {
        self.bits.iter().map(|byte| u64::from(byte.count_ones())).sum()
    }
}

// ── Counters ────────────────────────────────────────────────────────────────

/// Running valid-object counters, reconciled against the checkpoint at the
/// end of the pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidCounters {
    pub blocks: u64,
    pub nodes: u64,
    pub inodes: u64,
}

impl ValidCounters {
    pub fn release_block(&mut self) {
        self.blocks = self.blocks.saturating_sub(1);
    }

    /// A node block is also a block.
    pub fn release_node(&mut self) {
        self.release_block();
        self.nodes = self.nodes.saturating_sub(1);
    }

    pub fn release_inode(&mut self) {
        self.release_node();
        self.inodes = self.inodes.saturating_sub(1);
    }
}

// ── Context ─────────────────────────────────────────────────────────────────

/// Mutable state of one scan pass.
#[derive(Debug)]
pub struct ScanContext {
    pub bitmap: ValidityBitmap,
    pub counters: ValidCounters,
    /// Superblock feature word.
    pub features: u32,
    /// Repair mode. Never turned on implicitly except by the need-fsck flag.
    pub fix_on: bool,
    pub report: FsckReport,
}

impl ScanContext {
    #[must_use]
    pub fn new(bitmap: ValidityBitmap, counters: ValidCounters, features: u32) -> Self {
        Self {
            bitmap,
            counters,
            features,
            fix_on: false,
            report: FsckReport::default(),
        }
    }

    #[must_use]
    pub fn with_fix(mut self, fix_on: bool) -> Self {
        self.fix_on = fix_on;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_is_offset_by_base() {
        let mut bitmap = ValidityBitmap::new(100, 16);
        assert!(bitmap.set(BlockAddress(100)));
        assert!(bitmap.set(BlockAddress(115)));
        assert!(!bitmap.set(BlockAddress(116)));
        assert!(!bitmap.set(BlockAddress(99)));
        assert!(bitmap.test(BlockAddress(100)));
        assert!(bitmap.test(BlockAddress(115)));
        assert!(!bitmap.test(BlockAddress(101)));
        assert_eq!(bitmap.count_set(), 2);
    }

    #[test]
    fn clear_reports_transition_once() {
        let mut bitmap = ValidityBitmap::new(0, 8);
        bitmap.set(BlockAddress(3));
        assert!(bitmap.clear(BlockAddress(3)));
        assert!(!bitmap.clear(BlockAddress(3)));
        assert!(!bitmap.clear(BlockAddress(50)));
        assert_eq!(bitmap.count_set(), 0);
    }

    #[test]
    fn counters_cascade_and_saturate() {
        let mut counters = ValidCounters {
            blocks: 3,
            nodes: 2,
            inodes: 1,
        };
        counters.release_inode();
        assert_eq!(
            counters,
            ValidCounters {
                blocks: 2,
                nodes: 1,
                inodes: 0
            }
        );
        counters.release_inode();
        counters.release_inode();
        assert_eq!(counters, ValidCounters::default());
    }
}
