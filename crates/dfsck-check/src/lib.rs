#![forbid(unsafe_code)]
//! Consistency core of the dedup-aware checker.
//!
//! - [`dedup`]: classification of dedup inodes and the inner-inode registry
//!   that reconciles expected against observed link counts.
//! - [`reclaim`]: recursive reclamation of an orphaned node subtree.
//! - [`summary_cache`]: bounded per-bucket recency cache of segment summaries.
//! - [`extra_flags`]: the "need fsck" flag kept beside the checkpoint.
//!
//! All state mutated by a pass (validity bitmap, valid counters, findings)
//! lives in one [`ScanContext`] passed by reference. Nothing here locks:
//! a pass runs on one scanning thread. Prefetching is the only concurrent
//! piece and lives in `dfsck-block`.

pub mod config;
pub mod context;
pub mod dedup;
pub mod extra_flags;
pub mod reclaim;
pub mod report;
pub mod store;
pub mod summary_cache;

pub use config::{FsckConfig, ReadaheadConfig, SummaryCacheConfig};
pub use context::{ScanContext, ValidCounters, ValidityBitmap};
pub use dedup::{
    DedupInnerRecord, DedupInnerRegistry, DedupView, FinalizeSummary, check_dedup_extent,
};
pub use extra_flags::{check_need_fsck_flag, clear_need_fsck_flag, extra_flags_address};
pub use reclaim::{NodeGraphReclaimer, ReclaimStats};
pub use report::{Finding, FindingKind, Fix, FsckReport, Subject};
pub use store::{
    BlockStore, DeviceBlockStore, FooterNodeChecker, Geometry, NoQuota, NodeChecker, NodeInfo,
    QuotaAccounting,
};
pub use summary_cache::{CurrentSegment, SummaryCache, SummaryHit, SummarySource};

use dfsck_error::FsckError;
use dfsck_types::{BlockAddress, ParseError};

/// Attach the block address to a parse failure.
pub(crate) fn corruption(addr: BlockAddress, err: &ParseError) -> FsckError {
    FsckError::Corruption {
        block: addr.as_u64(),
        detail: err.to_string(),
    }
}
