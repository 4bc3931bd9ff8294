#![forbid(unsafe_code)]
//! On-disk format parsing for node blocks, segment summaries, and the
//! extra-flags block.
//!
//! Pure parsing crate: no I/O, no side effects. Views are parsed from
//! owned or borrowed byte slices of exactly [`dfsck_types::BLOCK_SIZE`]
//! bytes. The `format` module holds the inverse (block writers) for
//! building test images; it is compiled only for tests or with the
//! `test-util` feature.

pub mod extra;
#[cfg(any(test, feature = "test-util"))]
pub mod format;
pub mod node;
pub mod summary;

pub use extra::ExtraFlagsBlock;
pub use node::{DirectNode, ExtentInfo, IndirectNode, InodeBlock, NodeFooter};
pub use summary::{SummaryBlock, SummaryFooter};
