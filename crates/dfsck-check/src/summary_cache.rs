//! Bounded recency cache of segment summary blocks.
//!
//! Each [`SegmentCategory`] has its own table of `bucket_count` buckets; a
//! segment lands in bucket `segno % bucket_count`. A bucket is a list of at
//! most `bucket_capacity` entries ordered from least to most recently used.
//! A hit moves the entry to the back; an insert into a full bucket evicts
//! the front.
//!
//! The segments currently open for writing are answered from their
//! in-memory summaries before any bucket is consulted.

use crate::config::SummaryCacheConfig;
use crate::context::ScanContext;
use crate::report::{FindingKind, Subject};
use dfsck_error::Result;
use dfsck_ondisk::SummaryBlock;
use dfsck_types::{SegNo, SegmentCategory};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Where a [`SummaryHit`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    /// A current segment whose summary agrees with the queried category.
    Current,
    /// A current segment whose summary names the other category. The block
    /// is still returned; the caller decides how serious this is.
    CurrentMismatch,
    /// A cached entry.
    Cached,
}

#[derive(Debug, Clone, Copy)]
pub struct SummaryHit<'a> {
    pub block: &'a SummaryBlock,
    pub source: SummarySource,
}

/// An active segment and its in-memory summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSegment {
    pub segno: SegNo,
    pub block: SummaryBlock,
}

#[derive(Debug)]
struct Entry {
    segno: SegNo,
    block: SummaryBlock,
}

#[derive(Debug)]
pub struct SummaryCache {
    config: SummaryCacheConfig,
    /// Indexed by [`SegmentCategory::index`], then bucket.
    tables: [Vec<VecDeque<Entry>>; 2],
    current: [Vec<CurrentSegment>; 2],
}

impl SummaryCache {
    pub fn new(config: SummaryCacheConfig) -> Result<Self> {
        config.validate()?;
        let table = || {
            (0..config.bucket_count)
                .map(|_| VecDeque::with_capacity(config.bucket_capacity))
                .collect::<Vec<_>>()
        };
        Ok(Self {
            config,
            tables: [table(), table()],
            current: [Vec::new(), Vec::new()],
        })
    }

    #[must_use]
    pub fn config(&self) -> SummaryCacheConfig {
        self.config
    }

    /// Replace the current segments served for `category`.
    pub fn set_current_segments(&mut self, category: SegmentCategory, segments: Vec<CurrentSegment>) {
        self.current[category.index()] = segments;
    }

    fn bucket_index(&self, segno: SegNo) -> usize {
        // bucket_count > 0 is checked in `new`.
        usize::try_from(segno.0).unwrap_or(usize::MAX) % self.config.bucket_count
    }

    /// Find the summary of `segno` for `category`, promoting a cached hit
    /// to most recently used.
    pub fn lookup(&mut self, category: SegmentCategory, segno: SegNo) -> Option<SummaryHit<'_>> {
        let cat = category.index();
        if let Some(pos) = self.current[cat].iter().position(|cur| cur.segno == segno) {
            let block = &self.current[cat][pos].block;
            let source = if block.category() == category {
                SummarySource::Current
            } else {
                SummarySource::CurrentMismatch
            };
            return Some(SummaryHit { block, source });
        }

        let idx = self.bucket_index(segno);
        let bucket = &mut self.tables[cat][idx];
        let pos = bucket.iter().position(|entry| entry.segno == segno)?;
        if pos + 1 != bucket.len() {
            let entry = bucket.remove(pos)?;
            bucket.push_back(entry);
            trace!(%category, segno = segno.0, bucket = idx, "summary promoted");
        }
        bucket.back().map(|entry| SummaryHit {
            block: &entry.block,
            source: SummarySource::Cached,
        })
    }

    /// [`Self::lookup`], recording a finding when a current segment's
    /// summary names the wrong category.
    pub fn lookup_and_report(
        &mut self,
        ctx: &mut ScanContext,
        category: SegmentCategory,
        segno: SegNo,
    ) -> Option<SummaryHit<'_>> {
        let hit = self.lookup(category, segno)?;
        if hit.source == SummarySource::CurrentMismatch {
            warn!(%category, segno = segno.0, "current segment summary has the wrong type");
            ctx.report.record(
                FindingKind::SegmentCategoryMismatch,
                Subject::Segment { category, segno },
                format!(
                    "summary footer says {}, expected {category}",
                    hit.block.category()
                ),
            );
        }
        Some(hit)
    }

    /// Cache `block` as the summary of `segno`. Returns the segment evicted
    /// to make room, if any.
    ///
    /// Callers insert after a miss; inserting a cached segno again replaces
    /// its block and promotes it.
    pub fn insert(
        &mut self,
        segno: SegNo,
        category: SegmentCategory,
        block: SummaryBlock,
    ) -> Option<SegNo> {
        let idx = self.bucket_index(segno);
        let capacity = self.config.bucket_capacity;
        let bucket = &mut self.tables[category.index()][idx];

        if let Some(pos) = bucket.iter().position(|entry| entry.segno == segno) {
            bucket.remove(pos);
            bucket.push_back(Entry { segno, block });
            return None;
        }

        let evicted = if bucket.len() >= capacity {
            bucket.pop_front().map(|entry| entry.segno)
        } else {
            None
        };
        bucket.push_back(Entry { segno, block });
        if let Some(old) = evicted {
            trace!(%category, bucket = idx, evicted = old.0, segno = segno.0, "summary evicted");
        }
        evicted
    }

    /// Drop every cached entry. Current segments are kept.
    pub fn clear(&mut self) {
        for table in &mut self.tables {
            for bucket in table.iter_mut() {
                bucket.clear();
            }
        }
    }

    /// Cached entries for `category`, excluding current segments.
    #[must_use]
    pub fn len(&self, category: SegmentCategory) -> usize {
        self.tables[category.index()].iter().map(VecDeque::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        SegmentCategory::ALL
            .iter()
            .all(|&category| self.len(category) == 0)
    }
}
