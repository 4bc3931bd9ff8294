//! Findings and repairs produced by a pass.
//!
//! A finding is recorded whether or not repair mode is on, so a dry run and
//! a repairing run over the same image produce the same findings. A [`Fix`]
//! is recorded only after the repair was written to the device.

use dfsck_error::{FsckError, Result};
use dfsck_types::{NodeId, SegNo, SegmentCategory};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::warn;

// ── Taxonomy ────────────────────────────────────────────────────────────────

/// Category of inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// An inner inode referenced by an outer inode failed validation.
    InvalidInnerInode,
    /// An inner inode that no outer inode references.
    OrphanInnerInode,
    /// On-disk `i_links` differs from the number of referencing outer inodes.
    LinkCountMismatch,
    /// A current segment's summary disagrees with the category it serves.
    SegmentCategoryMismatch,
    /// An outer inode still carries a non-empty extent record.
    DedupExtentUnmatched,
    /// The need-fsck flag was set beside the checkpoint.
    NeedFsckFlagSet,
    /// The pass ran past its time budget.
    TimeOvercost,
}

impl FindingKind {
    pub const ALL: [Self; 7] = [
        Self::InvalidInnerInode,
        Self::OrphanInnerInode,
        Self::LinkCountMismatch,
        Self::SegmentCategoryMismatch,
        Self::DedupExtentUnmatched,
        Self::NeedFsckFlagSet,
        Self::TimeOvercost,
    ];

    /// Stable bit of this kind in [`FsckReport::error_bitmap`].
    #[must_use]
    pub fn error_bit(self) -> u32 {
        match self {
            Self::InvalidInnerInode => 1 << 0,
            Self::OrphanInnerInode => 1 << 1,
            Self::LinkCountMismatch => 1 << 2,
            Self::SegmentCategoryMismatch => 1 << 3,
            Self::DedupExtentUnmatched => 1 << 4,
            Self::NeedFsckFlagSet => 1 << 5,
            Self::TimeOvercost => 1 << 6,
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInnerInode => write!(f, "invalid_inner_inode"),
            Self::OrphanInnerInode => write!(f, "orphan_inner_inode"),
            Self::LinkCountMismatch => write!(f, "link_count_mismatch"),
            Self::SegmentCategoryMismatch => write!(f, "segment_category_mismatch"),
            Self::DedupExtentUnmatched => write!(f, "dedup_extent_unmatched"),
            Self::NeedFsckFlagSet => write!(f, "need_fsck_flag_set"),
            Self::TimeOvercost => write!(f, "time_overcost"),
        }
    }
}

/// What a finding or fix is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Node(NodeId),
    Segment {
        category: SegmentCategory,
        segno: SegNo,
    },
    Device,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(nid) => write!(f, "nid {nid}"),
            Self::Segment { category, segno } => write!(f, "{category} segment {segno}"),
            Self::Device => write!(f, "device"),
        }
    }
}

// ── Entries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub subject: Subject,
    pub detail: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.subject, self.kind, self.detail)
    }
}

/// A repair that was written to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fix {
    pub kind: FindingKind,
    pub subject: Subject,
    pub detail: String,
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fixed {} [{}]: {}", self.subject, self.kind, self.detail)
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    /// In discovery order.
    pub findings: Vec<Finding>,
    pub fixes: Vec<Fix>,
    /// Wall time of the pass, filled in by [`FsckReport::check_cost`].
    pub elapsed_ms: u64,
}

impl FsckReport {
    pub fn record(&mut self, kind: FindingKind, subject: Subject, detail: impl Into<String>) {
        let finding = Finding {
            kind,
            subject,
            detail: detail.into(),
        };
        warn!(kind = %finding.kind, subject = %finding.subject, detail = %finding.detail, "inconsistency");
        self.findings.push(finding);
    }

    pub fn record_fix(&mut self, kind: FindingKind, subject: Subject, detail: impl Into<String>) {
        self.fixes.push(Fix {
            kind,
            subject,
            detail: detail.into(),
        });
    }

    /// Union of [`FindingKind::error_bit`] over all findings.
    #[must_use]
    pub fn error_bitmap(&self) -> u32 {
        self.findings
            .iter()
            .fold(0, |bits, finding| bits | finding.kind.error_bit())
    }

    #[must_use]
    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Record the pass duration; a pass longer than `threshold` is a finding.
    pub fn check_cost(&mut self, elapsed: Duration, threshold: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if elapsed > threshold {
            self.record(
                FindingKind::TimeOvercost,
                Subject::Device,
                format!(
                    "pass took {} ms, budget {} ms",
                    self.elapsed_ms,
                    threshold.as_millis()
                ),
            );
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| FsckError::Format(format!("report serialization failed: {err}")))
    }
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} findings, {} fixes, error bitmap {:#x}, {} ms",
            self.findings.len(),
            self.fixes.len(),
            self.error_bitmap(),
            self.elapsed_ms,
        )
    }
}
