//! Dedup inode classification and inner-inode link reconciliation.
//!
//! An outer inode's data lives in an inner inode named by its `i_inner_ino`
//! field. The inner inode's on-disk `i_links` must equal the number of
//! outer inodes that reference it. During a pass the scan driver reports
//! each reference to [`DedupInnerRegistry`]; at the end of the pass
//! [`DedupInnerRegistry::finalize_and_fix`] reconciles every inner inode it
//! saw:
//!
//! | state at finalize            | action                               |
//! |------------------------------|--------------------------------------|
//! | failed validation            | skipped (reported on discovery)      |
//! | no references                | orphan: subtree reclaimed            |
//! | `i_links` ≠ references       | mismatch; rewritten in repair mode   |
//! | consistent or just rewritten | usage forwarded to quota accounting  |
//! | unreadable inode block       | reported, record dropped             |

use crate::context::ScanContext;
use crate::corruption;
use crate::reclaim::NodeGraphReclaimer;
use crate::report::{FindingKind, Subject};
use crate::store::{BlockStore, NodeChecker, QuotaAccounting};
use dfsck_error::{FsckError, Result};
use dfsck_ondisk::InodeBlock;
use dfsck_ondisk::node::set_inode_links;
use dfsck_types::{DedupFlags, FileType, NodeId, NodeType};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

// ── Classification ──────────────────────────────────────────────────────────

/// Dedup predicates over a parsed inode.
///
/// Every predicate is false unless [`DedupView::dedup_fields_present`]
/// holds: without the feature bit or a large enough extra region the flag
/// bytes belong to something else.
#[derive(Debug, Clone, Copy)]
pub struct DedupView<'a> {
    inode: &'a InodeBlock,
    features: u32,
}

impl<'a> DedupView<'a> {
    #[must_use]
    pub fn new(inode: &'a InodeBlock, features: u32) -> Self {
        Self { inode, features }
    }

    #[must_use]
    pub fn dedup_fields_present(&self) -> bool {
        self.inode.dedup_fields_present(self.features)
    }

    fn has(&self, flag: DedupFlags) -> bool {
        self.dedup_fields_present() && self.inode.dedup_flags().contains(flag)
    }

    #[must_use]
    pub fn is_deduped(&self) -> bool {
        self.has(DedupFlags::DEDUPED)
    }

    #[must_use]
    pub fn is_inner(&self) -> bool {
        self.has(DedupFlags::INNER)
    }

    /// Deduped and not itself an inner inode.
    #[must_use]
    pub fn is_outer(&self) -> bool {
        self.is_deduped() && !self.is_inner()
    }

    #[must_use]
    pub fn is_revoke(&self) -> bool {
        self.is_deduped() && self.has(DedupFlags::REVOKE)
    }

    #[must_use]
    pub fn is_deduping(&self) -> bool {
        self.is_deduped() && self.has(DedupFlags::DOING_DEDUP)
    }

    /// A dedup or revoke was in flight when the image was written.
    #[must_use]
    pub fn is_unstable(&self) -> bool {
        self.is_revoke() || self.is_deduping()
    }

    /// The inner inode this inode dereferences, when the field is present.
    #[must_use]
    pub fn inner_ino(&self) -> Option<NodeId> {
        if self.dedup_fields_present() {
            self.inode.inner_ino
        } else {
            None
        }
    }
}

/// An outer inode keeps no extent record of its own; its data is mapped
/// through the inner inode. Returns `false` and records a finding when one
/// is present.
pub fn check_dedup_extent(ctx: &mut ScanContext, nid: NodeId, inode: &InodeBlock) -> bool {
    if inode.extent.len == 0 {
        return true;
    }
    ctx.report.record(
        FindingKind::DedupExtentUnmatched,
        Subject::Node(nid),
        format!(
            "outer inode has extent fofs={} blk={} len={}",
            inode.extent.fofs, inode.extent.blk, inode.extent.len
        ),
    );
    false
}

// ── Registry ────────────────────────────────────────────────────────────────

/// What the pass learned about one inner inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupInnerRecord {
    pub nid: NodeId,
    /// On-disk `i_links` when first discovered; zero for an invalid inode.
    pub expected_links: u32,
    /// Outer inodes seen referencing it so far.
    pub actual_links: u32,
    pub valid: bool,
}

/// Outcome counts of [`DedupInnerRegistry::finalize_and_fix`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeSummary {
    pub records: usize,
    pub skipped_invalid: usize,
    pub orphans: usize,
    pub mismatches: usize,
    pub links_rewritten: usize,
    pub accounted: usize,
    /// Records whose inode block could not be read back at finalize.
    pub unreadable: usize,
}

/// Inner inodes discovered during one pass, keyed by nid.
#[derive(Debug, Default)]
pub struct DedupInnerRegistry {
    records: BTreeMap<NodeId, DedupInnerRecord>,
}

impl DedupInnerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lookup(&self, nid: NodeId) -> Option<DedupInnerRecord> {
        self.records.get(&nid).copied()
    }

    /// Add a record for `nid`. Registering the same nid twice is a caller
    /// bug; discovery goes through [`Self::sanity_check_inner_nid`].
    pub fn register(&mut self, nid: NodeId, valid: bool, expected_links: u32) -> Result<()> {
        if self.records.contains_key(&nid) {
            error!(nid = nid.0, "inner inode registered twice");
            return Err(FsckError::InvariantViolation(format!(
                "inner inode {nid} already registered"
            )));
        }
        self.records.insert(
            nid,
            DedupInnerRecord {
                nid,
                expected_links,
                actual_links: 0,
                valid,
            },
        );
        debug!(nid = nid.0, valid, links = expected_links, "inner inode registered");
        Ok(())
    }

    /// Validate `nid` as an inner inode, at most once per pass.
    ///
    /// An out-of-range nid is rejected without being recorded. Otherwise
    /// the first call asks `checker` to validate the inode and records the
    /// outcome; later calls return the recorded validity. Only a fatal
    /// invariant violation from the checker is returned as an error.
    pub fn sanity_check_inner_nid(
        &mut self,
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        checker: &mut dyn NodeChecker,
        nid: NodeId,
    ) -> Result<bool> {
        if !store.is_valid_nid(nid) {
            trace!(nid = nid.0, "inner nid out of range");
            return Ok(false);
        }
        if let Some(record) = self.records.get(&nid) {
            return Ok(record.valid);
        }

        let (valid, links) =
            match checker.validate_and_read_inode(ctx, store, nid, FileType::DedupInner) {
                Ok(inode) => (true, inode.links),
                Err(err) if err.is_fatal_invariant() => return Err(err),
                Err(err) => {
                    ctx.report.record(
                        FindingKind::InvalidInnerInode,
                        Subject::Node(nid),
                        err.to_string(),
                    );
                    (false, 0)
                }
            };
        self.register(nid, valid, links)?;
        Ok(valid)
    }

    /// Count one more outer inode referencing `nid`. Unknown nids are ignored.
    pub fn increment_actual(&mut self, nid: NodeId) {
        if let Some(record) = self.records.get_mut(&nid) {
            record.actual_links = record.actual_links.saturating_add(1);
        }
    }

    /// Handle one outer inode seen by the scan: check its extent record and
    /// count its reference if the inner inode is valid.
    ///
    /// Returns the inner nid that was counted, if any. Inodes that are not
    /// outer inodes are ignored.
    pub fn visit_outer_inode(
        &mut self,
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        checker: &mut dyn NodeChecker,
        nid: NodeId,
        inode: &InodeBlock,
    ) -> Result<Option<NodeId>> {
        let view = DedupView::new(inode, ctx.features);
        if !view.is_outer() {
            return Ok(None);
        }
        check_dedup_extent(ctx, nid, inode);
        let Some(inner) = view.inner_ino() else {
            return Ok(None);
        };
        if !self.sanity_check_inner_nid(ctx, store, checker, inner)? {
            return Ok(None);
        }
        self.increment_actual(inner);
        Ok(Some(inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reconcile and consume every record, highest nid first.
    ///
    /// Orphans are reclaimed from the in-memory bitmap and counters in
    /// either mode. `i_links` is rewritten only with repair on and a
    /// writable store; findings are the same either way. A record whose
    /// inode cannot be read is reported and the pass moves on. A fatal
    /// invariant violation stops the pass and leaves the records not yet
    /// reached in the registry.
    pub fn finalize_and_fix(
        &mut self,
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        quota: &mut dyn QuotaAccounting,
    ) -> Result<FinalizeSummary> {
        let mut summary = FinalizeSummary {
            records: self.records.len(),
            ..FinalizeSummary::default()
        };
        let reclaimer = NodeGraphReclaimer::new(store);

        while let Some((nid, record)) = self.records.pop_last() {
            match Self::finalize_record(ctx, store, quota, &reclaimer, record, &mut summary) {
                Ok(()) => {}
                Err(err) if err.is_fatal_invariant() => return Err(err),
                Err(err) => {
                    warn!(nid = nid.0, error = %err, "inner inode unreadable at finalize");
                    ctx.report.record(
                        FindingKind::InvalidInnerInode,
                        Subject::Node(nid),
                        format!("cannot finalize: {err}"),
                    );
                    summary.unreadable += 1;
                }
            }
        }

        debug!(
            records = summary.records,
            orphans = summary.orphans,
            mismatches = summary.mismatches,
            rewritten = summary.links_rewritten,
            unreadable = summary.unreadable,
            "inner inode list finalized"
        );
        Ok(summary)
    }

    fn finalize_record(
        ctx: &mut ScanContext,
        store: &dyn BlockStore,
        quota: &mut dyn QuotaAccounting,
        reclaimer: &NodeGraphReclaimer<'_>,
        record: DedupInnerRecord,
        summary: &mut FinalizeSummary,
    ) -> Result<()> {
        let nid = record.nid;
        if !record.valid {
            summary.skipped_invalid += 1;
            return Ok(());
        }

        if record.actual_links == 0 {
            ctx.report.record(
                FindingKind::OrphanInnerInode,
                Subject::Node(nid),
                format!("i_links={} but no outer inode references it", record.expected_links),
            );
            let stats = reclaimer.free_subtree(ctx, nid, NodeType::Inode)?;
            if stats.unreadable > 0 {
                warn!(
                    nid = nid.0,
                    unreadable = stats.unreadable,
                    "orphan subtree partly unreadable"
                );
            }
            summary.orphans += 1;
            return Ok(());
        }

        let info = store.node_info(nid)?;
        let mut block = store.read_block(info.blk_addr)?;

        if record.expected_links != record.actual_links {
            summary.mismatches += 1;
            ctx.report.record(
                FindingKind::LinkCountMismatch,
                Subject::Node(nid),
                format!(
                    "i_links={} but {} outer inodes reference it",
                    record.expected_links, record.actual_links
                ),
            );
            if ctx.fix_on && store.is_writable() {
                set_inode_links(block.as_mut_slice(), record.actual_links)
                    .map_err(|err| corruption(info.blk_addr, &err))?;
                store.write_block(info.blk_addr, block.as_slice())?;
                ctx.report.record_fix(
                    FindingKind::LinkCountMismatch,
                    Subject::Node(nid),
                    format!("i_links {} -> {}", record.expected_links, record.actual_links),
                );
                info!(
                    nid = nid.0,
                    from = record.expected_links,
                    to = record.actual_links,
                    "inner inode link count rewritten"
                );
                summary.links_rewritten += 1;
            }
        }

        let inode = InodeBlock::parse_from_block(block.as_slice())
            .map_err(|err| corruption(info.blk_addr, &err))?;
        quota.account_inode_usage(nid, &inode);
        summary.accounted += 1;
        Ok(())
    }
}
