#![forbid(unsafe_code)]

mod common;

use common::{CountingChecker, Image, RecordingQuota, geometry, read_inode};
use dfsck_block::{Readahead, ReadaheadQueue};
use dfsck_check::{
    BlockStore, DedupInnerRegistry, FindingKind, FsckConfig, SummaryCache, SummaryCacheConfig,
    SummarySource, check_need_fsck_flag, clear_need_fsck_flag, extra_flags_address,
};
use dfsck_ondisk::format::{InodeSpec, format_extra_flags, format_inode, format_summary};
use dfsck_ondisk::{ExtraFlagsBlock, SummaryBlock};
use dfsck_types::{
    BLOCK_SIZE, BlockAddress, DedupFlags, EXTRA_NEED_FSCK_FLAG, NodeId, SegNo, SegmentCategory,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn summary(category: SegmentCategory) -> SummaryBlock {
    SummaryBlock::new(format_summary(category)).expect("summary")
}

#[test]
fn bucket_eviction_follows_recency() {
    let mut cache = SummaryCache::new(SummaryCacheConfig {
        bucket_count: 1,
        bucket_capacity: 4,
    })
    .expect("cache");
    let node = SegmentCategory::Node;

    for segno in 1..=4 {
        assert_eq!(cache.insert(SegNo(segno), node, summary(node)), None);
    }
    assert_eq!(cache.insert(SegNo(5), node, summary(node)), Some(SegNo(1)));

    let hit = cache.lookup(node, SegNo(2)).expect("segno 2 cached");
    assert_eq!(hit.source, SummarySource::Cached);

    assert_eq!(cache.insert(SegNo(6), node, summary(node)), Some(SegNo(3)));
    for segno in [2, 4, 5, 6] {
        assert!(cache.lookup(node, SegNo(segno)).is_some(), "segno {segno}");
    }
    assert!(cache.lookup(node, SegNo(1)).is_none());
    assert!(cache.lookup(node, SegNo(3)).is_none());
}

#[test]
fn need_fsck_flag_drives_a_repairing_pass() {
    let config = FsckConfig::from_json_str(r#"{"fix_on": false, "overtime_ms": 60000}"#)
        .expect("config");

    let flags_addr = extra_flags_address(&geometry()).expect("flags address");
    let mut inner = InodeSpec::new(NodeId(20)).with_dedup(DedupFlags::INNER, NodeId::NONE);
    inner.links = 4;
    let mut image = Image::new(true);
    image
        .block(flags_addr.0, &format_extra_flags(EXTRA_NEED_FSCK_FLAG))
        .inode(20, 100, &format_inode(&inner))
        .inode(
            21,
            101,
            &format_inode(&InodeSpec::new(NodeId(21)).with_dedup(DedupFlags::DEDUPED, NodeId(20))),
        );
    let (store, ctx) = image.build();
    let mut ctx = ctx.with_fix(config.fix_on);
    let started = Instant::now();

    assert!(check_need_fsck_flag(&mut ctx, &store, &geometry()).expect("check flag"));
    assert!(ctx.fix_on);

    let store = Arc::new(store);
    let mut queue = if config.readahead.enabled {
        ReadaheadQueue::start(store.clone() as Arc<dyn Readahead>).expect("readahead")
    } else {
        ReadaheadQueue::inline(store.clone() as Arc<dyn Readahead>)
    };
    let mut cache = SummaryCache::new(config.summary_cache).expect("cache");
    let mut registry = DedupInnerRegistry::new();
    let mut checker = CountingChecker::default();

    for nid in [21_u32] {
        let info = store.node_info(NodeId(nid)).expect("info");
        assert!(queue.enqueue(SegmentCategory::Node, info.blk_addr));
        let segno = SegNo(info.blk_addr.0 / 32);
        if cache.lookup(SegmentCategory::Node, segno).is_none() {
            cache.insert(segno, SegmentCategory::Node, summary(SegmentCategory::Node));
        }
        let inode = read_inode(store.as_ref(), nid);
        registry
            .visit_outer_inode(&mut ctx, store.as_ref(), &mut checker, NodeId(nid), &inode)
            .expect("visit");
    }
    let stats = queue.shutdown();
    assert_eq!(stats.total_dispatched() + stats.total_discarded(), 1);
    assert_eq!(cache.len(SegmentCategory::Node), 1);

    let mut quota = RecordingQuota::default();
    let summary = registry
        .finalize_and_fix(&mut ctx, store.as_ref(), &mut quota)
        .expect("finalize");
    assert_eq!(summary.links_rewritten, 1);
    assert!(clear_need_fsck_flag(&ctx, store.as_ref(), &geometry()).expect("clear flag"));
    ctx.report.check_cost(started.elapsed(), config.overtime());

    assert_eq!(read_inode(store.as_ref(), 20).links, 1);
    let raw = image.device.snapshot();
    let start = usize::try_from(flags_addr.0).expect("addr") * BLOCK_SIZE;
    let flags =
        ExtraFlagsBlock::parse_from_block(&raw[start..start + BLOCK_SIZE]).expect("flags block");
    assert_eq!(flags.need_fsck, 0);
    assert!(image.device.state.lock().syncs >= 1);

    let report = &ctx.report;
    assert_eq!(report.count(FindingKind::NeedFsckFlagSet), 1);
    assert_eq!(report.count(FindingKind::LinkCountMismatch), 1);
    assert_eq!(report.count(FindingKind::TimeOvercost), 0);
    assert_eq!(
        report.error_bitmap(),
        FindingKind::NeedFsckFlagSet.error_bit() | FindingKind::LinkCountMismatch.error_bit()
    );
    let json: serde_json::Value =
        serde_json::from_str(&report.to_json().expect("json")).expect("parse json");
    assert_eq!(json["fixes"].as_array().map(Vec::len), Some(1));
}

#[test]
fn readahead_hints_reach_the_device() {
    let mut image = Image::new(true);
    image.inode(7, 100, &format_inode(&InodeSpec::new(NodeId(7))));
    let (store, _) = image.build();
    let store = Arc::new(store);

    let mut queue = ReadaheadQueue::start(store.clone() as Arc<dyn Readahead>).expect("start");
    for addr in [100_u32, 101, 102] {
        assert!(queue.enqueue(SegmentCategory::Node, BlockAddress(addr)));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while image.device.state.lock().prefetched.len() < 3 {
        assert!(Instant::now() < deadline, "prefetch never reached the device");
        std::thread::sleep(Duration::from_millis(1));
    }
    queue.shutdown();

    let block = u64::try_from(BLOCK_SIZE).expect("block size");
    assert_eq!(
        image.device.state.lock().prefetched,
        vec![100 * block, 101 * block, 102 * block]
    );
}
