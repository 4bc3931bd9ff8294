//! Per-category readahead pipeline.
//!
//! The scanning thread knows which blocks it will need a little before it
//! needs them. [`ReadaheadQueue::enqueue`] records the address and returns
//! immediately; a dedicated worker per [`SegmentCategory`] turns the
//! addresses into [`Readahead`] hints.
//!
//! # Worker protocol
//!
//! Each lane owns a FIFO of pending addresses, a mutex, a condition
//! variable, and one worker thread:
//!
//! ```text
//! Waiting --(items queued)--> Draining --(batch done)--> Waiting
//!    |                            |
//!    +------(quit requested)------+-----------------> Exiting
//! ```
//!
//! On wake the worker detaches the whole pending list under the lock and
//! dispatches it in FIFO order without the lock held. The quit flag is
//! re-checked before each dispatch, so shutdown drops the rest of an
//! in-flight batch instead of waiting for it. Items are ordered within a
//! batch only; hints are advisory, so cross-batch order does not matter.
//!
//! Shutdown sets every lane's quit flag, wakes every worker, joins them,
//! then drains whatever a late `enqueue` left behind.

use crate::Readahead;
use dfsck_error::{FsckError, Result};
use dfsck_types::{BlockAddress, SegmentCategory};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Per-lane counters reported at shutdown.
///
/// Every enqueued address ends up in exactly one of the three buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub category: SegmentCategory,
    /// Hints actually issued.
    pub dispatched: u64,
    /// Detached by the worker but skipped because quit was observed.
    pub dropped: u64,
    /// Still queued when the worker exited; freed by shutdown.
    pub drained: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadaheadStats {
    pub lanes: Vec<LaneStats>,
}

impl ReadaheadStats {
    #[must_use]
    pub fn lane(&self, category: SegmentCategory) -> Option<&LaneStats> {
        self.lanes.iter().find(|lane| lane.category == category)
    }

    #[must_use]
    pub fn total_dispatched(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.dispatched).sum()
    }

    /// Addresses that were accepted but never turned into a hint.
    #[must_use]
    pub fn total_discarded(&self) -> u64 {
        self.lanes
            .iter()
            .map(|lane| lane.dropped + lane.drained)
            .sum()
    }
}

#[derive(Debug)]
struct Lane {
    category: SegmentCategory,
    pending: Mutex<VecDeque<BlockAddress>>,
    wake: Condvar,
    /// Written under `pending`'s lock so a waiting worker cannot miss it.
    quit: AtomicBool,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    drained: AtomicU64,
}

impl Lane {
    fn new(category: SegmentCategory) -> Self {
        Self {
            category,
            pending: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            quit: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    fn quitting(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    fn request_quit(&self) {
        let guard = self.pending.lock();
        self.quit.store(true, Ordering::Release);
        drop(guard);
        self.wake.notify_all();
    }

    fn stats(&self) -> LaneStats {
        LaneStats {
            category: self.category,
            dispatched: self.dispatched.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            drained: self.drained.load(Ordering::Acquire),
        }
    }

    fn run(&self, target: &dyn Readahead) {
        loop {
            let batch = {
                let mut pending = self.pending.lock();
                while pending.is_empty() && !self.quitting() {
                    self.wake.wait(&mut pending);
                }
                if self.quitting() {
                    return;
                }
                std::mem::take(&mut *pending)
            };

            trace!(category = %self.category, batch = batch.len(), "readahead batch detached");
            for addr in batch {
                if self.quitting() {
                    self.dropped.fetch_add(1, Ordering::AcqRel);
                    continue;
                }
                target.readahead(addr);
                self.dispatched.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

/// Dispatch strategy chosen at construction.
enum Mode {
    /// One worker thread per category.
    Workers {
        lanes: Vec<Arc<Lane>>,
        handles: Vec<Option<JoinHandle<()>>>,
    },
    /// No workers: hints are issued on the caller's thread.
    Inline(Arc<dyn Readahead>),
}

/// Concurrent readahead queue, one lane per [`SegmentCategory`].
pub struct ReadaheadQueue {
    mode: Mode,
    shut_down: bool,
}

impl std::fmt::Debug for ReadaheadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.mode {
            Mode::Workers { lanes, .. } => format!("workers({})", lanes.len()),
            Mode::Inline(_) => "inline".to_owned(),
        };
        f.debug_struct("ReadaheadQueue")
            .field("mode", &mode)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl ReadaheadQueue {
    /// Spawn one worker per category, all feeding `target`.
    pub fn start(target: Arc<dyn Readahead>) -> Result<Self> {
        let mut queue = Self {
            mode: Mode::Workers {
                lanes: Vec::with_capacity(SegmentCategory::ALL.len()),
                handles: Vec::with_capacity(SegmentCategory::ALL.len()),
            },
            shut_down: false,
        };

        for category in SegmentCategory::ALL {
            let lane = Arc::new(Lane::new(category));
            let worker_lane = Arc::clone(&lane);
            let worker_target = Arc::clone(&target);
            let spawned = std::thread::Builder::new()
                .name(format!("dfsck-ra-{category}"))
                .spawn(move || worker_lane.run(worker_target.as_ref()));

            let handle = match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(%category, error = %err, "failed to spawn readahead worker");
                    let _ = queue.shutdown();
                    return Err(FsckError::Io(err));
                }
            };
            if let Mode::Workers { lanes, handles } = &mut queue.mode {
                lanes.push(lane);
                handles.push(Some(handle));
            }
        }

        info!("readahead queue enabled");
        Ok(queue)
    }

    /// Queue without worker threads; `enqueue` issues the hint directly.
    #[must_use]
    pub fn inline(target: Arc<dyn Readahead>) -> Self {
        info!("readahead queue is not enabled");
        Self {
            mode: Mode::Inline(target),
            shut_down: false,
        }
    }

    /// Record `addr` for prefetch on `category`'s lane.
    ///
    /// Never waits for the device. Returns `false` when the address was not
    /// accepted (the queue is shutting down).
    pub fn enqueue(&self, category: SegmentCategory, addr: BlockAddress) -> bool {
        if self.shut_down {
            trace!(%category, addr = addr.0, "enqueue after shutdown ignored");
            return false;
        }
        match &self.mode {
            Mode::Inline(target) => {
                target.readahead(addr);
                true
            }
            Mode::Workers { lanes, .. } => {
                let Some(lane) = lanes.get(category.index()) else {
                    return false;
                };
                if lane.quitting() {
                    return false;
                }
                lane.pending.lock().push_back(addr);
                lane.wake.notify_one();
                true
            }
        }
    }

    /// Stop every worker and free anything still queued.
    ///
    /// Idempotent; later calls return the final counters again.
    pub fn shutdown(&mut self) -> ReadaheadStats {
        let Mode::Workers { lanes, handles } = &mut self.mode else {
            self.shut_down = true;
            return ReadaheadStats::default();
        };

        if !self.shut_down {
            self.shut_down = true;
            for lane in lanes.iter() {
                lane.request_quit();
            }
            for (lane, handle) in lanes.iter().zip(handles.iter_mut()) {
                if let Some(handle) = handle.take() {
                    if handle.join().is_err() {
                        warn!(category = %lane.category, "readahead worker panicked");
                    }
                }
                let leftover = std::mem::take(&mut *lane.pending.lock());
                let leftover = u64::try_from(leftover.len()).unwrap_or(u64::MAX);
                lane.drained.fetch_add(leftover, Ordering::AcqRel);
            }
        }

        let stats = ReadaheadStats {
            lanes: lanes.iter().map(|lane| lane.stats()).collect(),
        };
        debug!(
            dispatched = stats.total_dispatched(),
            discarded = stats.total_discarded(),
            "readahead queue shut down"
        );
        stats
    }
}

impl Drop for ReadaheadQueue {
    fn drop(&mut self) {
        if !self.shut_down {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<BlockAddress>>,
    }

    impl Readahead for Recorder {
        fn readahead(&self, addr: BlockAddress) {
            self.seen.lock().push(addr);
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for workers");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn inline_mode_dispatches_on_caller_thread() {
        let recorder = Arc::new(Recorder::default());
        let mut queue = ReadaheadQueue::inline(recorder.clone());
        assert!(queue.enqueue(SegmentCategory::Data, BlockAddress(9)));
        assert_eq!(*recorder.seen.lock(), vec![BlockAddress(9)]);
        assert_eq!(queue.shutdown(), ReadaheadStats::default());
        assert!(!queue.enqueue(SegmentCategory::Data, BlockAddress(10)));
    }

    #[test]
    fn lanes_are_independent() {
        let recorder = Arc::new(Recorder::default());
        let mut queue = ReadaheadQueue::start(recorder.clone()).expect("start");
        assert!(queue.enqueue(SegmentCategory::Data, BlockAddress(1)));
        assert!(queue.enqueue(SegmentCategory::Node, BlockAddress(2)));
        wait_for(|| recorder.seen.lock().len() == 2);

        let stats = queue.shutdown();
        assert_eq!(stats.lane(SegmentCategory::Data).map(|l| l.dispatched), Some(1));
        assert_eq!(stats.lane(SegmentCategory::Node).map(|l| l.dispatched), Some(1));
        assert_eq!(stats.total_discarded(), 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_late_items() {
        let recorder = Arc::new(Recorder::default());
        let mut queue = ReadaheadQueue::start(recorder).expect("start");
        let first = queue.shutdown();
        let second = queue.shutdown();
        assert_eq!(first, second);
        assert!(!queue.enqueue(SegmentCategory::Node, BlockAddress(5)));
    }
}
