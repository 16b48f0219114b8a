//! Sliding-window failure counter.
//!
//! The tracker records failure events keyed by their nanosecond timestamp and
//! forgets them once they age past the owning breaker's `window`. A single
//! worker task owns the event map, so recording needs no map-level locking;
//! other components observe only the atomic cardinality, which makes
//! [`ErrorTracker::size`] wait-free.
//!
//! `incr` and `reset` are messages on the worker's queue. An `incr` issued
//! before a `size` call on the same thread is eventually, not necessarily
//! immediately, reflected; callers that need to observe the count settle with
//! a short sleep (the calculator task re-reads every baud tick anyway).

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::state::now_nanos;

/// Cadence of the eviction sweep. Bounds worst-case staleness of the count
/// independently of the window length.
const EVICT_INTERVAL: Duration = Duration::from_millis(500);

enum TrackerOp {
    Record,
    Reset,
}

/// Bounded-memory counter of failures within the last `window`.
///
/// Owned by a [`Breaker`](crate::Breaker); its worker task lives until the
/// tracker is dropped or [`close`](ErrorTracker::close)d.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    ops: mpsc::UnboundedSender<TrackerOp>,
    size: Arc<AtomicU32>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ErrorTracker {
    /// Spawns the worker task for a tracker with the given window.
    pub(crate) fn new(window: Duration) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let size = Arc::new(AtomicU32::new(0));
        let worker = tokio::spawn(worker_loop(window, rx, Arc::clone(&size)));

        Self { ops, size, worker: Mutex::new(Some(worker)) }
    }

    /// Records one failure at the current instant. Safe under concurrent
    /// callers; eventually observable via [`size`](Self::size).
    pub(crate) fn incr(&self) {
        // Send only fails when the worker is gone, i.e. the breaker closed.
        let _ = self.ops.send(TrackerOp::Record);
    }

    /// Drops all events and zeroes the count when `do_reset` is true.
    ///
    /// Records queued before the reset are discarded with it; the worker
    /// drains both from the same queue.
    pub(crate) fn reset(&self, do_reset: bool) {
        if !do_reset {
            return;
        }
        let _ = self.ops.send(TrackerOp::Reset);
    }

    /// The number of failures currently inside the window. Wait-free.
    pub(crate) fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Stops the worker task. Idempotent.
    pub(crate) fn close(&self) {
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

impl Drop for ErrorTracker {
    fn drop(&mut self) {
        self.close();
    }
}

async fn worker_loop(
    window: Duration,
    mut ops: mpsc::UnboundedReceiver<TrackerOp>,
    size: Arc<AtomicU32>,
) {
    let window_ns = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
    let mut events: HashMap<i64, u32> = HashMap::new();
    let start = tokio::time::Instant::now() + EVICT_INTERVAL;
    let mut sweep = tokio::time::interval_at(start, EVICT_INTERVAL);

    loop {
        tokio::select! {
            _ = sweep.tick() => evict(&mut events, &size, window_ns),
            op = ops.recv() => match op {
                Some(TrackerOp::Record) => {
                    *events.entry(now_nanos()).or_insert(0) += 1;
                    size.fetch_add(1, Ordering::AcqRel);
                }
                Some(TrackerOp::Reset) => {
                    events.clear();
                    size.store(0, Ordering::Release);
                }
                // All senders dropped: the owning breaker is gone.
                None => return,
            },
        }
    }
}

fn evict(events: &mut HashMap<i64, u32>, size: &AtomicU32, window_ns: i64) {
    if size.load(Ordering::Acquire) == 0 {
        return;
    }

    let cutoff = now_nanos() - window_ns;
    let mut freed: u32 = 0;
    events.retain(|&stamp, count| {
        if stamp < cutoff {
            freed = freed.saturating_add(*count);
            false
        } else {
            true
        }
    });

    if freed == 0 {
        return;
    }
    debug!(evicted = freed, "evicted stale failure events");

    // The count must never go below zero, even if a reset raced the sweep.
    let _ = size.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(freed))
    });
}
