use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::key::CacheKey;

/// One queued computation: the key and the arguments it was derived from.
///
/// Consumed exactly once by whichever worker pulls it off the queue.
#[derive(Debug)]
pub(crate) struct WorkItem<A> {
    pub key: CacheKey,
    pub args: A,
}

/// A snapshot of the dispatch bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Keys enqueued but not yet picked up by a worker.
    pub pending: usize,
    /// Keys currently being computed.
    pub in_progress: usize,
    /// Items resolved by workers since the controller was created.
    pub done: usize,
    /// Keys whose computation failed.
    pub failed: usize,
}

impl Status {
    /// Whether no work remains queued or in flight.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending: {}, in progress: {}, done: {}, failed: {}",
            self.pending, self.in_progress, self.done, self.failed
        )
    }
}

/// Accounting returned by [`wait`](crate::Memoized::wait) once the queue
/// has drained.
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Items resolved by workers since the controller was created.
    pub done: usize,
    /// Failed keys with their rendered computation errors, ordered by key.
    pub failed: Vec<(CacheKey, String)>,
}

/// Tracks pending keys, deduplicates enqueues and feeds the worker queue.
///
/// The channel is unbounded and both endpoints live here, so items queued
/// while no pool is running survive until a future pool start. A key stays
/// in the pending set from enqueue until its entry is committed or its
/// computation failed; checking membership before sending is what makes
/// duplicate misses collapse into exactly one computation.
pub(crate) struct Dispatcher<A> {
    tx: Sender<WorkItem<A>>,
    rx: Receiver<WorkItem<A>>,
    pending: Mutex<FxHashSet<CacheKey>>,
    failed: Mutex<FxHashMap<CacheKey, String>>,
    in_progress: AtomicUsize,
    done: AtomicUsize,
}

impl<A> Dispatcher<A> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Dispatcher {
            tx,
            rx,
            pending: Mutex::new(FxHashSet::default()),
            failed: Mutex::new(FxHashMap::default()),
            in_progress: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }
    }

    /// Enqueues `key` unless it is already pending.
    ///
    /// Returns whether the item was actually queued. Membership check and
    /// send happen under the pending lock, so concurrent duplicate misses
    /// race to exactly one queued item.
    pub fn enqueue(&self, key: CacheKey, args: A) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if !pending.insert(key.clone()) {
            return false;
        }
        // The channel is unbounded and we hold the receiver, so this only
        // fails if the dispatcher itself is gone.
        self.tx
            .send(WorkItem { key, args })
            .expect("work queue disconnected");
        true
    }

    pub fn receiver(&self) -> Receiver<WorkItem<A>> {
        self.rx.clone()
    }

    /// A worker pulled an item off the queue.
    pub fn started(&self) {
        self.in_progress.fetch_add(1, Ordering::Relaxed);
    }

    /// The item for `key` was committed (or found already committed).
    pub fn committed(&self, key: &CacheKey) {
        self.pending.lock().unwrap().remove(key);
        // a successful retry clears the stale failure record
        self.failed.lock().unwrap().remove(key);
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    /// The computation for `key` failed; the key leaves the pending set so
    /// a later call can explicitly re-enqueue it.
    pub fn failed(&self, key: &CacheKey, message: String) {
        self.pending.lock().unwrap().remove(key);
        self.in_progress.fetch_sub(1, Ordering::Relaxed);
        self.failed.lock().unwrap().insert(key.clone(), message);
    }

    pub fn status(&self) -> Status {
        let in_progress = self.in_progress.load(Ordering::Relaxed);
        let pending = self
            .pending
            .lock()
            .unwrap()
            .len()
            .saturating_sub(in_progress);
        Status {
            pending,
            in_progress,
            done: self.done.load(Ordering::Relaxed),
            failed: self.failed.lock().unwrap().len(),
        }
    }

    pub fn drain_report(&self) -> DrainReport {
        let mut failed: Vec<_> = self
            .failed
            .lock()
            .unwrap()
            .iter()
            .map(|(key, message)| (key.clone(), message.clone()))
            .collect();
        failed.sort_by(|a, b| a.0.digest().cmp(b.0.digest()));
        DrainReport {
            done: self.done.load(Ordering::Relaxed),
            failed,
        }
    }
}
