//! The pool's two admission queues.
//!
//! Expedited work (`high`, `critical`) goes into a priority heap that
//! workers poll first without waiting. Everything else goes into a FIFO
//! that workers wait on with a short timeout, so they stay responsive to
//! shutdown and to newly-arrived priority work.

use crate::config::Priority;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

struct Prioritized<T> {
    priority: Priority,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Prioritized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Prioritized<T> {}

impl<T> PartialOrd for Prioritized<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Prioritized<T> {
    // Max-heap: higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct TaskQueues<T> {
    priority: Mutex<BinaryHeap<Prioritized<T>>>,
    regular: Mutex<VecDeque<T>>,
    notify: Notify,
    seq: AtomicU64,
}

impl<T> Default for TaskQueues<T> {
    fn default() -> Self {
        Self {
            priority: Mutex::new(BinaryHeap::new()),
            regular: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T> TaskQueues<T> {
    pub(crate) fn push(&self, priority: Priority, item: T) {
        if priority.is_expedited() {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            self.priority
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Prioritized {
                    priority,
                    seq,
                    item,
                });
        } else {
            self.regular
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(item);
        }
        self.notify.notify_one();
    }

    /// Non-blocking poll of the priority heap.
    pub(crate) fn try_pop_priority(&self) -> Option<T> {
        self.priority
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .map(|p| p.item)
    }

    fn try_pop_regular(&self) -> Option<T> {
        self.regular
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait up to `timeout` for regular work.
    ///
    /// Returns early with `None` when woken by a push that landed in the
    /// priority heap, so the caller can go back and poll it.
    pub(crate) async fn pop_regular_timeout(&self, timeout: Duration) -> Option<T> {
        let notified = self.notify.notified();
        if let Some(item) = self.try_pop_regular() {
            return Some(item);
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.try_pop_regular()
    }

    /// Wake every waiting worker (used on shutdown).
    pub(crate) fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn len_priority(&self) -> usize {
        self.priority
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub(crate) fn len_regular(&self) -> usize {
        self.regular.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len_priority() + self.len_regular()
    }

    /// Remove and return everything still queued.
    pub(crate) fn drain(&self) -> Vec<T> {
        let mut out: Vec<T> = Vec::new();
        while let Some(item) = self.try_pop_priority() {
            out.push(item);
        }
        out.extend(
            self.regular
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..),
        );
        out
    }
}
