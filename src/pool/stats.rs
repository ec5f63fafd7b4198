//! Per-worker health counters and the pool-wide aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Counters for one async worker, updated after every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_processing_time_ms: f64,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerStats {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            tasks_completed: 0,
            tasks_failed: 0,
            average_processing_time_ms: 0.0,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    fn record(&mut self, succeeded: bool, elapsed: Duration) {
        let n = self.tasks_processed() as f64;
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.average_processing_time_ms = (self.average_processing_time_ms * n + ms) / (n + 1.0);
        if succeeded {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.last_heartbeat = Utc::now();
    }
}

/// Aggregate view over every worker plus queue and slot occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: Vec<WorkerStats>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_processing_time_ms: f64,
    pub queued_priority: usize,
    pub queued_regular: usize,
    pub thread_slots_available: usize,
    pub process_slots_available: usize,
}

impl PoolStats {
    pub fn queued(&self) -> usize {
        self.queued_priority + self.queued_regular
    }
}

/// Shared table of worker counters. The lock is held only for the update.
#[derive(Debug, Default)]
pub(crate) struct StatsTable {
    workers: Mutex<Vec<WorkerStats>>,
}

impl StatsTable {
    pub(crate) fn register(&self, worker_id: usize) {
        let mut w = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !w.iter().any(|s| s.worker_id == worker_id) {
            w.push(WorkerStats::new(worker_id));
        }
    }

    pub(crate) fn heartbeat(&self, worker_id: usize) {
        self.with(worker_id, |s| s.last_heartbeat = Utc::now());
    }

    pub(crate) fn record(&self, worker_id: usize, succeeded: bool, elapsed: Duration) {
        self.with(worker_id, |s| s.record(succeeded, elapsed));
    }

    pub(crate) fn snapshot(&self) -> Vec<WorkerStats> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn with(&self, worker_id: usize, f: impl FnOnce(&mut WorkerStats)) {
        let mut w = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = w.iter_mut().find(|s| s.worker_id == worker_id) {
            f(s);
        }
    }
}

/// Fold worker counters into totals and a task-weighted mean.
pub(crate) fn aggregate(workers: &[WorkerStats]) -> (u64, u64, f64) {
    let completed: u64 = workers.iter().map(|w| w.tasks_completed).sum();
    let failed: u64 = workers.iter().map(|w| w.tasks_failed).sum();
    let total = completed + failed;
    let mean = if total == 0 {
        0.0
    } else {
        workers
            .iter()
            .map(|w| w.average_processing_time_ms * w.tasks_processed() as f64)
            .sum::<f64>()
            / total as f64
    };
    (completed, failed, mean)
}
