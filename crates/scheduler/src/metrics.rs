use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational counters, shared by the submit path and workers.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    submitted: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    quanta_executed: AtomicU64,
    blocks_merged: AtomicU64,
    blocks_appended: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time copy of [`SchedulerMetrics`] for dashboards and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Tasks accepted by a pool or token.
    pub submitted: u64,
    /// Tasks refused with a too-many-tasks error.
    pub rejected: u64,
    /// Submissions or quanta skipped because the query or scanner was gone.
    pub dropped: u64,
    pub quanta_executed: u64,
    pub blocks_merged: u64,
    pub blocks_appended: u64,
    /// Panics caught on worker threads.
    pub faults: u64,
}

impl SchedulerMetrics {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quantum(&self) {
        self.quanta_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merged(&self) {
        self.blocks_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_appended(&self) {
        self.blocks_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            quanta_executed: self.quanta_executed.load(Ordering::Relaxed),
            blocks_merged: self.blocks_merged.load(Ordering::Relaxed),
            blocks_appended: self.blocks_appended.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}
