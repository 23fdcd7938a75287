//! Engine statistics.
//!
//! Counters are updated as tasks run and can be read at any time through
//! [`EngineStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct EngineStats {
    tasks_scheduled: AtomicU64,
    tasks_committed: AtomicU64,
    tasks_failed: AtomicU64,
    rows_inserted: AtomicU64,
    rows_updated: AtomicU64,
    rows_deleted: AtomicU64,
    full_scans: AtomicU64,
    index_scans: AtomicU64,
    observer_evaluations: AtomicU64,
    observer_notifications: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_task_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_task_committed(&self) {
        self.tasks_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rows(&self, inserted: usize, updated: usize, deleted: usize) {
        self.rows_inserted
            .fetch_add(inserted as u64, Ordering::Relaxed);
        self.rows_updated.fetch_add(updated as u64, Ordering::Relaxed);
        self.rows_deleted.fetch_add(deleted as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_full_scan(&self) {
        self.full_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_index_scan(&self) {
        self.index_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_observer_evaluation(&self) {
        self.observer_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_observer_notification(&self) {
        self.observer_notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_committed: self.tasks_committed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_updated: self.rows_updated.load(Ordering::Relaxed),
            rows_deleted: self.rows_deleted.load(Ordering::Relaxed),
            full_scans: self.full_scans.load(Ordering::Relaxed),
            index_scans: self.index_scans.load(Ordering::Relaxed),
            observer_evaluations: self.observer_evaluations.load(Ordering::Relaxed),
            observer_notifications: self.observer_notifications.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Tasks admitted by the runner.
    pub tasks_scheduled: u64,
    /// Tasks whose journal committed.
    pub tasks_committed: u64,
    /// Tasks rejected by validation, constraints or the backing store.
    pub tasks_failed: u64,
    /// Rows inserted by committed tasks.
    pub rows_inserted: u64,
    /// Rows updated by committed tasks.
    pub rows_updated: u64,
    /// Rows deleted by committed tasks.
    pub rows_deleted: u64,
    /// Full table scans executed.
    pub full_scans: u64,
    /// Index range scans executed.
    pub index_scans: u64,
    /// Observed queries re-evaluated.
    pub observer_evaluations: u64,
    /// Observer callbacks invoked.
    pub observer_notifications: u64,
}
