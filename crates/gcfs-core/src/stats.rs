//! Garbage-collection counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by eviction, the dispatcher and reclaim workers.
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct GcStats {
    /// GC items durably recorded.
    pub items_added: AtomicU64,
    /// Evictions that found their GC item already present.
    pub duplicate_adds: AtomicU64,
    /// Items whose reclaim finished and whose marker was removed.
    pub items_reclaimed: AtomicU64,
    /// Reclaimed items whose owning subvolume was already gone.
    pub missing_subvolumes: AtomicU64,
    /// Truncation attempts repeated after `NoSpace` or `Again`.
    pub truncate_retries: AtomicU64,
    /// Items kept after a hard failure.
    pub item_failures: AtomicU64,
    pub worker_passes: AtomicU64,
    /// Worker passes aborted before touching any item.
    pub setup_failures: AtomicU64,
    pub dispatch_queued: AtomicU64,
    /// Roots skipped because a worker already owned them.
    pub dispatch_skipped: AtomicU64,
    pub queue_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStatsSnapshot {
    pub items_added: u64,
    pub duplicate_adds: u64,
    pub items_reclaimed: u64,
    pub missing_subvolumes: u64,
    pub truncate_retries: u64,
    pub item_failures: u64,
    pub worker_passes: u64,
    pub setup_failures: u64,
    pub dispatch_queued: u64,
    pub dispatch_skipped: u64,
    pub queue_failures: u64,
}

impl GcStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            items_added: self.items_added.load(Ordering::Relaxed),
            duplicate_adds: self.duplicate_adds.load(Ordering::Relaxed),
            items_reclaimed: self.items_reclaimed.load(Ordering::Relaxed),
            missing_subvolumes: self.missing_subvolumes.load(Ordering::Relaxed),
            truncate_retries: self.truncate_retries.load(Ordering::Relaxed),
            item_failures: self.item_failures.load(Ordering::Relaxed),
            worker_passes: self.worker_passes.load(Ordering::Relaxed),
            setup_failures: self.setup_failures.load(Ordering::Relaxed),
            dispatch_queued: self.dispatch_queued.load(Ordering::Relaxed),
            dispatch_skipped: self.dispatch_skipped.load(Ordering::Relaxed),
            queue_failures: self.queue_failures.load(Ordering::Relaxed),
        }
    }
}

impl GcStatsSnapshot {
    /// Items recorded but not yet reclaimed, as seen by these counters.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.items_added.saturating_sub(self.items_reclaimed)
    }
}
