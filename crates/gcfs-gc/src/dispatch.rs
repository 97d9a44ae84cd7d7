//! Scheduling reclaim work onto the GC work queue.

use crate::router::gc_root_at;
use crate::worker::GcWork;
use gcfs_core::{FsInfo, GcStats};
use gcfs_tree::RootState;
use gcfs_types::INCOMPAT_EXTENT_TREE_V2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one dispatch round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub queued: u32,
    /// Roots that already had a worker.
    pub skipped_running: u32,
    pub queue_failures: u32,
}

/// Queue one worker per GC root that does not already have one.
///
/// Does nothing unless the filesystem carries `INCOMPAT_EXTENT_TREE_V2`, and
/// nothing once it is closing. A job the queue refuses is dropped, which
/// releases the root's running bit; the failure is only counted.
pub fn queue_gc_work(fs: &Arc<FsInfo>) -> DispatchReport {
    let mut report = DispatchReport::default();
    if !fs.has_incompat(INCOMPAT_EXTENT_TREE_V2) {
        debug!("gc: dispatch skipped, feature not enabled");
        return report;
    }
    if fs.is_closing() {
        debug!("gc: dispatch skipped, filesystem closing");
        return report;
    }

    for index in 0..u64::from(fs.nr_global_roots()) {
        let root = match gc_root_at(fs, index) {
            Ok(root) => root,
            Err(err) => {
                error!(index, %err, "gc: dispatch cannot resolve root");
                continue;
            }
        };
        if root.test_and_set_state(RootState::GC_RUNNING) {
            report.skipped_running += 1;
            GcStats::bump(&fs.gc_stats().dispatch_skipped);
            continue;
        }
        let work = GcWork::new(Arc::clone(fs), Arc::clone(&root));
        if let Err(err) = fs.gc_workers().try_queue(move || {
            work.run();
        }) {
            report.queue_failures += 1;
            GcStats::bump(&fs.gc_stats().queue_failures);
            warn!(root = %root.key(), %err, "gc: could not queue work");
            continue;
        }
        report.queued += 1;
        GcStats::bump(&fs.gc_stats().dispatch_queued);
    }

    info!(
        queued = report.queued,
        skipped = report.skipped_running,
        failed = report.queue_failures,
        "gc: dispatch round"
    );
    report
}
