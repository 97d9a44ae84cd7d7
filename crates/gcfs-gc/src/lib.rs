#![forbid(unsafe_code)]
//! Deferred, crash-consistent reclaim of evicted inodes.
//!
//! Eviction records a GC item keyed `(subvolume, GC_INODE_ITEM_KEY, ino)` in
//! one of `nr_global_roots` fixed GC roots (`ino % nr_global_roots`). The
//! item is durable before eviction returns and is removed only after the
//! inode's items have been truncated away, so a crash in between leaves the
//! item for the next mount to finish.
//!
//! Reclaim runs as per-root jobs on the filesystem's GC work queue. A root's
//! `GC_RUNNING` bit guarantees at most one job per root. Jobs drain their
//! root only while the filesystem is closing, and dispatch refuses once it
//! is; unmount therefore dispatches first and then marks the filesystem
//! closing before flushing the queue.

pub mod dispatch;
pub mod items;
pub mod retry;
pub mod router;
pub mod worker;

pub use dispatch::{DispatchReport, queue_gc_work};
pub use items::{DeleteOutcome, add_gc_item, delete_gc_item, record_pending_reclaim};
pub use retry::{AttemptError, RetryPolicy, Transient, retry_transient};
pub use router::{gc_root_at, gc_root_index, gc_root_key, inode_gc_root};
pub use worker::{GcWork, reclaim_inode};

use gcfs_core::FsInfo;
use std::sync::Arc;

/// Schedule reclaim for every GC root that is not already being processed.
pub fn trigger_dispatch(fs: &Arc<FsInfo>) -> DispatchReport {
    queue_gc_work(fs)
}
