//! Per-root reclaim worker.
//!
//! A [`GcWork`] owns its root's `GC_RUNNING` bit from the moment the
//! dispatcher sets it until the work is dropped, whether it ran or not.

use crate::items::{DeleteOutcome, delete_gc_item};
use crate::retry::{AttemptError, RetryPolicy, retry_transient};
use gcfs_core::{FsInfo, GcStats, TruncateControl};
use gcfs_error::{GcfsError, Result};
use gcfs_tree::{BlockRsv, Path, Root, RootState, RsvKind};
use gcfs_types::{GcItemKind, InodeNumber, Key, SubvolumeId};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// One pass over one GC root.
#[derive(Debug)]
pub struct GcWork {
    fs: Arc<FsInfo>,
    root: Arc<Root>,
}

impl Drop for GcWork {
    fn drop(&mut self) {
        self.root.clear_state(RootState::GC_RUNNING);
        trace!(root = %self.root.key(), "gc: running flag cleared");
    }
}

impl GcWork {
    /// The caller must already hold `root`'s `GC_RUNNING` bit.
    #[must_use]
    pub fn new(fs: Arc<FsInfo>, root: Arc<Root>) -> Self {
        Self { fs, root }
    }

    /// Drain the root while the filesystem is closing. Returns the number of
    /// items removed.
    pub fn run(self) -> u64 {
        let fs = &*self.fs;
        GcStats::bump(&fs.gc_stats().worker_passes);

        let mut path = match Path::alloc() {
            Ok(path) => path,
            Err(err) => {
                GcStats::bump(&fs.gc_stats().setup_failures);
                warn!(root = %self.root.key(), %err, "gc: path allocation failed");
                return 0;
            }
        };
        let rsv = match fs.space().alloc_block_rsv(RsvKind::Temp) {
            Ok(rsv) => rsv,
            Err(err) => {
                GcStats::bump(&fs.gc_stats().setup_failures);
                warn!(root = %self.root.key(), %err, "gc: reservation allocation failed");
                return 0;
            }
        };
        rsv.set_size(fs.calc_metadata_size(1));
        rsv.set_failfast(true);

        let removed = self.drain(&mut path, &rsv);
        fs.space().free_block_rsv(rsv);
        debug!(root = %self.root.key(), removed, "gc: pass finished");
        removed
    }

    fn drain(&self, path: &mut Path, rsv: &Arc<BlockRsv>) -> u64 {
        let fs = &*self.fs;
        let mut removed = 0;
        while fs.is_closing() {
            match self.root.first_item(path) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    warn!(root = %self.root.key(), %err, "gc: cannot read first item");
                    break;
                }
            }
            let Some(key) = path.key() else {
                break;
            };
            path.release();

            let reclaimed = match GcItemKind::from_item_type(key.item_type) {
                Some(GcItemKind::InodeReclaim) => gc_inode(fs, rsv, &key),
                None => Err(GcfsError::Invariant(format!(
                    "unknown GC item type {} at {key}",
                    key.item_type
                ))),
            };
            if let Err(err) = reclaimed {
                GcStats::bump(&fs.gc_stats().item_failures);
                error!(root = %self.root.key(), %key, %err, "gc: reclaim failed, item kept");
                break;
            }

            match delete_gc_item(fs, &self.root, path, rsv, &key) {
                DeleteOutcome::Deleted => {
                    GcStats::bump(&fs.gc_stats().items_reclaimed);
                    removed += 1;
                }
                DeleteOutcome::AlreadyGone => {}
                DeleteOutcome::Kept => break,
            }
        }
        removed
    }
}

/// Truncate every item of the inode named by a GC key.
fn gc_inode(fs: &FsInfo, rsv: &Arc<BlockRsv>, key: &Key) -> Result<()> {
    reclaim_inode(fs, rsv, SubvolumeId(key.objectid), InodeNumber(key.offset))
}

/// Remove all of `ino`'s items from `subvol`, retrying in fresh transactions
/// while the truncation reports `NoSpace` or `Again`.
///
/// A subvolume that no longer exists has nothing left to reclaim.
pub fn reclaim_inode(
    fs: &FsInfo,
    rsv: &Arc<BlockRsv>,
    subvol: SubvolumeId,
    ino: InodeNumber,
) -> Result<()> {
    let root = match fs.get_fs_root(subvol) {
        Ok(root) => root,
        Err(err) if err.is_not_found() => {
            GcStats::bump(&fs.gc_stats().missing_subvolumes);
            debug!(subvol = subvol.0, ino = ino.0, "gc: subvolume gone, nothing to reclaim");
            return Ok(());
        }
        Err(err) => {
            error!(subvol = subvol.0, %err, "gc: subvolume lookup failed");
            return Err(err);
        }
    };

    let ctl = TruncateControl::reclaim(ino);
    let policy = RetryPolicy {
        max_attempts: fs.options().gc_max_truncate_attempts,
    };
    let out = retry_transient(
        policy,
        |attempt| {
            let mut trans = fs
                .gc_rsv_refill_and_join(&root, rsv)
                .map_err(AttemptError::Fatal)?;
            trace!(subvol = subvol.0, ino = ino.0, attempt, "gc: truncating");
            let truncated =
                trans.with_block_rsv(rsv, |t| fs.truncator().truncate_inode_items(t, &root, &ctl));
            trans.end().map_err(AttemptError::Fatal)?;
            truncated.map_err(AttemptError::Failed)
        },
        |kind, attempt| {
            GcStats::bump(&fs.gc_stats().truncate_retries);
            trace!(subvol = subvol.0, ino = ino.0, attempt, ?kind, "gc: truncate retry");
        },
    );

    match out {
        Err(err) if root.test_state(RootState::DEAD) => {
            GcStats::bump(&fs.gc_stats().missing_subvolumes);
            debug!(subvol = subvol.0, ino = ino.0, %err, "gc: subvolume dropped during reclaim");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::add_gc_item;
    use crate::router::gc_root_at;
    use asupersync::Cx;
    use gcfs_core::{ClosingState, MountOptions};
    use gcfs_types::{EXTENT_DATA_KEY, INODE_ITEM_KEY};

    fn mounted() -> Arc<FsInfo> {
        FsInfo::mount(&Cx::for_testing(), MountOptions::in_memory()).expect("mount")
    }

    fn add(fs: &FsInfo, root: &Root, key: Key) {
        let rsv = fs.space().alloc_block_rsv(RsvKind::Temp).expect("rsv");
        rsv.set_size(fs.calc_metadata_size(1));
        add_gc_item(fs, root, key, &rsv).expect("add");
    }

    fn claim(root: &Root) {
        assert!(!root.test_and_set_state(RootState::GC_RUNNING));
    }

    #[test]
    fn open_filesystem_drains_nothing() {
        let fs = mounted();
        let root = gc_root_at(&fs, 1).expect("root");
        add(&fs, &root, Key::gc_inode(SubvolumeId(5), InodeNumber(1)));
        claim(&root);
        assert_eq!(GcWork::new(Arc::clone(&fs), Arc::clone(&root)).run(), 0);
        assert_eq!(root.tree().len(), 1);
        assert!(!root.test_state(RootState::GC_RUNNING));
    }

    #[test]
    fn closing_filesystem_drains_and_truncates() {
        let fs = mounted();
        let subvol = fs.get_fs_root(SubvolumeId::TOP_LEVEL).expect("subvol");
        let mut trans = fs.trans().start(3).expect("start");
        trans
            .insert_item(&subvol, Key::new(17, INODE_ITEM_KEY, 0), Vec::new())
            .expect("inode");
        trans
            .insert_item(&subvol, Key::new(17, EXTENT_DATA_KEY, 0), Vec::new())
            .expect("extent");
        trans
            .insert_item(&subvol, Key::new(18, INODE_ITEM_KEY, 0), Vec::new())
            .expect("neighbour");
        trans.end().expect("end");

        let root = gc_root_at(&fs, 1).expect("root");
        add(&fs, &root, Key::gc_inode(SubvolumeId::TOP_LEVEL, InodeNumber(17)));

        fs.set_closing(ClosingState::Closing);
        claim(&root);
        assert_eq!(GcWork::new(Arc::clone(&fs), Arc::clone(&root)).run(), 1);
        assert!(root.tree().is_empty());
        assert_eq!(subvol.tree().keys(), vec![Key::new(18, INODE_ITEM_KEY, 0)]);
        assert!(!root.test_state(RootState::GC_RUNNING));
        assert_eq!(fs.trans().stats().snapshot().foreign_rsv_at_end, 0);
    }

    #[test]
    fn missing_subvolume_counts_as_reclaimed() {
        let fs = mounted();
        let root = gc_root_at(&fs, 2).expect("root");
        add(&fs, &root, Key::gc_inode(SubvolumeId(999), InodeNumber(2)));
        fs.set_closing(ClosingState::Closing);
        claim(&root);
        assert_eq!(GcWork::new(Arc::clone(&fs), Arc::clone(&root)).run(), 1);
        assert!(root.tree().is_empty());
        assert_eq!(fs.gc_stats().snapshot().missing_subvolumes, 1);
    }

    #[test]
    fn unknown_item_kind_is_kept_and_stops_the_pass() {
        let fs = mounted();
        let root = gc_root_at(&fs, 0).expect("root");
        let odd = Key::new(5, INODE_ITEM_KEY, 0);
        add(&fs, &root, odd);
        add(&fs, &root, Key::gc_inode(SubvolumeId(5), InodeNumber(16)));
        fs.set_closing(ClosingState::Closing);
        claim(&root);
        assert_eq!(GcWork::new(Arc::clone(&fs), Arc::clone(&root)).run(), 0);
        assert_eq!(root.tree().len(), 2);
        assert_eq!(fs.gc_stats().snapshot().item_failures, 1);
        assert!(!root.test_state(RootState::GC_RUNNING));
    }

    #[test]
    fn work_dropped_unrun_clears_running_flag() {
        let fs = mounted();
        let root = gc_root_at(&fs, 3).expect("root");
        claim(&root);
        let work = GcWork::new(Arc::clone(&fs), Arc::clone(&root));
        fs.gc_workers()
            .try_queue(move || {
                work.run();
            })
            .expect("queue");
        assert!(root.test_state(RootState::GC_RUNNING));

        // Manual queues drop pending jobs on shutdown.
        fs.gc_workers().shutdown();
        assert_eq!(fs.gc_workers().pending(), 0);
        assert!(!root.test_state(RootState::GC_RUNNING));
        assert_eq!(fs.gc_stats().snapshot().worker_passes, 0);
    }

    #[test]
    fn setup_failure_clears_running_flag() {
        let options = MountOptions {
            max_temp_rsvs: 0,
            ..MountOptions::in_memory()
        };
        let fs = FsInfo::mount(&Cx::for_testing(), options).expect("mount");
        let root = gc_root_at(&fs, 0).expect("root");
        fs.set_closing(ClosingState::Closing);
        claim(&root);
        assert_eq!(GcWork::new(Arc::clone(&fs), Arc::clone(&root)).run(), 0);
        assert!(!root.test_state(RootState::GC_RUNNING));
        assert_eq!(fs.gc_stats().snapshot().setup_failures, 1);
    }
}
