#![forbid(unsafe_code)]
//! gcfs public API facade.
//!
//! [`Filesystem`] wraps a mounted [`FsInfo`] with the operations the CLI and
//! downstream consumers need: subvolume and inode helpers, eviction, reclaim
//! scheduling and an unmount that drains every GC root.

pub use gcfs_core::{
    ClosingState, FsInfo, GcStatsSnapshot, Geometry, ItemTruncator, MountOptions,
    TruncateControl, TruncateEngine,
};
pub use gcfs_error::{GcfsError, Result};
pub use gcfs_gc::DispatchReport;
pub use gcfs_tree::{JOURNAL_FILE_NAME, SpaceSnapshot, TransStatsSnapshot};
pub use gcfs_types::{INCOMPAT_EXTENT_TREE_V2, InodeNumber, Key, SubvolumeId};

use asupersync::Cx;
use gcfs_core::Inode;
use gcfs_gc::{GcWork, reclaim_inode, record_pending_reclaim};
use gcfs_tree::{RootState, RsvKind};
use gcfs_types::{EXTENT_DATA_KEY, INODE_ITEM_KEY, INODE_REF_KEY};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes of file data each extent item stands for.
pub const EXTENT_SIZE: u64 = 4096;

/// What eviction did with an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictOutcome {
    /// A GC item now records the pending reclaim.
    Recorded,
    /// A GC item for the inode was already pending.
    AlreadyPending,
    /// Deferred reclaim is not enabled; the inode was truncated in place.
    ReclaimedInline,
}

/// Snapshot of a mounted filesystem for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStatus {
    pub geometry: Geometry,
    pub closing: ClosingState,
    pub subvolumes: Vec<u64>,
    /// Pending GC items per GC root, indexed by root.
    pub pending_per_root: Vec<usize>,
    pub pending_gc_items: usize,
    pub replayed_commits: u64,
    pub discarded_records: u64,
    pub gc: GcStatsSnapshot,
    pub transactions: TransStatsSnapshot,
    pub space: SpaceSnapshot,
}

/// Result of [`Filesystem::close`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReport {
    pub dispatch: DispatchReport,
    /// Items removed by the closing thread after the queue was flushed.
    pub final_drain: u64,
    /// Items still pending after unmount (kept by hard failures).
    pub remaining: usize,
    pub gc: GcStatsSnapshot,
    pub transactions: TransStatsSnapshot,
}

#[derive(Debug)]
pub struct Filesystem {
    fs: Arc<FsInfo>,
}

impl Filesystem {
    pub fn mount(cx: &Cx, options: MountOptions) -> Result<Self> {
        Ok(Self {
            fs: FsInfo::mount(cx, options)?,
        })
    }

    pub fn mount_with_truncator(
        cx: &Cx,
        options: MountOptions,
        truncator: Arc<dyn TruncateEngine>,
    ) -> Result<Self> {
        Ok(Self {
            fs: FsInfo::mount_with_truncator(cx, options, truncator)?,
        })
    }

    #[must_use]
    pub fn fs_info(&self) -> &Arc<FsInfo> {
        &self.fs
    }

    // ── Subvolumes and inodes ──

    pub fn create_subvolume(&self, id: SubvolumeId) -> Result<()> {
        self.fs.create_fs_root(id).map(|_| ())
    }

    pub fn delete_subvolume(&self, id: SubvolumeId) -> Result<()> {
        self.fs.drop_fs_root(id)
    }

    /// Create an inode with `extents` data extents of [`EXTENT_SIZE`] bytes.
    pub fn create_inode(&self, subvol: SubvolumeId, ino: InodeNumber, extents: u64) -> Result<()> {
        let root = self.fs.get_fs_root(subvol)?;
        let inode_key = Key::new(ino.0, INODE_ITEM_KEY, 0);
        if root.tree().contains(&inode_key) {
            return Err(GcfsError::Exists);
        }
        let mut trans = self.fs.trans().start(extents.saturating_add(2))?;
        trans.insert_item(&root, inode_key, Vec::new())?;
        trans.insert_item(&root, Key::new(ino.0, INODE_REF_KEY, ino.0), Vec::new())?;
        for i in 0..extents {
            let offset = i.saturating_mul(EXTENT_SIZE);
            trans.insert_item(
                &root,
                Key::new(ino.0, EXTENT_DATA_KEY, offset),
                EXTENT_SIZE.to_le_bytes().to_vec(),
            )?;
        }
        trans.end()?;
        debug!(subvol = subvol.0, ino = ino.0, extents, "fs: inode created");
        Ok(())
    }

    /// Items `ino` still owns in `subvol`.
    pub fn inode_item_count(&self, subvol: SubvolumeId, ino: InodeNumber) -> Result<usize> {
        let root = self.fs.get_fs_root(subvol)?;
        Ok(root
            .tree()
            .keys_in(Key::new(ino.0, 0, 0)..=Key::new(ino.0, u8::MAX, u64::MAX))
            .len())
    }

    /// Hand an unlinked inode to reclaim.
    ///
    /// With deferred reclaim enabled this only records a GC item; the data is
    /// truncated later by a reclaim worker.
    pub fn evict_inode(&self, subvol: SubvolumeId, ino: InodeNumber) -> Result<EvictOutcome> {
        let root = self.fs.get_fs_root(subvol)?;
        if !root.tree().contains(&Key::new(ino.0, INODE_ITEM_KEY, 0)) {
            return Err(GcfsError::NotFound(format!("inode {ino} in subvolume {subvol}")));
        }

        let rsv = self.fs.space().alloc_block_rsv(RsvKind::Temp)?;
        rsv.set_size(self.fs.calc_metadata_size(1));

        let outcome = if self.fs.has_incompat(INCOMPAT_EXTENT_TREE_V2) {
            match record_pending_reclaim(&self.fs, &Inode::new(root, ino), &rsv) {
                Ok(()) => Ok(EvictOutcome::Recorded),
                Err(GcfsError::Exists) => Ok(EvictOutcome::AlreadyPending),
                Err(err) => Err(err),
            }
        } else {
            reclaim_inode(&self.fs, &rsv, subvol, ino).map(|()| EvictOutcome::ReclaimedInline)
        };
        self.fs.space().free_block_rsv(rsv);
        debug!(subvol = subvol.0, ino = ino.0, ?outcome, "fs: inode evicted");
        outcome
    }

    // ── Reclaim ──

    /// Schedule reclaim on every idle GC root.
    pub fn queue_gc(&self) -> DispatchReport {
        gcfs_gc::trigger_dispatch(&self.fs)
    }

    /// Wait for (or, with manual workers, run) every queued reclaim job.
    pub fn flush_gc(&self) {
        self.fs.gc_workers().flush();
    }

    #[must_use]
    pub fn pending_gc_items(&self) -> usize {
        self.fs.global_roots().iter().map(|r| r.tree().len()).sum()
    }

    /// GC item keys currently pending, in root order.
    #[must_use]
    pub fn pending_gc_keys(&self) -> Vec<Key> {
        self.fs
            .global_roots()
            .iter()
            .flat_map(|r| r.tree().keys())
            .collect()
    }

    #[must_use]
    pub fn status(&self) -> FsStatus {
        let pending_per_root: Vec<usize> = self
            .fs
            .global_roots()
            .iter()
            .map(|r| r.tree().len())
            .collect();
        let replay = self.fs.replay_report();
        FsStatus {
            geometry: self.fs.geometry(),
            closing: self.fs.fs_closing(),
            subvolumes: self.fs.subvolumes().into_iter().map(|id| id.0).collect(),
            pending_gc_items: pending_per_root.iter().sum(),
            pending_per_root,
            replayed_commits: replay.commits_replayed,
            discarded_records: replay.records_discarded,
            gc: self.fs.gc_stats().snapshot(),
            transactions: self.fs.trans().stats().snapshot(),
            space: self.fs.space().snapshot(),
        }
    }

    /// Unmount: drain every GC root, then stop the reclaim pool and sync.
    ///
    /// Reclaim jobs only drain while the filesystem is closing and dispatch
    /// refuses once it is, so jobs are queued first. A job that ran before
    /// the closing mark drained nothing; roots still holding items are then
    /// drained on this thread.
    pub fn close(self) -> Result<CloseReport> {
        let dispatch = gcfs_gc::queue_gc_work(&self.fs);
        self.fs.set_closing(ClosingState::Closing);
        self.fs.gc_workers().flush();

        let mut final_drain = 0;
        for root in self.fs.global_roots() {
            if root.tree().is_empty() || root.test_and_set_state(RootState::GC_RUNNING) {
                continue;
            }
            final_drain += GcWork::new(Arc::clone(&self.fs), root).run();
        }

        self.fs.set_closing(ClosingState::Done);
        self.fs.shutdown()?;

        let report = CloseReport {
            dispatch,
            final_drain,
            remaining: self.pending_gc_items(),
            gc: self.fs.gc_stats().snapshot(),
            transactions: self.fs.trans().stats().snapshot(),
        };
        info!(
            queued = report.dispatch.queued,
            final_drain = report.final_drain,
            remaining = report.remaining,
            reclaimed = report.gc.items_reclaimed,
            "fs: unmounted"
        );
        Ok(report)
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        self.fs.gc_workers().shutdown();
    }
}
