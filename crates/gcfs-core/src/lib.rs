#![forbid(unsafe_code)]
//! Mounted filesystem state.
//!
//! [`FsInfo`] ties together the trees, the metadata space pool, the
//! transaction manager, the reclaim work queue and the truncation engine of
//! one mounted filesystem.

pub mod options;
mod roots;
pub mod stats;
pub mod truncate;
pub mod workqueue;

pub use options::MountOptions;
pub use stats::{GcStats, GcStatsSnapshot};
pub use truncate::{ItemTruncator, TruncateControl, TruncateEngine};
pub use workqueue::{QueueError, WorkQueue};

use asupersync::Cx;
use gcfs_error::{GcfsError, Result};
use gcfs_tree::{
    BlockRsv, ItemJournal, JournalHeader, JournalOptions, ReplayReport, Root, SpaceInfo,
    TransHandle, TransactionManager,
};
use gcfs_types::{
    GC_TREE_OBJECTID, Generation, InodeNumber, Key, ROOT_TREE_OBJECTID, SubvolumeId,
};
use roots::{RootSet, subvol_root_key};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info, warn};

/// Name prefix of the reclaim pool threads.
pub const GC_WORKQUEUE_NAME: &str = "gcfs-gc";

// ── Closing state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClosingState {
    Open,
    /// Unmount has begun; reclaim workers drain their roots.
    Closing,
    /// Unmount has finished draining.
    Done,
}

impl ClosingState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Done,
        }
    }

    fn raw(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closing => 1,
            Self::Done => 2,
        }
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Persistent layout parameters, fixed when the journal is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub nr_global_roots: u32,
    pub nodesize: u32,
    pub incompat_flags: u64,
}

impl Geometry {
    fn from_options(options: &MountOptions) -> Self {
        Self {
            nr_global_roots: options.nr_global_roots,
            nodesize: options.nodesize,
            incompat_flags: options.incompat_flags,
        }
    }

    fn from_header(header: &JournalHeader) -> Result<Self> {
        options::validate_geometry(header.nr_global_roots, header.nodesize)?;
        Ok(Self {
            nr_global_roots: header.nr_global_roots,
            nodesize: header.nodesize,
            incompat_flags: header.incompat_flags,
        })
    }

    fn header(self) -> JournalHeader {
        JournalHeader::new(self.incompat_flags, self.nr_global_roots, self.nodesize)
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// An inode being evicted: its owning subvolume tree and number.
#[derive(Debug, Clone)]
pub struct Inode {
    pub root: Arc<Root>,
    pub ino: InodeNumber,
}

impl Inode {
    #[must_use]
    pub fn new(root: Arc<Root>, ino: InodeNumber) -> Self {
        Self { root, ino }
    }

    #[must_use]
    pub fn subvol(&self) -> SubvolumeId {
        SubvolumeId(self.root.key().objectid)
    }
}

// ── FsInfo ──────────────────────────────────────────────────────────────────

pub struct FsInfo {
    options: MountOptions,
    geometry: Geometry,
    roots: RootSet,
    trans: TransactionManager,
    closing: AtomicU8,
    gc_workers: WorkQueue,
    truncator: Arc<dyn TruncateEngine>,
    gc_stats: GcStats,
    replay: ReplayReport,
}

impl std::fmt::Debug for FsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsInfo")
            .field("geometry", &self.geometry)
            .field("closing", &self.fs_closing())
            .field("gc_workers", &self.gc_workers)
            .field("truncator", &self.truncator)
            .finish_non_exhaustive()
    }
}

impl FsInfo {
    /// Mount with the default truncation engine.
    pub fn mount(cx: &Cx, options: MountOptions) -> Result<Arc<Self>> {
        let truncator = Arc::new(ItemTruncator::new(options.truncate_batch));
        Self::mount_with_truncator(cx, options, truncator)
    }

    /// Mount, replaying the journal in `options.journal_dir` if one exists.
    pub fn mount_with_truncator(
        cx: &Cx,
        options: MountOptions,
        truncator: Arc<dyn TruncateEngine>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let roots = RootSet::default();
        let mut geometry = Geometry::from_options(&options);
        let mut replay = ReplayReport::default();
        let mut last_generation = Generation(0);
        let journal_options = JournalOptions {
            sync_on_commit: options.sync_on_commit,
            max_bytes: options.journal_max_bytes,
        };

        let journal = match options.journal_dir.as_deref() {
            None => {
                roots.init(geometry.nr_global_roots);
                None
            }
            Some(dir) if ItemJournal::exists_in(dir) => {
                let (journal, report) = ItemJournal::open(
                    cx,
                    dir,
                    journal_options,
                    |header| {
                        geometry = Geometry::from_header(header)?;
                        roots.init(geometry.nr_global_roots);
                        Ok(())
                    },
                    |commit| {
                        last_generation = commit.generation;
                        roots.apply(commit)
                    },
                )?;
                if geometry != Geometry::from_options(&options) {
                    info!(
                        ?geometry,
                        "mount: journal geometry overrides mount options"
                    );
                }
                replay = report;
                Some(journal)
            }
            Some(dir) => {
                let journal = ItemJournal::create(cx, dir, geometry.header(), journal_options)?;
                roots.init(geometry.nr_global_roots);
                Some(journal)
            }
        };

        let space = SpaceInfo::new(options.metadata_bytes, options.max_temp_rsvs);
        let item_cost = gcfs_types::calc_metadata_size(geometry.nodesize, 1);
        let trans = TransactionManager::new(space, item_cost, journal, last_generation)?;
        let gc_workers =
            WorkQueue::new(GC_WORKQUEUE_NAME, options.gc_workers, options.gc_queue_depth)?;

        info!(
            nr_global_roots = geometry.nr_global_roots,
            nodesize = geometry.nodesize,
            incompat = geometry.incompat_flags,
            replayed_commits = replay.commits_replayed,
            gc_workers = options.gc_workers,
            "mount: filesystem ready"
        );

        Ok(Arc::new(Self {
            options,
            geometry,
            roots,
            trans,
            closing: AtomicU8::new(ClosingState::Open.raw()),
            gc_workers,
            truncator,
            gc_stats: GcStats::new(),
            replay,
        }))
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    #[must_use]
    pub fn nr_global_roots(&self) -> u32 {
        self.geometry.nr_global_roots
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.geometry.nodesize
    }

    #[must_use]
    pub fn has_incompat(&self, flag: u64) -> bool {
        self.geometry.incompat_flags & flag == flag
    }

    // ── Closing ──

    #[must_use]
    pub fn fs_closing(&self) -> ClosingState {
        ClosingState::from_raw(self.closing.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.fs_closing() != ClosingState::Open
    }

    pub fn set_closing(&self, state: ClosingState) {
        let prev = ClosingState::from_raw(self.closing.swap(state.raw(), Ordering::AcqRel));
        debug!(?prev, ?state, "fs: closing state changed");
    }

    // ── Roots ──

    /// Look up a fixed global root by its root key.
    #[must_use]
    pub fn global_root(&self, key: &Key) -> Option<Arc<Root>> {
        self.roots.global_root(key)
    }

    #[must_use]
    pub fn global_roots(&self) -> Vec<Arc<Root>> {
        self.roots.global_roots()
    }

    pub fn get_fs_root(&self, id: SubvolumeId) -> Result<Arc<Root>> {
        self.roots
            .subvol(id)
            .ok_or_else(|| GcfsError::NotFound(format!("subvolume {id}")))
    }

    #[must_use]
    pub fn subvolumes(&self) -> Vec<SubvolumeId> {
        self.roots.subvol_ids()
    }

    /// Create an empty subvolume tree.
    pub fn create_fs_root(&self, id: SubvolumeId) -> Result<Arc<Root>> {
        if matches!(id.0, 0 | ROOT_TREE_OBJECTID | GC_TREE_OBJECTID) {
            return Err(GcfsError::Invariant(format!(
                "subvolume id {id} names an internal tree"
            )));
        }
        if self.roots.subvol(id).is_some() {
            return Err(GcfsError::Exists);
        }
        let mut trans = self.trans.join()?;
        let root = self.roots.insert_subvol(id)?;
        trans.log_root_created(subvol_root_key(id));
        trans.end()?;
        info!(subvol = id.0, "fs: subvolume created");
        Ok(root)
    }

    /// Drop a subvolume tree and everything in it.
    ///
    /// Pending GC items of the subvolume stay behind; reclaim treats them as
    /// already done.
    pub fn drop_fs_root(&self, id: SubvolumeId) -> Result<()> {
        if id == SubvolumeId::TOP_LEVEL {
            return Err(GcfsError::Invariant(
                "the top-level subvolume cannot be dropped".into(),
            ));
        }
        if self.roots.subvol(id).is_none() {
            return Err(GcfsError::NotFound(format!("subvolume {id}")));
        }
        let mut trans = self.trans.join()?;
        trans.log_root_dropped(subvol_root_key(id));
        self.roots.remove_subvol(id);
        trans.end()?;
        info!(subvol = id.0, "fs: subvolume dropped");
        Ok(())
    }

    // ── Space and transactions ──

    #[must_use]
    pub fn space(&self) -> &Arc<SpaceInfo> {
        self.trans.space()
    }

    #[must_use]
    pub fn trans(&self) -> &TransactionManager {
        &self.trans
    }

    /// The default reservation every transaction falls back to.
    #[must_use]
    pub fn trans_block_rsv(&self) -> &Arc<BlockRsv> {
        self.trans.default_rsv()
    }

    /// Metadata needed to modify `num_items` items.
    #[must_use]
    pub fn calc_metadata_size(&self, num_items: u64) -> u64 {
        gcfs_types::calc_metadata_size(self.geometry.nodesize, num_items)
    }

    /// Top `rsv` up and join the running transaction.
    ///
    /// A fail-fast `rsv` gives up with `NoSpace` instead of forcing a commit.
    /// The returned handle is still bound to the default reservation.
    pub fn gc_rsv_refill_and_join(&self, root: &Root, rsv: &BlockRsv) -> Result<TransHandle<'_>> {
        self.space().refill(rsv).inspect_err(|err| {
            debug!(root = %root.key(), rsv = rsv.id(), %err, "gc: reservation refill failed");
        })?;
        self.trans.join()
    }

    // ── Reclaim plumbing ──

    #[must_use]
    pub fn gc_workers(&self) -> &WorkQueue {
        &self.gc_workers
    }

    #[must_use]
    pub fn truncator(&self) -> &dyn TruncateEngine {
        self.truncator.as_ref()
    }

    #[must_use]
    pub fn gc_stats(&self) -> &GcStats {
        &self.gc_stats
    }

    #[must_use]
    pub fn replay_report(&self) -> &ReplayReport {
        &self.replay
    }

    /// Sync the journal and stop the reclaim pool.
    pub fn shutdown(&self) -> Result<()> {
        self.gc_workers.shutdown();
        if let Err(err) = self.trans.sync_journal() {
            warn!(%err, "fs: final journal sync failed");
            return Err(err);
        }
        Ok(())
    }
}
