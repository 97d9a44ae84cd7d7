//! Transactions.
//!
//! One transaction runs at a time; callers *join* it and each join yields a
//! [`TransHandle`]. The running transaction commits (its pinned metadata is
//! released) when the last handle ends.
//!
//! A handle charges every tree mutation to the reservation currently bound to
//! it. Handles start bound to the filesystem default reservation; callers may
//! bind their own for the duration of a mutation and must rebind the default
//! before ending. Ending with a foreign reservation is counted in
//! [`TransStats::foreign_rsv_at_end`] and corrected.
//!
//! Mutations are journaled as one commit record per ended handle. A journal
//! write failure forces the filesystem read-only.

use crate::persist::ItemJournal;
use crate::rsv::{BlockRsv, RsvKind, SpaceInfo};
use crate::wal::{JournalCommit, JournalOp};
use crate::{Path, Root};
use gcfs_error::{GcfsError, Result};
use gcfs_types::{Generation, Key};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

// ── Stats ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TransStats {
    /// Handles obtained through [`TransactionManager::start`].
    pub started: AtomicU64,
    /// Handles obtained through any join, including `start`.
    pub joined: AtomicU64,
    pub ended: AtomicU64,
    pub commits_journaled: AtomicU64,
    /// Handles that reached `end` still bound to a non-default reservation.
    pub foreign_rsv_at_end: AtomicU64,
    pub journal_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransStatsSnapshot {
    pub started: u64,
    pub joined: u64,
    pub ended: u64,
    pub commits_journaled: u64,
    pub foreign_rsv_at_end: u64,
    pub journal_failures: u64,
}

impl TransStats {
    #[must_use]
    pub fn snapshot(&self) -> TransStatsSnapshot {
        TransStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            ended: self.ended.load(Ordering::Relaxed),
            commits_journaled: self.commits_journaled.load(Ordering::Relaxed),
            foreign_rsv_at_end: self.foreign_rsv_at_end.load(Ordering::Relaxed),
            journal_failures: self.journal_failures.load(Ordering::Relaxed),
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Running {
    generation: u64,
    writers: usize,
}

#[derive(Debug)]
pub struct TransactionManager {
    space: Arc<SpaceInfo>,
    default_rsv: Arc<BlockRsv>,
    item_cost: u64,
    running: Mutex<Running>,
    journal: Mutex<Option<ItemJournal>>,
    read_only: AtomicBool,
    stats: TransStats,
}

impl TransactionManager {
    /// `item_cost` is the metadata charged for a single item mutation.
    pub fn new(
        space: Arc<SpaceInfo>,
        item_cost: u64,
        journal: Option<ItemJournal>,
        last_generation: Generation,
    ) -> Result<Self> {
        let default_rsv = space.alloc_block_rsv(RsvKind::Trans)?;
        Ok(Self {
            space,
            default_rsv,
            item_cost,
            running: Mutex::new(Running {
                generation: last_generation.0,
                writers: 0,
            }),
            journal: Mutex::new(journal),
            read_only: AtomicBool::new(false),
            stats: TransStats::default(),
        })
    }

    #[must_use]
    pub fn space(&self) -> &Arc<SpaceInfo> {
        &self.space
    }

    /// The filesystem default reservation every handle starts bound to.
    #[must_use]
    pub fn default_rsv(&self) -> &Arc<BlockRsv> {
        &self.default_rsv
    }

    #[must_use]
    pub fn item_cost(&self) -> u64 {
        self.item_cost
    }

    #[must_use]
    pub fn stats(&self) -> &TransStats {
        &self.stats
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            warn!("transaction manager: filesystem forced read-only");
        }
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        Generation(self.running.lock().generation)
    }

    #[must_use]
    pub fn journaled(&self) -> bool {
        self.journal.lock().is_some()
    }

    /// Join the running transaction, opening a new one if none is running.
    ///
    /// The caller is responsible for having reserved whatever the handle will
    /// charge.
    pub fn join(&self) -> Result<TransHandle<'_>> {
        self.join_reserving(0)
    }

    /// Reserve room for `num_items` mutations in the default reservation and
    /// join.
    pub fn start(&self, num_items: u64) -> Result<TransHandle<'_>> {
        let handle = self.join_reserving(self.item_cost.saturating_mul(num_items))?;
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn join_reserving(&self, bytes: u64) -> Result<TransHandle<'_>> {
        if self.is_read_only() {
            return Err(GcfsError::ReadOnly);
        }
        let generation = {
            // Reserved bytes must be counted against a writer before any
            // commit can drain the default reservation.
            let mut running = self.running.lock();
            if bytes > 0 {
                self.space.reserve_bytes(&self.default_rsv, bytes, true)?;
            }
            if running.writers == 0 {
                running.generation += 1;
            }
            running.writers += 1;
            running.generation
        };
        self.stats.joined.fetch_add(1, Ordering::Relaxed);
        trace!(generation, "transaction: joined");
        Ok(TransHandle {
            mgr: self,
            generation: Generation(generation),
            block_rsv: Arc::clone(&self.default_rsv),
            ops: Vec::new(),
            ended: false,
        })
    }

    pub fn sync_journal(&self) -> Result<()> {
        match self.journal.lock().as_ref() {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    fn leave(&self) {
        let mut running = self.running.lock();
        running.writers = running.writers.saturating_sub(1);
        if running.writers == 0 {
            let unused = self.space.release_unused(&self.default_rsv);
            self.space.unpin_all();
            trace!(
                generation = running.generation,
                unused,
                "transaction: committed"
            );
        }
    }

    fn append(&self, commit: &JournalCommit) -> Result<()> {
        let mut journal = self.journal.lock();
        let Some(journal) = journal.as_mut() else {
            return Ok(());
        };
        journal.append(commit)?;
        self.stats.commits_journaled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// A caller's share of the running transaction.
#[derive(Debug)]
pub struct TransHandle<'a> {
    mgr: &'a TransactionManager,
    generation: Generation,
    block_rsv: Arc<BlockRsv>,
    ops: Vec<JournalOp>,
    ended: bool,
}

impl TransHandle<'_> {
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn block_rsv(&self) -> &Arc<BlockRsv> {
        &self.block_rsv
    }

    /// Bind `rsv`; later mutations are charged to it.
    pub fn set_block_rsv(&mut self, rsv: Arc<BlockRsv>) {
        self.block_rsv = rsv;
    }

    /// Rebind the filesystem default reservation.
    pub fn restore_default_rsv(&mut self) {
        self.block_rsv = Arc::clone(&self.mgr.default_rsv);
    }

    #[must_use]
    pub fn uses_default_rsv(&self) -> bool {
        Arc::ptr_eq(&self.block_rsv, &self.mgr.default_rsv)
    }

    /// Run `f` with `rsv` bound, rebinding the default afterwards whatever
    /// `f` returned.
    pub fn with_block_rsv<T>(
        &mut self,
        rsv: &Arc<BlockRsv>,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.set_block_rsv(Arc::clone(rsv));
        let out = f(self);
        self.restore_default_rsv();
        out
    }

    /// Metadata still available in the bound reservation.
    #[must_use]
    pub fn rsv_available(&self) -> u64 {
        self.block_rsv.reserved()
    }

    #[must_use]
    pub fn item_cost(&self) -> u64 {
        self.mgr.item_cost
    }

    /// Insert a zero-filled item of `data_size` bytes and point `path` at it.
    pub fn insert_empty_item(
        &mut self,
        root: &Root,
        path: &mut Path,
        key: Key,
        data_size: usize,
    ) -> Result<()> {
        self.insert_item(root, key, vec![0; data_size])?;
        path.set(key);
        Ok(())
    }

    pub fn insert_item(&mut self, root: &Root, key: Key, data: Vec<u8>) -> Result<()> {
        root.ensure_live()?;
        if root.tree().contains(&key) {
            return Err(GcfsError::Exists);
        }
        self.charge(1)?;
        root.tree().insert_new(key, data.clone())?;
        self.ops.push(JournalOp::Insert {
            root: root.key(),
            key,
            data,
        });
        Ok(())
    }

    /// Delete the item `path` points at.
    pub fn del_item(&mut self, root: &Root, path: &mut Path) -> Result<()> {
        let Some(key) = path.key() else {
            return Err(GcfsError::Invariant("del_item on an empty path".into()));
        };
        self.del_items(root, &[key])?;
        path.release();
        Ok(())
    }

    /// Delete a batch of items as one charged mutation.
    pub fn del_items(&mut self, root: &Root, keys: &[Key]) -> Result<()> {
        root.ensure_live()?;
        if keys.is_empty() {
            return Ok(());
        }
        if let Some(missing) = keys.iter().find(|k| !root.tree().contains(k)) {
            return Err(GcfsError::NotFound(format!("item {missing} in {}", root.key())));
        }
        self.charge(1)?;
        for key in keys {
            root.tree().remove(key);
            self.ops.push(JournalOp::Delete {
                root: root.key(),
                key: *key,
            });
        }
        Ok(())
    }

    pub fn log_root_created(&mut self, root: Key) {
        self.ops.push(JournalOp::CreateRoot { root });
    }

    pub fn log_root_dropped(&mut self, root: Key) {
        self.ops.push(JournalOp::DropRoot { root });
    }

    /// Leave the transaction, journaling whatever this handle changed.
    pub fn end(mut self) -> Result<()> {
        self.finish()
    }

    fn charge(&self, items: u64) -> Result<()> {
        let bytes = self.mgr.item_cost.saturating_mul(items);
        self.mgr.space.use_bytes(&self.block_rsv, bytes)
    }

    fn finish(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        if !self.uses_default_rsv() {
            self.mgr
                .stats
                .foreign_rsv_at_end
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                generation = self.generation.0,
                rsv = self.block_rsv.id(),
                "transaction: ended with a foreign reservation bound"
            );
            self.restore_default_rsv();
        }

        let ops = std::mem::take(&mut self.ops);
        let result = if ops.is_empty() {
            Ok(())
        } else {
            let commit = JournalCommit {
                generation: self.generation,
                ops,
            };
            self.mgr.append(&commit).inspect_err(|err| {
                self.mgr
                    .stats
                    .journal_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(generation = self.generation.0, %err, "transaction: journal append failed");
                self.mgr.set_read_only();
            })
        };

        self.mgr.leave();
        self.mgr.stats.ended.fetch_add(1, Ordering::Relaxed);
        debug!(generation = self.generation.0, "transaction: ended");
        result
    }
}

impl Drop for TransHandle<'_> {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(err) = self.finish() {
                error!(%err, "transaction: implicit end failed");
            }
        }
    }
}
