#![forbid(unsafe_code)]
//! Item trees, metadata reservations, transactions and the item journal.
//!
//! Trees are ordered item maps guarded by a `parking_lot::RwLock`. All
//! mutation goes through a [`TransHandle`], which charges the bound
//! [`BlockRsv`] and records the change for the [`ItemJournal`].

pub mod persist;
pub mod rsv;
pub mod trans;
pub mod wal;

pub use persist::{ItemJournal, JOURNAL_FILE_NAME, JournalOptions, ReplayReport};
pub use rsv::{BlockRsv, RsvKind, SpaceInfo, SpaceSnapshot};
pub use trans::{TransHandle, TransStats, TransStatsSnapshot, TransactionManager};
pub use wal::{JournalCommit, JournalHeader, JournalOp};

use gcfs_error::{GcfsError, Result};
use gcfs_types::{Key, MAX_LEVEL};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

// ── Tree ────────────────────────────────────────────────────────────────────

/// Ordered item map of one root.
#[derive(Debug, Default)]
pub struct Tree {
    items: RwLock<BTreeMap<Key, Vec<u8>>>,
}

impl Tree {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &Key) -> Option<Vec<u8>> {
        self.items.read().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.items.read().contains_key(key)
    }

    #[must_use]
    pub fn first_key(&self) -> Option<Key> {
        self.items.read().keys().next().copied()
    }

    /// Keys within `range`, in ascending order.
    #[must_use]
    pub fn keys_in<R: RangeBounds<Key>>(&self, range: R) -> Vec<Key> {
        self.items.read().range(range).map(|(k, _)| *k).collect()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.items.read().keys().copied().collect()
    }

    pub(crate) fn insert_new(&self, key: Key, data: Vec<u8>) -> Result<()> {
        let mut items = self.items.write();
        if items.contains_key(&key) {
            return Err(GcfsError::Exists);
        }
        items.insert(key, data);
        Ok(())
    }

    pub(crate) fn remove(&self, key: &Key) -> bool {
        self.items.write().remove(key).is_some()
    }
}

// ── Path ────────────────────────────────────────────────────────────────────

/// Scratch cursor filled by a tree search.
///
/// Holds the trail from the root down to the slot the search landed on; the
/// last entry is the item the path currently points at.
#[derive(Debug)]
pub struct Path {
    slots: Vec<Key>,
}

impl Path {
    /// Allocate a path able to hold a full-height trail.
    pub fn alloc() -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(MAX_LEVEL as usize)
            .map_err(|_| GcfsError::NoMemory)?;
        Ok(Self { slots })
    }

    /// Key of the item the path points at, if a search found one.
    #[must_use]
    pub fn key(&self) -> Option<Key> {
        self.slots.last().copied()
    }

    /// Drop whatever the last search left behind so the path can be reused.
    pub fn release(&mut self) {
        self.slots.clear();
    }

    fn set(&mut self, key: Key) {
        self.slots.clear();
        self.slots.push(key);
    }
}

// ── Root ────────────────────────────────────────────────────────────────────

/// Bits of [`Root`]'s atomic state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootState;

impl RootState {
    /// A reclaim worker owns this root.
    pub const GC_RUNNING: u64 = 1 << 0;
    /// The root has been dropped; no new lookups may land on it.
    pub const DEAD: u64 = 1 << 1;
}

/// A tree addressed by its root key.
#[derive(Debug)]
pub struct Root {
    key: Key,
    tree: Tree,
    state: AtomicU64,
}

impl Root {
    #[must_use]
    pub fn new(key: Key) -> Self {
        Self {
            key,
            tree: Tree::default(),
            state: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn key(&self) -> Key {
        self.key
    }

    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Set `bit`, returning whether it was already set.
    pub fn test_and_set_state(&self, bit: u64) -> bool {
        self.state.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    pub fn clear_state(&self, bit: u64) {
        self.state.fetch_and(!bit, Ordering::AcqRel);
    }

    #[must_use]
    pub fn test_state(&self, bit: u64) -> bool {
        self.state.load(Ordering::Acquire) & bit != 0
    }

    /// Position `path` at `key`. Returns whether the item exists.
    pub fn search_slot(&self, key: &Key, path: &mut Path) -> Result<bool> {
        self.ensure_live()?;
        path.release();
        if self.tree.contains(key) {
            path.set(*key);
            trace!(root = %self.key, %key, "search_slot: hit");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Position `path` at the lowest item in the tree.
    pub fn first_item(&self, path: &mut Path) -> Result<bool> {
        self.ensure_live()?;
        path.release();
        match self.tree.first_key() {
            Some(key) => {
                path.set(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply a journaled item operation during mount-time replay.
    ///
    /// Replay is idempotent: inserts overwrite and deletes of absent keys are
    /// ignored.
    pub fn replay(&self, op: &JournalOp) -> Result<()> {
        match op {
            JournalOp::Insert { key, data, .. } => {
                self.tree.items.write().insert(*key, data.clone());
                Ok(())
            }
            JournalOp::Delete { key, .. } => {
                self.tree.remove(key);
                Ok(())
            }
            JournalOp::CreateRoot { .. } | JournalOp::DropRoot { .. } => Err(
                GcfsError::Invariant(format!("root op replayed against tree {}", self.key)),
            ),
        }
    }

    /// Remove `key` from memory without journaling, to undo a change whose
    /// commit never reached the journal.
    pub fn forget(&self, key: &Key) -> bool {
        self.tree.remove(key)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.test_state(RootState::DEAD) {
            return Err(GcfsError::Invariant(format!("root {} is dead", self.key)));
        }
        Ok(())
    }
}
