//! Inode item truncation.

use gcfs_error::{GcfsError, Result};
use gcfs_tree::{Root, TransHandle};
use gcfs_types::{EXTENT_DATA_KEY, InodeNumber, Key};
use std::fmt;
use tracing::trace;

/// What to remove from an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateControl {
    pub ino: InodeNumber,
    /// File data at or beyond this offset is dropped.
    pub new_size: u64,
    /// Items of a lower type are kept. Zero removes the inode item as well.
    pub min_type: u8,
}

impl TruncateControl {
    /// Remove every item the inode owns.
    #[must_use]
    pub fn reclaim(ino: InodeNumber) -> Self {
        Self {
            ino,
            new_size: 0,
            min_type: 0,
        }
    }

    fn covers(&self, key: &Key) -> bool {
        key.objectid == self.ino.0
            && key.item_type >= self.min_type
            && (key.item_type != EXTENT_DATA_KEY || key.offset >= self.new_size)
    }
}

/// Removes inode items inside a caller-supplied transaction.
///
/// Every call charges the reservation bound to `trans`. Implementations
/// return `NoSpace` when that reservation cannot cover the next step and
/// `Again` when they stopped with work left; the caller ends the transaction
/// and retries in a fresh one.
pub trait TruncateEngine: Send + Sync + fmt::Debug {
    fn truncate_inode_items(
        &self,
        trans: &mut TransHandle<'_>,
        root: &Root,
        ctl: &TruncateControl,
    ) -> Result<()>;
}

/// Default engine: deletes matching items from the highest key down, one
/// charged batch at a time.
#[derive(Debug, Clone)]
pub struct ItemTruncator {
    batch: usize,
}

impl ItemTruncator {
    pub const DEFAULT_BATCH: usize = 32;

    #[must_use]
    pub fn new(batch: usize) -> Self {
        Self {
            batch: batch.max(1),
        }
    }

    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    fn next_batch(&self, root: &Root, ctl: &TruncateControl) -> Vec<Key> {
        let low = Key::new(ctl.ino.0, ctl.min_type, 0);
        let high = Key::new(ctl.ino.0, u8::MAX, u64::MAX);
        root.tree()
            .keys_in(low..=high)
            .into_iter()
            .rev()
            .filter(|key| ctl.covers(key))
            .take(self.batch)
            .collect()
    }
}

impl Default for ItemTruncator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BATCH)
    }
}

impl TruncateEngine for ItemTruncator {
    fn truncate_inode_items(
        &self,
        trans: &mut TransHandle<'_>,
        root: &Root,
        ctl: &TruncateControl,
    ) -> Result<()> {
        let mut batches = 0_u32;
        loop {
            let doomed = self.next_batch(root, ctl);
            if doomed.is_empty() {
                trace!(ino = ctl.ino.0, batches, "truncate: done");
                return Ok(());
            }
            if batches > 0 && trans.rsv_available() < trans.item_cost() {
                trace!(ino = ctl.ino.0, batches, "truncate: reservation spent");
                return Err(GcfsError::Again);
            }
            trans.del_items(root, &doomed)?;
            batches += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcfs_tree::{RsvKind, SpaceInfo, TransactionManager};
    use gcfs_types::{Generation, INODE_ITEM_KEY, INODE_REF_KEY, XATTR_ITEM_KEY};
    use std::sync::Arc;

    const UNIT: u64 = 10;

    fn populated(ino: u64, extents: u64) -> (TransactionManager, Root) {
        let mgr = TransactionManager::new(SpaceInfo::new(1_000_000, 4), UNIT, None, Generation(0))
            .expect("manager");
        let root = Root::new(Key::root(5, 0));
        let mut trans = mgr.start(extents + 3).expect("start");
        trans
            .insert_item(&root, Key::new(ino, INODE_ITEM_KEY, 0), Vec::new())
            .expect("inode");
        trans
            .insert_item(&root, Key::new(ino, INODE_REF_KEY, 256), Vec::new())
            .expect("ref");
        for i in 0..extents {
            trans
                .insert_item(&root, Key::new(ino, EXTENT_DATA_KEY, i * 4096), Vec::new())
                .expect("extent");
        }
        // A neighbour that must survive.
        trans
            .insert_item(&root, Key::new(ino + 1, INODE_ITEM_KEY, 0), Vec::new())
            .expect("neighbour");
        trans.end().expect("end");
        (mgr, root)
    }

    fn bound_rsv(mgr: &TransactionManager, units: u64) -> Arc<gcfs_tree::BlockRsv> {
        let rsv = mgr.space().alloc_block_rsv(RsvKind::Temp).expect("rsv");
        rsv.set_size(units * UNIT);
        mgr.space().refill(&rsv).expect("refill");
        rsv
    }

    #[test]
    fn reclaim_removes_every_item_of_the_inode() {
        let (mgr, root) = populated(300, 4);
        let rsv = bound_rsv(&mgr, 1);
        let mut trans = mgr.join().expect("join");
        trans
            .with_block_rsv(&rsv, |t| {
                ItemTruncator::default().truncate_inode_items(
                    t,
                    &root,
                    &TruncateControl::reclaim(InodeNumber(300)),
                )
            })
            .expect("truncate");
        trans.end().expect("end");
        assert_eq!(root.tree().keys(), vec![Key::new(301, INODE_ITEM_KEY, 0)]);
    }

    #[test]
    fn spent_reservation_reports_again_then_converges() {
        let (mgr, root) = populated(300, 10);
        let truncator = ItemTruncator::new(4);
        let ctl = TruncateControl::reclaim(InodeNumber(300));
        let rsv = bound_rsv(&mgr, 1);

        let mut rounds = 0;
        loop {
            rounds += 1;
            mgr.space().refill(&rsv).expect("refill");
            let mut trans = mgr.join().expect("join");
            let out = trans.with_block_rsv(&rsv, |t| truncator.truncate_inode_items(t, &root, &ctl));
            trans.end().expect("end");
            match out {
                Ok(()) => break,
                Err(GcfsError::Again) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        // 12 items in batches of 4 with one batch per transaction.
        assert_eq!(rounds, 3);
        assert_eq!(root.tree().len(), 1);
    }

    #[test]
    fn empty_reservation_is_no_space() {
        let (mgr, root) = populated(300, 1);
        let rsv = mgr.space().alloc_block_rsv(RsvKind::Temp).expect("rsv");
        let mut trans = mgr.join().expect("join");
        let out = trans.with_block_rsv(&rsv, |t| {
            ItemTruncator::default().truncate_inode_items(
                t,
                &root,
                &TruncateControl::reclaim(InodeNumber(300)),
            )
        });
        assert!(matches!(out, Err(GcfsError::NoSpace)));
        assert_eq!(root.tree().len(), 4);
    }

    #[test]
    fn partial_truncate_keeps_low_extents_and_lower_types() {
        let (mgr, root) = populated(300, 4);
        let rsv = bound_rsv(&mgr, 1);
        let ctl = TruncateControl {
            ino: InodeNumber(300),
            new_size: 8192,
            min_type: XATTR_ITEM_KEY,
        };
        let mut trans = mgr.join().expect("join");
        trans
            .with_block_rsv(&rsv, |t| {
                ItemTruncator::default().truncate_inode_items(t, &root, &ctl)
            })
            .expect("truncate");
        trans.end().expect("end");
        assert_eq!(
            root.tree().keys(),
            vec![
                Key::new(300, INODE_ITEM_KEY, 0),
                Key::new(300, INODE_REF_KEY, 256),
                Key::new(300, EXTENT_DATA_KEY, 0),
                Key::new(300, EXTENT_DATA_KEY, 4096),
                Key::new(301, INODE_ITEM_KEY, 0),
            ]
        );
    }
}
