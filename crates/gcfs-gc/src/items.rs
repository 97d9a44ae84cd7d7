//! Durable insert and delete of GC items.
//!
//! Every mutation here refills the caller's reservation, joins the running
//! transaction, binds the reservation only around the tree change and ends
//! the transaction bound to the default reservation again.

use crate::router::inode_gc_root;
use gcfs_core::{FsInfo, GcStats, Inode};
use gcfs_error::{GcfsError, Result};
use gcfs_tree::{BlockRsv, Path, Root};
use gcfs_types::Key;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of [`delete_gc_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Someone removed the item first.
    AlreadyGone,
    /// The item could not be removed this time and is still present.
    Kept,
}

/// Insert an empty GC item at `key` in `root`.
///
/// Returns `Exists` if the item is already there. If the commit cannot be
/// journaled the item is taken back out of memory before the error returns.
pub fn add_gc_item(fs: &FsInfo, root: &Root, key: Key, rsv: &Arc<BlockRsv>) -> Result<()> {
    let mut path = Path::alloc()?;
    let mut trans = fs.gc_rsv_refill_and_join(root, rsv)?;
    let inserted = trans.with_block_rsv(rsv, |t| t.insert_empty_item(root, &mut path, key, 0));
    path.release();
    let ended = trans.end();
    inserted?;
    if let Err(err) = ended {
        root.forget(&key);
        warn!(root = %root.key(), %key, %err, "gc: item not journaled, dropped");
        return Err(err);
    }
    debug!(root = %root.key(), %key, "gc: item added");
    Ok(())
}

/// Remove the GC item at `key`, reporting rather than returning failures.
pub fn delete_gc_item(
    fs: &FsInfo,
    root: &Root,
    path: &mut Path,
    rsv: &Arc<BlockRsv>,
    key: &Key,
) -> DeleteOutcome {
    let mut trans = match fs.gc_rsv_refill_and_join(root, rsv) {
        Ok(trans) => trans,
        Err(err) => {
            warn!(root = %root.key(), %key, %err, "gc: cannot join to delete item");
            return DeleteOutcome::Kept;
        }
    };

    let outcome = match root.search_slot(key, path) {
        Ok(true) => match trans.with_block_rsv(rsv, |t| t.del_item(root, path)) {
            Ok(()) => DeleteOutcome::Deleted,
            Err(err) => {
                warn!(root = %root.key(), %key, %err, "gc: item delete failed");
                DeleteOutcome::Kept
            }
        },
        Ok(false) => {
            debug!(root = %root.key(), %key, "gc: item already removed");
            DeleteOutcome::AlreadyGone
        }
        Err(err) => {
            warn!(root = %root.key(), %key, %err, "gc: item search failed");
            DeleteOutcome::Kept
        }
    };
    path.release();

    if let Err(err) = trans.end() {
        warn!(root = %root.key(), %key, %err, "gc: transaction end failed after delete");
        if outcome == DeleteOutcome::Deleted {
            return DeleteOutcome::Kept;
        }
    }
    outcome
}

/// Durably record that `inode`'s data must be reclaimed.
///
/// Must be called from eviction, once nothing else can reach the inode.
pub fn record_pending_reclaim(fs: &FsInfo, inode: &Inode, rsv: &Arc<BlockRsv>) -> Result<()> {
    let root = inode_gc_root(fs, inode)?;
    let key = Key::gc_inode(inode.subvol(), inode.ino);
    match add_gc_item(fs, &root, key, rsv) {
        Ok(()) => {
            GcStats::bump(&fs.gc_stats().items_added);
            Ok(())
        }
        Err(GcfsError::Exists) => {
            GcStats::bump(&fs.gc_stats().duplicate_adds);
            Err(GcfsError::Exists)
        }
        Err(err) => Err(err),
    }
}
