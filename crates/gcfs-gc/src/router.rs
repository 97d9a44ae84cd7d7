//! Static partition of inodes across the GC roots.

use gcfs_core::{FsInfo, Inode};
use gcfs_error::{GcfsError, Result};
use gcfs_tree::Root;
use gcfs_types::{GC_TREE_OBJECTID, InodeNumber, Key};
use std::sync::Arc;

/// Index of the GC root that holds `ino`'s item.
///
/// `nr_global_roots` is never zero on a mounted filesystem.
#[must_use]
pub fn gc_root_index(ino: InodeNumber, nr_global_roots: u32) -> u64 {
    ino.0 % u64::from(nr_global_roots.max(1))
}

#[must_use]
pub fn gc_root_key(index: u64) -> Key {
    Key::root(GC_TREE_OBJECTID, index)
}

/// The GC root an inode's reclaim marker lives in.
pub fn inode_gc_root(fs: &FsInfo, inode: &Inode) -> Result<Arc<Root>> {
    gc_root_at(fs, gc_root_index(inode.ino, fs.nr_global_roots()))
}

pub fn gc_root_at(fs: &FsInfo, index: u64) -> Result<Arc<Root>> {
    let key = gc_root_key(index);
    fs.global_root(&key).ok_or_else(|| GcfsError::Corruption {
        offset: 0,
        detail: format!("GC root {key} missing from a mounted filesystem"),
    })
}
