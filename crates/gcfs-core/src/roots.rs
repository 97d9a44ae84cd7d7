//! The set of trees a mounted filesystem knows about.

use gcfs_error::{GcfsError, Result};
use gcfs_tree::{JournalCommit, JournalOp, Root, RootState};
use gcfs_types::{FS_TREE_OBJECTID, GC_TREE_OBJECTID, Key, ROOT_ITEM_KEY, SubvolumeId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

/// Global GC roots plus one tree per live subvolume.
#[derive(Debug, Default)]
pub(crate) struct RootSet {
    global: RwLock<Vec<Arc<Root>>>,
    subvols: RwLock<BTreeMap<SubvolumeId, Arc<Root>>>,
    /// Subvolumes dropped since mount and not created again.
    dropped: RwLock<BTreeSet<SubvolumeId>>,
}

pub(crate) fn subvol_root_key(id: SubvolumeId) -> Key {
    Key::root(id.0, 0)
}

impl RootSet {
    /// Build the fixed GC roots and the top-level subvolume.
    pub(crate) fn init(&self, nr_global_roots: u32) {
        let global = (0..u64::from(nr_global_roots))
            .map(|i| Arc::new(Root::new(Key::root(GC_TREE_OBJECTID, i))))
            .collect();
        *self.global.write() = global;
        self.subvols.write().insert(
            SubvolumeId::TOP_LEVEL,
            Arc::new(Root::new(subvol_root_key(SubvolumeId::TOP_LEVEL))),
        );
    }

    pub(crate) fn global_root(&self, key: &Key) -> Option<Arc<Root>> {
        if key.objectid != GC_TREE_OBJECTID || key.item_type != ROOT_ITEM_KEY {
            return None;
        }
        let index = usize::try_from(key.offset).ok()?;
        self.global.read().get(index).cloned()
    }

    pub(crate) fn global_roots(&self) -> Vec<Arc<Root>> {
        self.global.read().clone()
    }

    pub(crate) fn subvol(&self, id: SubvolumeId) -> Option<Arc<Root>> {
        self.subvols.read().get(&id).cloned()
    }

    pub(crate) fn subvol_ids(&self) -> Vec<SubvolumeId> {
        self.subvols.read().keys().copied().collect()
    }

    /// Register a new subvolume tree; `Exists` if the id is taken.
    pub(crate) fn insert_subvol(&self, id: SubvolumeId) -> Result<Arc<Root>> {
        let mut subvols = self.subvols.write();
        if subvols.contains_key(&id) {
            return Err(GcfsError::Exists);
        }
        let root = Arc::new(Root::new(subvol_root_key(id)));
        subvols.insert(id, Arc::clone(&root));
        self.dropped.write().remove(&id);
        Ok(root)
    }

    /// Forget a subvolume tree and mark it dead.
    pub(crate) fn remove_subvol(&self, id: SubvolumeId) -> Option<Arc<Root>> {
        let root = self.subvols.write().remove(&id)?;
        root.test_and_set_state(RootState::DEAD);
        self.dropped.write().insert(id);
        Some(root)
    }

    fn tree_for(&self, key: &Key) -> Option<Arc<Root>> {
        if key.objectid == GC_TREE_OBJECTID {
            self.global_root(key)
        } else if key.item_type == ROOT_ITEM_KEY && key.offset == 0 {
            self.subvol(SubvolumeId(key.objectid))
        } else {
            None
        }
    }

    fn was_dropped(&self, key: &Key) -> bool {
        key.objectid != GC_TREE_OBJECTID
            && key.item_type == ROOT_ITEM_KEY
            && key.offset == 0
            && self.dropped.read().contains(&SubvolumeId(key.objectid))
    }

    /// Apply one replayed commit.
    ///
    /// A handle that changed a subvolume may end after the drop of that
    /// subvolume committed, so item ops against a dropped subvolume are
    /// skipped.
    pub(crate) fn apply(&self, commit: &JournalCommit) -> Result<()> {
        for op in &commit.ops {
            match op {
                JournalOp::CreateRoot { root } => {
                    let id = SubvolumeId(root.objectid);
                    if self.subvol(id).is_none() {
                        self.insert_subvol(id)?;
                    }
                }
                JournalOp::DropRoot { root } => {
                    if root.objectid == FS_TREE_OBJECTID {
                        return Err(corrupt(format!("drop of top-level subvolume {root}")));
                    }
                    self.remove_subvol(SubvolumeId(root.objectid));
                }
                JournalOp::Insert { root, .. } | JournalOp::Delete { root, .. } => {
                    match self.tree_for(root) {
                        Some(tree) => tree.replay(op)?,
                        None if self.was_dropped(root) => {
                            trace!(%root, "roots: op against dropped subvolume skipped");
                        }
                        None => {
                            return Err(corrupt(format!("item op against unknown root {root}")));
                        }
                    }
                }
            }
        }
        trace!(
            generation = commit.generation.0,
            ops = commit.ops.len(),
            "roots: commit applied"
        );
        Ok(())
    }
}

fn corrupt(detail: String) -> GcfsError {
    GcfsError::Corruption { offset: 0, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcfs_types::{Generation, InodeNumber};

    #[test]
    fn init_builds_fixed_roots() {
        let roots = RootSet::default();
        roots.init(4);
        assert_eq!(roots.global_roots().len(), 4);
        assert!(roots.global_root(&Key::root(GC_TREE_OBJECTID, 3)).is_some());
        assert!(roots.global_root(&Key::root(GC_TREE_OBJECTID, 4)).is_none());
        assert!(roots.global_root(&Key::root(FS_TREE_OBJECTID, 0)).is_none());
        assert!(roots.subvol(SubvolumeId::TOP_LEVEL).is_some());
    }

    #[test]
    fn apply_routes_ops_and_rejects_unknown_roots() {
        let roots = RootSet::default();
        roots.init(2);
        let sub = SubvolumeId(300);
        let gc_key = Key::gc_inode(sub, InodeNumber(9));
        let commit = JournalCommit {
            generation: Generation(1),
            ops: vec![
                JournalOp::CreateRoot {
                    root: subvol_root_key(sub),
                },
                JournalOp::Insert {
                    root: Key::root(GC_TREE_OBJECTID, 1),
                    key: gc_key,
                    data: Vec::new(),
                },
            ],
        };
        roots.apply(&commit).expect("apply");
        assert!(roots.subvol(sub).is_some());
        let gc = roots
            .global_root(&Key::root(GC_TREE_OBJECTID, 1))
            .expect("gc root");
        assert!(gc.tree().contains(&gc_key));

        let drop = JournalCommit {
            generation: Generation(2),
            ops: vec![JournalOp::DropRoot {
                root: subvol_root_key(sub),
            }],
        };
        roots.apply(&drop).expect("drop");
        assert!(roots.subvol(sub).is_none());

        let late = JournalCommit {
            generation: Generation(3),
            ops: vec![JournalOp::Delete {
                root: subvol_root_key(sub),
                key: Key::new(9, 1, 0),
            }],
        };
        roots.apply(&late).expect("late op after drop is skipped");
        assert!(roots.subvol(sub).is_none());

        let orphan = JournalCommit {
            generation: Generation(4),
            ops: vec![JournalOp::Delete {
                root: subvol_root_key(SubvolumeId(301)),
                key: Key::new(9, 1, 0),
            }],
        };
        assert!(matches!(
            roots.apply(&orphan),
            Err(GcfsError::Corruption { .. })
        ));
    }

    #[test]
    fn recreated_subvolume_takes_ops_again() {
        let roots = RootSet::default();
        roots.init(1);
        let sub = SubvolumeId(300);
        let key = Key::new(256, 1, 0);
        let commits = [
            vec![JournalOp::CreateRoot {
                root: subvol_root_key(sub),
            }],
            vec![JournalOp::DropRoot {
                root: subvol_root_key(sub),
            }],
            vec![
                JournalOp::CreateRoot {
                    root: subvol_root_key(sub),
                },
                JournalOp::Insert {
                    root: subvol_root_key(sub),
                    key,
                    data: Vec::new(),
                },
            ],
        ];
        for (generation, ops) in (1..).zip(commits) {
            roots
                .apply(&JournalCommit {
                    generation: Generation(generation),
                    ops,
                })
                .expect("apply");
        }
        let tree = roots.subvol(sub).expect("recreated");
        assert!(tree.tree().contains(&key));
        assert!(!roots.was_dropped(&subvol_root_key(sub)));
    }
}
