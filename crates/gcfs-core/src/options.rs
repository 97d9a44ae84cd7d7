//! Mount options.

use gcfs_error::{GcfsError, Result};
use gcfs_types::{DEFAULT_NODESIZE, INCOMPAT_EXTENT_TREE_V2};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options for [`crate::FsInfo::mount`].
///
/// Geometry fields (`nr_global_roots`, `nodesize`, `incompat_flags`) only
/// apply when a new journal is created; an existing journal header wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Number of GC roots inodes are spread across.
    pub nr_global_roots: u32,
    pub nodesize: u32,
    pub incompat_flags: u64,
    /// Size of the metadata space pool in bytes.
    pub metadata_bytes: u64,
    /// Temporary reservations that may exist at once.
    pub max_temp_rsvs: usize,
    /// Reclaim worker threads; 0 runs queued work only on `flush`.
    pub gc_workers: usize,
    /// Reclaim jobs that may be queued or running at once.
    pub gc_queue_depth: usize,
    /// Cap on truncation attempts per item. `None` retries until the
    /// truncation stops reporting `NoSpace`/`Again`.
    pub gc_max_truncate_attempts: Option<u32>,
    /// Items the default truncation engine removes per charged batch.
    pub truncate_batch: usize,
    /// Directory holding `gc.journal`. `None` keeps everything in memory.
    pub journal_dir: Option<PathBuf>,
    pub sync_on_commit: bool,
    /// Cap on the journal file size; commits past it fail with `NoSpace`
    /// and turn the filesystem read-only.
    pub journal_max_bytes: Option<u64>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            nr_global_roots: 16,
            nodesize: DEFAULT_NODESIZE,
            incompat_flags: INCOMPAT_EXTENT_TREE_V2,
            metadata_bytes: 1 << 30,
            max_temp_rsvs: 64,
            gc_workers: 4,
            gc_queue_depth: 64,
            gc_max_truncate_attempts: None,
            truncate_batch: 32,
            journal_dir: None,
            sync_on_commit: true,
            journal_max_bytes: None,
        }
    }
}

impl MountOptions {
    /// In-memory options with manual reclaim workers, for tests and tools.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            gc_workers: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_geometry(self.nr_global_roots, self.nodesize)?;
        if self.gc_queue_depth == 0 {
            return Err(GcfsError::InvalidGeometry(
                "gc_queue_depth must be at least 1".into(),
            ));
        }
        if self.gc_max_truncate_attempts == Some(0) {
            return Err(GcfsError::InvalidGeometry(
                "gc_max_truncate_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_geometry(nr_global_roots: u32, nodesize: u32) -> Result<()> {
    if nr_global_roots == 0 {
        return Err(GcfsError::InvalidGeometry(
            "nr_global_roots must be at least 1".into(),
        ));
    }
    if !nodesize.is_power_of_two() || !(4096..=65536).contains(&nodesize) {
        return Err(GcfsError::InvalidGeometry(format!(
            "nodesize {nodesize} must be a power of two in 4096..=65536"
        )));
    }
    Ok(())
}
