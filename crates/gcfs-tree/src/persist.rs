//! Durable item journal.
//!
//! `ItemJournal` owns the append-only journal file of one filesystem. Commit
//! records are written (and optionally synced) before the transaction handle
//! that produced them finishes ending, so anything a caller observed as ended
//! survives a crash.
//!
//! # Invariants
//!
//! - Replay applies commits in file order and is deterministic.
//! - A torn or corrupt tail stops replay; everything before it is applied and
//!   the tail is cut off so new records never follow garbage.

use crate::wal::{self, DecodeResult, HEADER_SIZE, JournalCommit, JournalHeader};
use asupersync::Cx;
use gcfs_error::{GcfsError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Journal file name inside the journal directory.
pub const JOURNAL_FILE_NAME: &str = "gc.journal";

#[derive(Debug, Clone)]
pub struct JournalOptions {
    /// Whether to fsync after each appended commit (default: true).
    pub sync_on_commit: bool,
    /// Largest the journal file may grow; an append past it is `NoSpace`.
    pub max_bytes: Option<u64>,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            max_bytes: None,
        }
    }
}

/// What replay found on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub commits_replayed: u64,
    pub ops_replayed: u64,
    /// Records dropped from the tail (torn or corrupt).
    pub records_discarded: u64,
    pub valid_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug)]
pub struct ItemJournal {
    path: PathBuf,
    file: File,
    write_pos: u64,
    header: JournalHeader,
    options: JournalOptions,
    commits_written: u64,
}

impl ItemJournal {
    #[must_use]
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(JOURNAL_FILE_NAME)
    }

    #[must_use]
    pub fn exists_in(dir: &Path) -> bool {
        Self::path_in(dir).is_file()
    }

    /// Create a fresh journal, failing if one already exists.
    pub fn create(
        cx: &Cx,
        dir: impl AsRef<Path>,
        header: JournalHeader,
        options: JournalOptions,
    ) -> Result<Self> {
        cx_checkpoint(cx)?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = Self::path_in(dir);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => GcfsError::Exists,
                _ => GcfsError::Io(e),
            })?;
        file.write_all(&wal::encode_header(&header))?;
        file.sync_all()?;
        info!(
            path = %path.display(),
            nr_global_roots = header.nr_global_roots,
            "item_journal: created"
        );
        Ok(Self {
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            header,
            options,
            commits_written: 0,
        })
    }

    /// Open an existing journal, feeding every intact commit to `apply`.
    ///
    /// The header is handed to `on_header` before any commit so the caller can
    /// build the trees the commits refer to.
    pub fn open(
        cx: &Cx,
        dir: impl AsRef<Path>,
        options: JournalOptions,
        on_header: impl FnOnce(&JournalHeader) -> Result<()>,
        mut apply: impl FnMut(&JournalCommit) -> Result<()>,
    ) -> Result<(Self, ReplayReport)> {
        cx_checkpoint(cx)?;
        let path = Self::path_in(dir.as_ref());
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let header = wal::decode_header(&bytes)?;
        on_header(&header)?;

        let mut report = ReplayReport {
            total_bytes: bytes.len() as u64,
            ..ReplayReport::default()
        };
        let mut pos = HEADER_SIZE;
        loop {
            cx_checkpoint(cx)?;
            match wal::decode_commit(&bytes[pos..]) {
                DecodeResult::Commit { commit, consumed } => {
                    apply(&commit).map_err(|e| match e {
                        GcfsError::Corruption { detail, .. } => GcfsError::Corruption {
                            offset: pos as u64,
                            detail,
                        },
                        other => other,
                    })?;
                    report.commits_replayed += 1;
                    report.ops_replayed += commit.ops.len() as u64;
                    pos += consumed;
                }
                DecodeResult::EndOfData => break,
                DecodeResult::NeedMore(needed) => {
                    warn!(offset = pos, needed, "item_journal: torn tail record discarded");
                    report.records_discarded += 1;
                    break;
                }
                DecodeResult::Corrupted(detail) => {
                    warn!(offset = pos, %detail, "item_journal: corrupt tail record discarded");
                    report.records_discarded += 1;
                    break;
                }
            }
        }

        report.valid_bytes = pos as u64;
        if report.valid_bytes < report.total_bytes {
            file.set_len(report.valid_bytes)?;
            file.sync_all()?;
        }
        info!(
            path = %path.display(),
            commits = report.commits_replayed,
            ops = report.ops_replayed,
            discarded = report.records_discarded,
            "item_journal: replayed"
        );

        Ok((
            Self {
                path,
                file,
                write_pos: report.valid_bytes,
                header,
                options,
                commits_written: 0,
            },
            report,
        ))
    }

    #[must_use]
    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.write_pos
    }

    #[must_use]
    pub fn commits_written(&self) -> u64 {
        self.commits_written
    }

    pub fn append(&mut self, commit: &JournalCommit) -> Result<()> {
        let record = wal::encode_commit(commit)?;
        if let Some(max) = self.options.max_bytes {
            if self.write_pos.saturating_add(record.len() as u64) > max {
                warn!(
                    generation = commit.generation.0,
                    bytes = record.len(),
                    max,
                    "item_journal: journal full"
                );
                return Err(GcfsError::NoSpace);
            }
        }
        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&record)?;
        if self.options.sync_on_commit {
            self.file.sync_data()?;
        }
        self.write_pos += record.len() as u64;
        self.commits_written += 1;
        debug!(
            generation = commit.generation.0,
            ops = commit.ops.len(),
            bytes = record.len(),
            "item_journal: commit appended"
        );
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| GcfsError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::JournalOp;
    use gcfs_types::{GC_TREE_OBJECTID, Generation, InodeNumber, Key, SubvolumeId};

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn commit(generation: u64, ino: u64) -> JournalCommit {
        JournalCommit {
            generation: Generation(generation),
            ops: vec![JournalOp::Insert {
                root: Key::root(GC_TREE_OBJECTID, ino % 4),
                key: Key::gc_inode(SubvolumeId(5), InodeNumber(ino)),
                data: Vec::new(),
            }],
        }
    }

    #[test]
    fn create_append_reopen_replays_in_order() {
        let cx = test_cx();
        let dir = tempfile::tempdir().expect("tempdir");
        let header = JournalHeader::new(0, 4, 4096);
        {
            let mut journal =
                ItemJournal::create(&cx, dir.path(), header, JournalOptions::default())
                    .expect("create");
            journal.append(&commit(1, 10)).expect("append 1");
            journal.append(&commit(2, 11)).expect("append 2");
            assert_eq!(journal.commits_written(), 2);
        }

        let mut seen_header = None;
        let mut seen = Vec::new();
        let (journal, report) = ItemJournal::open(
            &cx,
            dir.path(),
            JournalOptions::default(),
            |h| {
                seen_header = Some(*h);
                Ok(())
            },
            |c| {
                seen.push(c.clone());
                Ok(())
            },
        )
        .expect("open");

        assert_eq!(seen_header, Some(header));
        assert_eq!(seen, vec![commit(1, 10), commit(2, 11)]);
        assert_eq!(report.commits_replayed, 2);
        assert_eq!(report.ops_replayed, 2);
        assert_eq!(report.records_discarded, 0);
        assert_eq!(journal.size(), report.total_bytes);
    }

    #[test]
    fn create_refuses_existing_journal() {
        let cx = test_cx();
        let dir = tempfile::tempdir().expect("tempdir");
        let header = JournalHeader::new(0, 4, 4096);
        let _journal = ItemJournal::create(&cx, dir.path(), header, JournalOptions::default())
            .expect("create");
        assert!(ItemJournal::exists_in(dir.path()));
        assert!(matches!(
            ItemJournal::create(&cx, dir.path(), header, JournalOptions::default()),
            Err(GcfsError::Exists)
        ));
    }

    #[test]
    fn torn_tail_is_discarded_and_truncated() {
        let cx = test_cx();
        let dir = tempfile::tempdir().expect("tempdir");
        let header = JournalHeader::new(0, 4, 4096);
        let intact_len = {
            let mut journal =
                ItemJournal::create(&cx, dir.path(), header, JournalOptions::default())
                    .expect("create");
            journal.append(&commit(1, 10)).expect("append");
            journal.size()
        };

        // Simulate a crash midway through the second record.
        let torn = wal::encode_commit(&commit(2, 11)).expect("encode");
        let mut file = OpenOptions::new()
            .append(true)
            .open(ItemJournal::path_in(dir.path()))
            .expect("open raw");
        file.write_all(&torn[..torn.len() / 2]).expect("write torn");
        drop(file);

        let mut replayed = 0;
        let (mut journal, report) = ItemJournal::open(
            &cx,
            dir.path(),
            JournalOptions::default(),
            |_| Ok(()),
            |_| {
                replayed += 1;
                Ok(())
            },
        )
        .expect("open");
        assert_eq!(replayed, 1);
        assert_eq!(report.records_discarded, 1);
        assert_eq!(report.valid_bytes, intact_len);
        assert_eq!(journal.size(), intact_len);

        // Appends land right after the last intact record.
        journal.append(&commit(3, 12)).expect("append after repair");
        drop(journal);
        let mut generations = Vec::new();
        ItemJournal::open(
            &cx,
            dir.path(),
            JournalOptions::default(),
            |_| Ok(()),
            |c| {
                generations.push(c.generation.0);
                Ok(())
            },
        )
        .expect("reopen");
        assert_eq!(generations, vec![1, 3]);
    }

    #[test]
    fn apply_errors_abort_open() {
        let cx = test_cx();
        let dir = tempfile::tempdir().expect("tempdir");
        let header = JournalHeader::new(0, 4, 4096);
        {
            let mut journal =
                ItemJournal::create(&cx, dir.path(), header, JournalOptions::default())
                    .expect("create");
            journal.append(&commit(1, 10)).expect("append");
        }
        let err = ItemJournal::open(
            &cx,
            dir.path(),
            JournalOptions::default(),
            |_| Ok(()),
            |_| {
                Err(GcfsError::Corruption {
                    offset: 0,
                    detail: "unknown root".into(),
                })
            },
        )
        .expect_err("apply failure must surface");
        assert!(matches!(
            err,
            GcfsError::Corruption {
                offset,
                ..
            } if offset == HEADER_SIZE as u64
        ));
    }

    #[test]
    fn append_past_max_bytes_is_no_space() {
        let cx = test_cx();
        let dir = tempfile::tempdir().expect("tempdir");
        let header = JournalHeader::new(0, 4, 4096);
        let options = JournalOptions {
            max_bytes: Some(HEADER_SIZE as u64 + 64),
            ..JournalOptions::default()
        };
        let mut journal = ItemJournal::create(&cx, dir.path(), header, options).expect("create");
        journal.append(&commit(1, 10)).expect("fits");
        let size = journal.size();
        assert!(matches!(
            journal.append(&commit(2, 11)),
            Err(GcfsError::NoSpace)
        ));
        assert_eq!(journal.size(), size);
        assert_eq!(journal.commits_written(), 1);
    }
}
