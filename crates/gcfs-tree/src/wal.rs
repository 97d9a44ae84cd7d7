//! Item journal format.
//!
//! Every transaction handle that changed a tree appends one commit record when
//! it ends. Replaying the records in order rebuilds every tree.
//!
//! ```text
//! File Header (24 bytes):
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x4743_4A57 ("GCJW")
//! | version          | 2 bytes| = 1
//! | checksum_type    | 2 bytes| = 0 (CRC32c)
//! | incompat_flags   | 8 bytes|
//! | nr_global_roots  | 4 bytes|
//! | nodesize         | 4 bytes|
//! +------------------+--------+
//!
//! Commit Record:
//! +------------------+--------+
//! | record_len       | 4 bytes| length of record (excluding this field)
//! | record_type      | 1 byte | = 1 (commit)
//! | generation       | 8 bytes|
//! | num_ops          | 4 bytes|
//! +------------------+--------+
//! | For each op:              |
//! |   op_type        | 1 byte |
//! |   root_key       |17 bytes|
//! |   item_key       |17 bytes| (insert / delete only)
//! |   data_len       | 4 bytes| (insert only)
//! |   data           | N bytes| (insert only)
//! +------------------+--------+
//! | record_crc       | 4 bytes| CRC32c of everything after record_len
//! +------------------+--------+
//! ```

use gcfs_error::{GcfsError, Result};
use gcfs_types::{Generation, Key, ParseError, read_le_u16, read_le_u32, read_le_u64};

/// Journal file magic number ("GCJW" little-endian).
pub const JOURNAL_MAGIC: u32 = 0x4743_4A57;

pub const JOURNAL_VERSION: u16 = 1;

pub const CHECKSUM_TYPE_CRC32C: u16 = 0;

pub const HEADER_SIZE: usize = 24;

pub const RECORD_TYPE_COMMIT: u8 = 1;

const OP_CREATE_ROOT: u8 = 1;
const OP_DROP_ROOT: u8 = 2;
const OP_INSERT: u8 = 3;
const OP_DELETE: u8 = 4;

/// Smallest possible commit record: len + type + generation + num_ops + crc.
pub const MIN_COMMIT_RECORD_SIZE: usize = 4 + 1 + 8 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub magic: u32,
    pub version: u16,
    pub checksum_type: u16,
    pub incompat_flags: u64,
    pub nr_global_roots: u32,
    pub nodesize: u32,
}

impl JournalHeader {
    #[must_use]
    pub fn new(incompat_flags: u64, nr_global_roots: u32, nodesize: u32) -> Self {
        Self {
            magic: JOURNAL_MAGIC,
            version: JOURNAL_VERSION,
            checksum_type: CHECKSUM_TYPE_CRC32C,
            incompat_flags,
            nr_global_roots,
            nodesize,
        }
    }
}

/// One logged tree change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    CreateRoot { root: Key },
    DropRoot { root: Key },
    Insert { root: Key, key: Key, data: Vec<u8> },
    Delete { root: Key, key: Key },
}

impl JournalOp {
    #[must_use]
    pub fn root(&self) -> Key {
        match self {
            Self::CreateRoot { root }
            | Self::DropRoot { root }
            | Self::Insert { root, .. }
            | Self::Delete { root, .. } => *root,
        }
    }

    fn encoded_len(&self) -> usize {
        let base = 1 + Key::DISK_SIZE;
        match self {
            Self::CreateRoot { .. } | Self::DropRoot { .. } => base,
            Self::Delete { .. } => base + Key::DISK_SIZE,
            Self::Insert { data, .. } => base + Key::DISK_SIZE + 4 + data.len(),
        }
    }
}

/// A commit record read from or written to the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalCommit {
    pub generation: Generation,
    pub ops: Vec<JournalOp>,
}

#[must_use]
pub fn encode_header(header: &JournalHeader) -> [u8; HEADER_SIZE] {
    let mut buf = [0_u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(&header.magic.to_le_bytes());
    buf[4..6].copy_from_slice(&header.version.to_le_bytes());
    buf[6..8].copy_from_slice(&header.checksum_type.to_le_bytes());
    buf[8..16].copy_from_slice(&header.incompat_flags.to_le_bytes());
    buf[16..20].copy_from_slice(&header.nr_global_roots.to_le_bytes());
    buf[20..24].copy_from_slice(&header.nodesize.to_le_bytes());
    buf
}

pub fn decode_header(bytes: &[u8]) -> Result<JournalHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(GcfsError::Format(format!(
            "journal header too short: {} < {HEADER_SIZE}",
            bytes.len()
        )));
    }
    let header = parse_header_fields(bytes).map_err(|e| GcfsError::Format(e.to_string()))?;

    if header.magic != JOURNAL_MAGIC {
        return Err(GcfsError::Format(format!(
            "bad journal magic: expected {JOURNAL_MAGIC:#x}, got {:#x}",
            header.magic
        )));
    }
    if header.version != JOURNAL_VERSION {
        return Err(GcfsError::Format(format!(
            "unsupported journal version {}",
            header.version
        )));
    }
    if header.checksum_type != CHECKSUM_TYPE_CRC32C {
        return Err(GcfsError::Format(format!(
            "unsupported journal checksum type {}",
            header.checksum_type
        )));
    }
    Ok(header)
}

fn parse_header_fields(bytes: &[u8]) -> std::result::Result<JournalHeader, ParseError> {
    Ok(JournalHeader {
        magic: read_le_u32(bytes, 0)?,
        version: read_le_u16(bytes, 4)?,
        checksum_type: read_le_u16(bytes, 6)?,
        incompat_flags: read_le_u64(bytes, 8)?,
        nr_global_roots: read_le_u32(bytes, 16)?,
        nodesize: read_le_u32(bytes, 20)?,
    })
}

/// Encode a commit record including length prefix and trailing CRC.
pub fn encode_commit(commit: &JournalCommit) -> Result<Vec<u8>> {
    let ops_size = commit
        .ops
        .iter()
        .try_fold(0_usize, |acc, op| acc.checked_add(op.encoded_len()))
        .ok_or_else(|| GcfsError::Format("commit record size overflow".to_owned()))?;
    let body_size = (1_usize + 8 + 4 + 4)
        .checked_add(ops_size)
        .ok_or_else(|| GcfsError::Format("commit record body size overflow".to_owned()))?;
    let record_len = u32::try_from(body_size)
        .map_err(|_| GcfsError::Format("commit record length exceeds u32".to_owned()))?;
    let num_ops = u32::try_from(commit.ops.len())
        .map_err(|_| GcfsError::Format("too many ops in commit".to_owned()))?;

    let mut buf = Vec::with_capacity(4 + body_size);
    buf.extend_from_slice(&record_len.to_le_bytes());
    buf.push(RECORD_TYPE_COMMIT);
    buf.extend_from_slice(&commit.generation.0.to_le_bytes());
    buf.extend_from_slice(&num_ops.to_le_bytes());

    for op in &commit.ops {
        match op {
            JournalOp::CreateRoot { root } => {
                buf.push(OP_CREATE_ROOT);
                buf.extend_from_slice(&root.to_disk());
            }
            JournalOp::DropRoot { root } => {
                buf.push(OP_DROP_ROOT);
                buf.extend_from_slice(&root.to_disk());
            }
            JournalOp::Insert { root, key, data } => {
                let data_len = u32::try_from(data.len())
                    .map_err(|_| GcfsError::Format("item data length exceeds u32".to_owned()))?;
                buf.push(OP_INSERT);
                buf.extend_from_slice(&root.to_disk());
                buf.extend_from_slice(&key.to_disk());
                buf.extend_from_slice(&data_len.to_le_bytes());
                buf.extend_from_slice(data);
            }
            JournalOp::Delete { root, key } => {
                buf.push(OP_DELETE);
                buf.extend_from_slice(&root.to_disk());
                buf.extend_from_slice(&key.to_disk());
            }
        }
    }

    let crc = crc32c::crc32c(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Result of attempting to decode a commit record.
#[derive(Debug)]
pub enum DecodeResult {
    /// Decoded a commit spanning `consumed` bytes.
    Commit {
        commit: JournalCommit,
        consumed: usize,
    },
    /// Record claims more bytes than are available (torn write).
    NeedMore(usize),
    /// CRC mismatch or malformed body.
    Corrupted(String),
    /// Zero padding or no bytes left.
    EndOfData,
}

#[must_use]
pub fn decode_commit(bytes: &[u8]) -> DecodeResult {
    if bytes.is_empty() || bytes.iter().all(|b| *b == 0) {
        return DecodeResult::EndOfData;
    }
    let Ok(record_len) = read_le_u32(bytes, 0) else {
        return DecodeResult::NeedMore(4);
    };
    let Ok(record_len) = usize::try_from(record_len) else {
        return DecodeResult::Corrupted("record length exceeds usize".to_owned());
    };
    if record_len < MIN_COMMIT_RECORD_SIZE - 4 {
        return DecodeResult::Corrupted(format!("record length {record_len} too small"));
    }
    let total = 4 + record_len;
    if bytes.len() < total {
        return DecodeResult::NeedMore(total);
    }

    let body = &bytes[4..total - 4];
    let Ok(stored_crc) = read_le_u32(bytes, total - 4) else {
        return DecodeResult::NeedMore(total);
    };
    let computed = crc32c::crc32c(body);
    if computed != stored_crc {
        return DecodeResult::Corrupted(format!(
            "crc mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
        ));
    }

    match decode_body(body) {
        Ok(commit) => DecodeResult::Commit {
            commit,
            consumed: total,
        },
        Err(e) => DecodeResult::Corrupted(e.to_string()),
    }
}

fn decode_body(body: &[u8]) -> std::result::Result<JournalCommit, ParseError> {
    if body.first() != Some(&RECORD_TYPE_COMMIT) {
        return Err(ParseError::InvalidField {
            field: "record_type",
            reason: "not a commit record",
        });
    }
    let generation = Generation(read_le_u64(body, 1)?);
    let num_ops = read_le_u32(body, 9)?;
    let mut offset = 13_usize;
    let mut ops = Vec::new();

    for _ in 0..num_ops {
        let op_type = *body.get(offset).ok_or(ParseError::InsufficientData {
            needed: 1,
            offset,
            actual: 0,
        })?;
        offset += 1;
        let root = Key::parse_disk(body, offset)?;
        offset += Key::DISK_SIZE;
        let op = match op_type {
            OP_CREATE_ROOT => JournalOp::CreateRoot { root },
            OP_DROP_ROOT => JournalOp::DropRoot { root },
            OP_DELETE => {
                let key = Key::parse_disk(body, offset)?;
                offset += Key::DISK_SIZE;
                JournalOp::Delete { root, key }
            }
            OP_INSERT => {
                let key = Key::parse_disk(body, offset)?;
                offset += Key::DISK_SIZE;
                let data_len = usize::try_from(read_le_u32(body, offset)?)
                    .map_err(|_| ParseError::IntegerConversion { field: "data_len" })?;
                offset += 4;
                let data = gcfs_types::ensure_slice(body, offset, data_len)?.to_vec();
                offset += data_len;
                JournalOp::Insert { root, key, data }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "op_type",
                    reason: "unknown journal op",
                });
            }
        };
        ops.push(op);
    }

    if offset != body.len() {
        return Err(ParseError::InvalidField {
            field: "record_len",
            reason: "trailing bytes after last op",
        });
    }
    Ok(JournalCommit { generation, ops })
}
