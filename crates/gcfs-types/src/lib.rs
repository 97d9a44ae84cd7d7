#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Tree node size used for metadata reservation sizing.
pub const DEFAULT_NODESIZE: u32 = 16 * 1024;

/// Maximum tree depth; reservations assume a full-height COW per item.
pub const MAX_LEVEL: u64 = 8;

// ── Object ids ──────────────────────────────────────────────────────────────

pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const GC_TREE_OBJECTID: u64 = 13;

// ── Item types ──────────────────────────────────────────────────────────────

pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const XATTR_ITEM_KEY: u8 = 24;
/// Pending inode reclaim marker in a GC root.
pub const GC_INODE_ITEM_KEY: u8 = 100;
pub const EXTENT_DATA_KEY: u8 = 108;
pub const ROOT_ITEM_KEY: u8 = 132;

/// Incompat flag gating GC roots and deferred reclaim.
pub const INCOMPAT_EXTENT_TREE_V2: u64 = 1 << 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Object id of a subvolume (fs tree) root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubvolumeId(pub u64);

impl SubvolumeId {
    pub const TOP_LEVEL: Self = Self(FS_TREE_OBJECTID);
}

/// Transaction generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

// ── Keys ────────────────────────────────────────────────────────────────────

/// Item key; ordering is `(objectid, item_type, offset)` as in the on-disk trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    /// Size of an encoded disk key (objectid:u64 + type:u8 + offset:u64).
    pub const DISK_SIZE: usize = 17;

    pub const MIN: Self = Self::new(0, 0, 0);
    pub const MAX: Self = Self::new(u64::MAX, u8::MAX, u64::MAX);

    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Key of a root item, which is also the address of the root itself.
    #[must_use]
    pub const fn root(objectid: u64, offset: u64) -> Self {
        Self::new(objectid, ROOT_ITEM_KEY, offset)
    }

    /// GC marker for `ino` owned by `subvol`.
    #[must_use]
    pub const fn gc_inode(subvol: SubvolumeId, ino: InodeNumber) -> Self {
        Self::new(subvol.0, GC_INODE_ITEM_KEY, ino.0)
    }

    #[must_use]
    pub fn to_disk(&self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0_u8; Self::DISK_SIZE];
        out[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        out[8] = self.item_type;
        out[9..17].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn parse_disk(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let bytes = ensure_slice(data, offset, Self::DISK_SIZE)?;
        Ok(Self {
            objectid: read_le_u64(bytes, 0)?,
            item_type: bytes[8],
            offset: read_le_u64(bytes, 9)?,
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

/// Kinds of item that may live in a GC root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcItemKind {
    /// Inode data must be truncated to zero; key offset is the inode number.
    InodeReclaim,
}

impl GcItemKind {
    #[must_use]
    pub fn from_item_type(item_type: u8) -> Option<Self> {
        match item_type {
            GC_INODE_ITEM_KEY => Some(Self::InodeReclaim),
            _ => None,
        }
    }

    #[must_use]
    pub fn item_type(self) -> u8 {
        match self {
            Self::InodeReclaim => GC_INODE_ITEM_KEY,
        }
    }
}

/// Metadata bytes needed to COW `num_items` items down a full-height path.
#[must_use]
pub fn calc_metadata_size(nodesize: u32, num_items: u64) -> u64 {
    u64::from(nodesize)
        .saturating_mul(MAX_LEVEL)
        .saturating_mul(2)
        .saturating_mul(num_items)
}

// ── Parsing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SubvolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
