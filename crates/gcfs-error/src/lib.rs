#![forbid(unsafe_code)]
//! Error types for gcfs.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `gcfs-types` | Disk-key and journal byte layout violations |
//! | Runtime | `GcfsError` | `gcfs-error` (this crate) | Everything above the byte layer |
//!
//! `gcfs-error` does not depend on `gcfs-types`; journal code converts
//! `ParseError` into `GcfsError::Corruption` where the file offset is known.
//!
//! ## Reclaim classes
//!
//! The garbage collector sorts failures into a small closed set:
//!
//! | Class | Variant | Handling |
//! |-------|---------|----------|
//! | resource exhausted | `NoSpace` | retried by the truncation loop |
//! | transient | `Again` | retried by the truncation loop |
//! | not found | `NotFound` | no-op for subvolume lookup and item deletion |
//! | allocation | `NoMemory` | aborts setup, durable state untouched |
//! | invariant | `Invariant` | item abandoned for this pass |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`GcfsError::to_errno`].
//! The match is exhaustive so a new variant must be assigned an errno.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `Invariant` | `EUCLEAN` |
//! | `Cancelled` | `EINTR` |
//! | `NoSpace` | `ENOSPC` |
//! | `Again` | `EAGAIN` |
//! | `NoMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for gcfs operations.
#[derive(Debug, Error)]
pub enum GcfsError {
    /// Operating system I/O error (journal file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal contents failed validation at a known byte offset.
    #[error("corrupt journal at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// Invalid on-disk format (bad magic, unknown version).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Geometry that cannot be honoured (zero GC roots, bad node size).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// An internal invariant was violated (unknown GC item kind, missing root).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Operation cancelled via `Cx` budget exhaustion or explicit cancel.
    #[error("operation cancelled")]
    Cancelled,

    /// Metadata reservation could not be satisfied.
    #[error("no space left on device")]
    NoSpace,

    /// The operation made partial progress and must be retried in a new transaction.
    #[error("operation must be retried")]
    Again,

    /// Scratch storage or a reservation slot could not be allocated.
    #[error("out of memory")]
    NoMemory,

    /// Root, item or subvolume not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Item already exists at the requested key.
    #[error("item exists")]
    Exists,

    /// The filesystem has been forced read-only; no transaction may start.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl GcfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::Invariant(_) => libc::EUCLEAN,
            Self::Cancelled => libc::EINTR,
            Self::NoSpace => libc::ENOSPC,
            Self::Again => libc::EAGAIN,
            Self::NoMemory => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `GcfsError`.
pub type Result<T> = std::result::Result<T, GcfsError>;
