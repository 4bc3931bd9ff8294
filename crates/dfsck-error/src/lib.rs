#![forbid(unsafe_code)]
//! Error types for dfsck.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `dfsck-types` | Byte-layout violations in node, summary, or flag blocks |
//! | Runtime | `FsckError` | `dfsck-error` (this crate) | Errors surfaced by the checker to its driver |
//!
//! `dfsck-error` does not depend on `dfsck-types`; the `ParseError` →
//! `FsckError` conversion happens in `dfsck-check`, which knows the block
//! address being parsed and reports it as [`FsckError::Corruption`].
//!
//! Detected filesystem inconsistencies (orphaned inner inodes, link count
//! mismatches, ...) are **not** errors. They are findings in the check
//! report. An `Err` from the checker means the pass itself cannot continue:
//! an I/O failure, or an [`FsckError::InvariantViolation`] caused by a caller
//! misusing the API.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsckError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata at a known block could not be interpreted.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Image geometry or device shape is unusable.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller broke an API contract (e.g. registered a nid twice).
    ///
    /// The current scan must be aborted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A repair was requested on a read-only device.
    #[error("read-only device")]
    ReadOnly,

    #[error("not found: {0}")]
    NotFound(String),
}

impl FsckError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so a new variant cannot be added without
    /// choosing its errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidConfig(_) => libc::EINVAL,
            Self::InvariantViolation(_) => libc::EFAULT,
            Self::ReadOnly => libc::EROFS,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// True when the error indicates a programming error in the caller
    /// rather than a damaged image or device.
    #[must_use]
    pub fn is_fatal_invariant(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// Result alias using `FsckError`.
pub type Result<T> = std::result::Result<T, FsckError>;
