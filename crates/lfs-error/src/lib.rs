#![forbid(unsafe_code)]
//! Error types for the LFS write-back core.
//!
//! # Error Taxonomy
//!
//! Only *fatal* conditions are errors. Transient page contention and the
//! structured retry signals (hard-stop on a busy page, a full single-file
//! segment, "try again" for the evictor) are ordinary return values of the
//! crates that produce them and never reach this type.
//!
//! | Variant | errno | Raised by |
//! |---------|-------|-----------|
//! | `Io` | raw or `EIO` | log device backends |
//! | `Device` | `EIO` | segment flush |
//! | `NoSpace` | `ENOSPC` | segment flush past the end of the log |
//! | `InvalidGeometry` | `EINVAL` | configuration validation |
//! | `NotFound` | `ENOENT` | lookups of unknown files |
//! | `NotPermitted` | `EPERM` | writable fault on the reserved metadata inode |
//! | `ReadOnly` | `EROFS` | writes against a read-only instance |
//! | `Deadlock` | `EDEADLK` | nested segment-lock acquisition by its holder |
//!
//! Fatal errors are propagated unchanged to the caller and surface
//! at the filesystem API boundary as a write/sync failure.

use thiserror::Error;

/// Unified error type for all write-back operations.
#[derive(Debug, Error)]
pub enum LfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The log device rejected a partial-segment write.
    #[error("device write failed at log address {addr}: {detail}")]
    Device { addr: u64, detail: String },

    /// The log has no room for another partial segment.
    #[error("no space left on log device")]
    NoSpace,

    /// Page or block geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// File or other named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation forbidden regardless of credentials.
    #[error("operation not permitted")]
    NotPermitted,

    /// Instance is read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The caller already holds the lock it is trying to take.
    #[error("deadlock avoided: {0}")]
    Deadlock(String),
}

impl LfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; a new variant is a compile error here until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Device { .. } => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotPermitted => libc::EPERM,
            Self::ReadOnly => libc::EROFS,
            Self::Deadlock(_) => libc::EDEADLK,
        }
    }
}

/// Result alias using `LfsError`.
pub type Result<T> = std::result::Result<T, LfsError>;
