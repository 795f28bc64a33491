#![forbid(unsafe_code)]
//! Error types for pmfs.
//!
//! # Error Taxonomy
//!
//! pmfs distinguishes two classes of failure:
//!
//! | Class | Detected | State after failure |
//! |-------|----------|---------------------|
//! | Argument | before any lock or transaction | untouched, nothing was started |
//! | Resource / policy | inside the locked, transactional region | pre-call state, the transaction is aborted |
//!
//! Both classes surface as [`PmfsError`]. Callers that speak POSIX convert
//! with [`PmfsError::to_errno`].
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno. The mapping is exhaustive
//! (no wildcard arms) so adding a new variant is a compile error until its
//! errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `InvalidArgument` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `Busy` | `EBUSY` |
//! | `PermissionDenied` | `EACCES` |
//! | `BadHandle` | `EBADF` |
//! | `BadAddress` | `EFAULT` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `ResultTooLarge` | `ERANGE` |
//! | `NotPermitted` | `EPERM` |
//! | `SymlinkLoop` | `ELOOP` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `FileTooLarge` | `EFBIG` |
//! | `Io` | `EIO` |
//! | `Corruption` | `EIO` |
//!
//! ## Design Constraints
//!
//! - `pmfs-error` MUST NOT depend on any other pmfs crate.
//! - String payloads are owned so errors can cross thread boundaries freely.

use thiserror::Error;

/// Unified error type for all pmfs operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PmfsError {
    /// Bad flag combination, out-of-range index, malformed mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A path component or handle target does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists (create, mkdir, exclusive open, link).
    #[error("file exists")]
    Exists,

    /// A path component, or an operation target, is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir or rename onto a directory that still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// The target is a root and cannot be removed or replaced.
    #[error("resource busy")]
    Busy,

    /// Insufficient permissions for the requested operation.
    #[error("permission denied")]
    PermissionDenied,

    /// The handle does not permit the requested operation.
    #[error("bad file handle")]
    BadHandle,

    /// A required argument was absent.
    #[error("bad address")]
    BadAddress,

    /// The pool could not satisfy an allocation; the transaction was aborted.
    #[error("out of memory")]
    OutOfMemory,

    /// The result does not fit in the caller's buffer.
    #[error("result too large")]
    ResultTooLarge,

    /// The operation is never allowed on this kind of object.
    #[error("operation not permitted")]
    NotPermitted,

    /// Symlink expansion exceeded the configured bound.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,

    /// A path component exceeds the name length limit.
    #[error("name too long")]
    NameTooLong,

    /// An offset or length overflowed the maximum file size.
    #[error("file too large")]
    FileTooLarge,

    /// Host I/O failure while saving or loading a pool image.
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal inconsistency between the cache and the inode table.
    #[error("corrupt inode {ino}: {detail}")]
    Corruption { ino: u64, detail: String },
}

impl PmfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Busy => libc::EBUSY,
            Self::PermissionDenied => libc::EACCES,
            Self::BadHandle => libc::EBADF,
            Self::BadAddress => libc::EFAULT,
            Self::OutOfMemory => libc::ENOMEM,
            Self::ResultTooLarge => libc::ERANGE,
            Self::NotPermitted => libc::EPERM,
            Self::SymlinkLoop => libc::ELOOP,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::FileTooLarge => libc::EFBIG,
            Self::Io(_) | Self::Corruption { .. } => libc::EIO,
        }
    }

    /// `true` for failures that are an expected outcome of probing the
    /// namespace (missing or already-present names).
    #[must_use]
    pub fn is_lookup_miss(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Exists)
    }
}

impl From<std::io::Error> for PmfsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result alias using `PmfsError`.
pub type Result<T> = std::result::Result<T, PmfsError>;
