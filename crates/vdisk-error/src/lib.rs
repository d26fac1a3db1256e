#![forbid(unsafe_code)]
//! Error types for vdisk.
//!
//! # Error Taxonomy
//!
//! vdisk uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `vdisk-types` | Fixed-layout codec violations |
//! | Runtime | `VdiskError` | `vdisk-error` (this crate) | Errors returned by every partition, filesystem and journal operation |
//!
//! `vdisk-error` does not depend on `vdisk-types`. Decode failures on image
//! data are converted by `vdisk_block::corruption_at`, which attaches the
//! image offset the record was read from. Failures on user input (fit and
//! unit codes, permission strings) are converted in `vdisk-core`:
//!
//! | ParseError Variant | From image data | From user input |
//! |--------------------|-----------------|-----------------|
//! | `InsufficientData` | `Corruption` | `Parse` |
//! | `InvalidMagic` | `Corruption` | `Parse` |
//! | `InvalidField` | `Corruption` | `InvalidArgument` |
//! | `IntegerConversion` | `Corruption` | `InvalidArgument` |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`VdiskError::to_errno`].
//! The mapping has no wildcard arm, so a new variant does not compile until
//! its errno is chosen.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `NotFound` | `ENOENT` |
//! | `AlreadyExists` | `EEXIST` |
//! | `PermissionDenied` | `EACCES` |
//! | `InvalidArgument` | `EINVAL` |
//! | `CapacityExceeded` | `ENOSPC` |
//! | `Corruption` | `EIO` |
//! | `NotAFilesystemFeature` | `EOPNOTSUPP` |
//! | `Parse` | `EINVAL` |
//!
//! Errors are never retried inside vdisk; callers decide.

use thiserror::Error;

/// Unified error type for all vdisk operations.
#[derive(Debug, Error)]
pub enum VdiskError {
    /// Operating system I/O error on the image file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path, partition, mount id, user or group absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate partition, file, directory, user or group name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// UGO check failed or the acting user lacks the root group.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Bad unit/fit/type codes, negative sizes, malformed UGO strings,
    /// content larger than a file's allocation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free inode or block, disk or partition space exhausted,
    /// journal full.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// On-disk structure could not be decoded, or bootstrap objects are
    /// missing outside the recovery path.
    #[error("corrupt structure at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// Journaling was requested on a partition formatted without it.
    #[error("filesystem feature unavailable: {0}")]
    NotAFilesystemFeature(String),

    /// Codec failure on user-provided input.
    #[error("parse error: {0}")]
    Parse(String),
}

impl VdiskError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::InvalidArgument(_) | Self::Parse(_) => libc::EINVAL,
            Self::CapacityExceeded(_) => libc::ENOSPC,
            Self::Corruption { .. } => libc::EIO,
            Self::NotAFilesystemFeature(_) => libc::EOPNOTSUPP,
        }
    }

    /// Short stable tag for logs and JSON output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::PermissionDenied(_) => "permission_denied",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::Corruption { .. } => "corruption",
            Self::NotAFilesystemFeature(_) => "not_a_filesystem_feature",
            Self::Parse(_) => "parse",
        }
    }
}

/// Result alias using `VdiskError`.
pub type Result<T> = std::result::Result<T, VdiskError>;
