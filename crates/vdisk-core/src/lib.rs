#![forbid(unsafe_code)]
//! Filesystem engine for vdisk images.
//!
//! Ties the lower crates together into the operations a front end calls:
//!
//! - [`disks`]: `mkdisk`, `rmdisk` and `fdisk` against image files.
//! - [`mount`]: the mount table. A mounted partition owns one open image
//!   handle behind a read/write lock; every filesystem operation runs under
//!   that lock.
//! - [`Filesystem`]: `mkfs`, directory and file operations, UGO checks,
//!   listings, users and groups, journaling, loss simulation and recovery.
//! - [`Session`]: the logged-in identity passed explicitly into every call.
//!
//! Every entry point returns [`VdiskError`]; nothing here retries.

pub mod disks;
pub mod fs;
pub mod mkfs;
pub mod mount;
pub mod perms;
pub mod recovery;
pub mod session;
pub mod users;

pub use disks::{disk_report, fdisk_create, fdisk_delete, fdisk_resize, mkdisk, rmdisk};
pub use fs::{CopyReport, EntryInfo, FileContent, FileType, Filesystem, TreeNode};
pub use mkfs::FormatOptions;
pub use mount::{MountId, MountInfo, MountTable, MountTableConfig, MountedPartition};
pub use recovery::{LossReport, RecoveryReport, ReplayFailure, ZeroedRegion};
pub use session::{Actor, Session};
pub use users::{UserRecord, UsersFile};

pub use vdisk_error::{Result, VdiskError};
pub use vdisk_journal::JournalOp;
pub use vdisk_ondisk::{Ebr, Inode, JournalEntry, Mbr, Partition, SuperBlock};
pub use vdisk_part::{
    DeleteMode, DiskInfo, DiskLayout, DiskOptions, DiskRegistry, PartitionKind,
    PartitionLocation, PartitionRequest,
};
pub use vdisk_types::{Fit, InodeNumber, Permissions, SizeUnit};

use vdisk_types::ParseError;

/// Convert a `ParseError` raised on user input into a `VdiskError`.
///
/// Field-level problems are caller mistakes (`InvalidArgument`); anything
/// else is reported as a parse failure. Image data never goes through here:
/// decode failures on disk records become `Corruption` in `vdisk-block`.
pub(crate) fn parse_error_to_vdisk(e: &ParseError) -> VdiskError {
    match e {
        ParseError::InvalidField { .. } | ParseError::IntegerConversion { .. } => {
            VdiskError::InvalidArgument(e.to_string())
        }
        ParseError::InsufficientData { .. } | ParseError::InvalidMagic { .. } => {
            VdiskError::Parse(e.to_string())
        }
    }
}

// ── User input parsing ──────────────────────────────────────────────────────

/// Parse `FF`, `BF` or `WF`.
pub fn parse_fit(text: &str) -> Result<Fit> {
    Fit::parse(text).map_err(|e| parse_error_to_vdisk(&e))
}

/// Parse `B`, `K` or `M`.
pub fn parse_unit(text: &str) -> Result<SizeUnit> {
    SizeUnit::parse(text).map_err(|e| parse_error_to_vdisk(&e))
}

/// Parse a three-digit UGO string such as `664`.
pub fn parse_permissions(text: &str) -> Result<Permissions> {
    Permissions::parse(text).map_err(|e| parse_error_to_vdisk(&e))
}

/// Parse `P`, `E` or `L`.
pub fn parse_partition_kind(text: &str) -> Result<PartitionKind> {
    PartitionKind::parse(text).map_err(|e| parse_error_to_vdisk(&e))
}

/// Parse `fast` or `full`.
pub fn parse_delete_mode(text: &str) -> Result<DeleteMode> {
    DeleteMode::parse(text).map_err(|e| parse_error_to_vdisk(&e))
}
