#![forbid(unsafe_code)]
//! On-disk record codecs for vdisk images.
//!
//! Pure parsing crate: no I/O. Every record is a fixed-size little-endian
//! structure decoded with `parse_from_bytes` and encoded with `to_bytes` (or
//! `write_into` for records embedded in a larger buffer).

pub mod ext;
pub mod mbr;

pub use ext::{
    DirBlock, DirEntry, FileBlock, INODE_KIND_DIR, INODE_KIND_FILE, Inode, JournalEntry,
    PointerBlock, SuperBlock,
};
pub use mbr::{
    Ebr, KIND_EXTENDED, KIND_PRIMARY, MOUNT_NO, MOUNT_YES, Mbr, Partition, SLOT_CLEARED,
    SLOT_UNSET, STATUS_ACTIVE,
};
