#![forbid(unsafe_code)]
//! Disk images and their partition tables.
//!
//! `mkdisk`/`rmdisk`, the MBR with its four slots, the EBR chain inside the
//! extended partition, fit-policy placement, and the registry of known disks.
//! Every function takes the image as a `&dyn ByteDevice` so tests can run on
//! an in-memory device.

pub mod disk;
pub mod ebr;
pub mod registry;
pub mod table;

pub use disk::{DiskOptions, byte_size, create_disk, read_mbr, remove_disk, write_mbr};
pub use ebr::{EbrNode, ebr_chain, read_ebr, write_ebr};
pub use registry::{DiskInfo, DiskRegistry};
pub use table::{
    DeleteMode, DiskLayout, PartitionKind, PartitionLocation, PartitionRequest, create_partition,
    delete_partition, disk_layout, find_extended, find_partition, resize_partition,
    set_mount_state,
};
