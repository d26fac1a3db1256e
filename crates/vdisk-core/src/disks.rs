//! Disk image commands: `mkdisk`, `rmdisk` and `fdisk`.

use std::path::Path;
use tracing::info;
use vdisk_block::{ByteDevice, FileByteDevice};
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::Mbr;
use vdisk_part::{
    DeleteMode, DiskInfo, DiskLayout, DiskOptions, DiskRegistry, PartitionLocation,
    PartitionRequest, byte_size, create_disk, create_partition, delete_partition, disk_layout,
    remove_disk, resize_partition,
};
use vdisk_types::SizeUnit;

use crate::mount::MountTable;

/// Create a disk image and record it in `registry`.
pub fn mkdisk(registry: &DiskRegistry, path: &Path, options: &DiskOptions) -> Result<Mbr> {
    if path.exists() {
        return Err(VdiskError::AlreadyExists(format!(
            "disk image {}",
            path.display()
        )));
    }
    let mbr = create_disk(path, options)?;
    let size = u64::try_from(mbr.size).unwrap_or_default();
    registry.register(DiskInfo::new(path, size, mbr.created))?;
    Ok(mbr)
}

/// Delete a disk image. Refused while any of its partitions is mounted.
pub fn rmdisk(registry: &DiskRegistry, mounts: &MountTable, path: &Path) -> Result<()> {
    if mounts.has_disk(path) {
        return Err(VdiskError::InvalidArgument(format!(
            "disk {} has mounted partitions",
            path.display()
        )));
    }
    remove_disk(path)?;
    registry.unregister(path)?;
    Ok(())
}

pub fn fdisk_create(path: &Path, request: &PartitionRequest) -> Result<PartitionLocation> {
    let dev = FileByteDevice::open(path)?;
    let location = create_partition(&dev, request)?;
    dev.sync()?;
    Ok(location)
}

pub fn fdisk_delete(path: &Path, name: &str, mode: DeleteMode) -> Result<()> {
    let dev = FileByteDevice::open(path)?;
    delete_partition(&dev, name, mode)?;
    dev.sync()
}

/// Grow (`amount > 0`) or shrink (`amount < 0`) a partition; returns its
/// new size in bytes.
pub fn fdisk_resize(path: &Path, name: &str, amount: i64, unit: SizeUnit) -> Result<i64> {
    if amount == 0 {
        return Err(VdiskError::InvalidArgument("resize amount must be non-zero".into()));
    }
    let bytes = byte_size(amount.unsigned_abs(), unit)?;
    let magnitude = i64::try_from(bytes)
        .map_err(|_| VdiskError::InvalidArgument(format!("resize of {bytes} bytes overflows")))?;
    let delta = if amount < 0 { -magnitude } else { magnitude };

    let dev = FileByteDevice::open(path)?;
    let size = resize_partition(&dev, name, delta)?;
    dev.sync()?;
    info!(disk = %path.display(), name, delta, size, "partition resized");
    Ok(size)
}

/// MBR and logical chain of the image at `path`.
pub fn disk_report(path: &Path) -> Result<DiskLayout> {
    let dev = FileByteDevice::open(path)?;
    disk_layout(&dev)
}
