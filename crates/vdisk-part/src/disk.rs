//! Disk image lifecycle and MBR access.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use vdisk_block::{ByteDevice, FileByteDevice, corruption_at, read_record};
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::Mbr;
use vdisk_types::{Fit, MBR_SIZE, SizeUnit, unix_timestamp};

/// Parameters of `mkdisk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskOptions {
    pub size: u64,
    pub unit: SizeUnit,
    pub fit: Fit,
}

/// `amount` of `unit` in bytes.
pub fn byte_size(amount: u64, unit: SizeUnit) -> Result<u64> {
    unit.to_bytes(amount)
        .map_err(|_| VdiskError::InvalidArgument(format!("size {amount} overflows")))
}

/// Checked conversion of a byte count into the `i32` fields of the records.
pub(crate) fn record_size(bytes: u64, what: &str) -> Result<i32> {
    i32::try_from(bytes).map_err(|_| {
        VdiskError::InvalidArgument(format!("{what} of {bytes} bytes exceeds the 2 GiB limit"))
    })
}

/// Convert a validated non-negative record offset to a device offset.
pub(crate) fn device_offset(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| VdiskError::Corruption {
        offset: 0,
        detail: format!("negative offset {value} in partition table"),
    })
}

fn disk_signature(path: &Path) -> i32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(&nanos.to_le_bytes());
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) >> 1;
    i32::try_from(raw).unwrap_or_default()
}

/// Create a zero-filled image at `path` and write its MBR.
pub fn create_disk(path: &Path, options: &DiskOptions) -> Result<Mbr> {
    if options.size == 0 {
        return Err(VdiskError::InvalidArgument(
            "disk size must be positive".into(),
        ));
    }
    let bytes = byte_size(options.size, options.unit)?;
    if bytes <= MBR_SIZE as u64 {
        return Err(VdiskError::InvalidArgument(format!(
            "disk of {bytes} bytes cannot hold the {MBR_SIZE}-byte MBR"
        )));
    }
    let size = record_size(bytes, "disk")?;

    let dev = FileByteDevice::create(path, bytes)?;
    let mbr = Mbr::new(size, unix_timestamp(), disk_signature(path), options.fit);
    write_mbr(&dev, &mbr)?;
    dev.sync()?;
    info!(path = %path.display(), size = bytes, fit = %options.fit, "disk created");
    Ok(mbr)
}

/// Delete the image file at `path`.
pub fn remove_disk(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(VdiskError::NotFound(format!("disk image {}", path.display())));
    }
    std::fs::remove_file(path)?;
    info!(path = %path.display(), "disk removed");
    Ok(())
}

pub fn read_mbr(dev: &dyn ByteDevice) -> Result<Mbr> {
    read_record(dev, 0, MBR_SIZE, Mbr::parse_from_bytes)
}

pub fn write_mbr(dev: &dyn ByteDevice, mbr: &Mbr) -> Result<()> {
    let bytes = mbr.to_bytes().map_err(corruption_at(0))?;
    dev.write_all_at(0, &bytes)
}

/// Usable end of the disk: the smaller of the recorded and actual sizes.
pub(crate) fn disk_end(dev: &dyn ByteDevice, mbr: &Mbr) -> i64 {
    let actual = i64::try_from(dev.len_bytes()).unwrap_or(i64::MAX);
    actual.min(i64::from(mbr.size))
}
