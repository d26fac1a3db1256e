//! Mount table.
//!
//! Maps an external mount id to a (disk image, partition) pair. Ids are
//! `{prefix}{n}{letter}`: each disk path gets a letter on its first mount
//! (`A`, `B`, ...) and `n` counts partitions ever mounted from that disk, so
//! ids are never reused while the table lives.
//!
//! Each mounted partition keeps one open image handle behind a
//! `parking_lot::RwLock`. Mutating filesystem operations hold the write lock
//! for their whole duration; reads share the read lock.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use vdisk_block::{ByteDevice, FileByteDevice};
use vdisk_error::{Result, VdiskError};
use vdisk_part::{PartitionLocation, find_partition, set_mount_state};
use vdisk_types::unix_timestamp;

use crate::fs::Filesystem;

/// Mount id generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTableConfig {
    /// Leading digits of every id.
    pub id_prefix: String,
}

impl Default for MountTableConfig {
    fn default() -> Self {
        Self {
            id_prefix: "76".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountId(String);

impl MountId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MountId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Snapshot of a mount's bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    pub id: MountId,
    pub disk_path: PathBuf,
    pub partition: String,
    /// Data start of the partition on the image.
    pub start: u64,
    pub size: u64,
    pub logical: bool,
    pub correlative: u32,
    pub mounted_at: f32,
    pub unmounted_at: f32,
    pub mount_count: u32,
}

/// A partition in the mount table with its open image handle.
#[derive(Debug)]
pub struct MountedPartition {
    info: Mutex<MountInfo>,
    device: RwLock<FileByteDevice>,
}

impl MountedPartition {
    #[must_use]
    pub fn id(&self) -> MountId {
        self.info.lock().id.clone()
    }

    #[must_use]
    pub fn info(&self) -> MountInfo {
        self.info.lock().clone()
    }

    /// Run `f` against the image under the shared lock.
    pub fn with_read<T>(&self, f: impl FnOnce(&dyn ByteDevice) -> Result<T>) -> Result<T> {
        let guard = self.device.read();
        f(&*guard)
    }

    /// Run `f` against the image under the exclusive lock. The image is
    /// synced whether or not `f` succeeds.
    pub fn with_write<T>(&self, f: impl FnOnce(&dyn ByteDevice) -> Result<T>) -> Result<T> {
        let guard = self.device.write();
        let out = f(&*guard);
        let synced = guard.sync();
        let value = out?;
        synced?;
        Ok(value)
    }
}

#[derive(Debug)]
struct DiskSlot {
    path: PathBuf,
    letter: char,
    mounted: u32,
}

#[derive(Debug, Default)]
struct MountState {
    mounts: Vec<Arc<MountedPartition>>,
    disks: Vec<DiskSlot>,
}

/// Registry of mounted partitions.
#[derive(Debug, Default)]
pub struct MountTable {
    config: MountTableConfig,
    state: Mutex<MountState>,
}

fn disk_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl MountTable {
    #[must_use]
    pub fn new(config: MountTableConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MountState::default()),
        }
    }

    /// Mount partition `name` of the image at `disk_path`.
    ///
    /// Mounting an already-mounted partition returns its id and bumps its
    /// mount counter.
    pub fn mount(&self, disk_path: &Path, name: &str) -> Result<MountId> {
        let dev = FileByteDevice::open(disk_path)?;
        let location = find_partition(&dev, name)?;
        if location.is_extended() {
            return Err(VdiskError::InvalidArgument(format!(
                "extended partition {name} cannot be mounted"
            )));
        }
        let key = disk_key(disk_path);
        let now = unix_timestamp();

        let mut state = self.state.lock();
        if let Some(existing) = state.mounts.iter().find(|m| {
            let info = m.info.lock();
            info.disk_path == key && info.partition == name
        }) {
            let mut info = existing.info.lock();
            info.mount_count += 1;
            info.mounted_at = now;
            info!(mount_id = %info.id, count = info.mount_count, "partition remounted");
            return Ok(info.id.clone());
        }

        let slot_index = match state.disks.iter().position(|d| d.path == key) {
            Some(index) => index,
            None => {
                let letter = u8::try_from(state.disks.len())
                    .ok()
                    .and_then(|n| b'A'.checked_add(n))
                    .filter(u8::is_ascii_uppercase)
                    .map(char::from)
                    .ok_or_else(|| {
                        VdiskError::CapacityExceeded("no disk letters left".into())
                    })?;
                state.disks.push(DiskSlot {
                    path: key.clone(),
                    letter,
                    mounted: 0,
                });
                state.disks.len() - 1
            }
        };
        let disk = &mut state.disks[slot_index];
        disk.mounted += 1;
        let correlative = disk.mounted;
        let id = MountId(format!(
            "{}{}{}",
            self.config.id_prefix, correlative, disk.letter
        ));

        let on_disk = i8::try_from(correlative).unwrap_or(i8::MAX);
        let location = set_mount_state(&dev, &location, Some((on_disk, id.as_str())))?;
        dev.sync()?;

        let info = MountInfo {
            id: id.clone(),
            disk_path: key,
            partition: name.to_owned(),
            start: location.start(),
            size: location.size(),
            logical: matches!(location, PartitionLocation::Logical { .. }),
            correlative,
            mounted_at: now,
            unmounted_at: 0.0,
            mount_count: 1,
        };
        state.mounts.push(Arc::new(MountedPartition {
            info: Mutex::new(info),
            device: RwLock::new(dev),
        }));
        info!(mount_id = %id, disk = %disk_path.display(), partition = name, "partition mounted");
        Ok(id)
    }

    /// Remove `id` from the table and clear the on-disk mount flag.
    pub fn unmount(&self, id: &MountId) -> Result<MountInfo> {
        let mut state = self.state.lock();
        let index = state
            .mounts
            .iter()
            .position(|m| m.info.lock().id == *id)
            .ok_or_else(|| VdiskError::NotFound(format!("mount id {id}")))?;
        let mut info = state.mounts[index].info();
        state.mounts[index].with_write(|dev| {
            let location = find_partition(dev, &info.partition)?;
            set_mount_state(dev, &location, None)?;
            Ok(())
        })?;
        state.mounts.remove(index);
        info.unmounted_at = unix_timestamp();
        info!(mount_id = %id, "partition unmounted");
        Ok(info)
    }

    pub fn get(&self, id: &MountId) -> Result<Arc<MountedPartition>> {
        self.state
            .lock()
            .mounts
            .iter()
            .find(|m| m.info.lock().id == *id)
            .cloned()
            .ok_or_else(|| VdiskError::NotFound(format!("mount id {id}")))
    }

    /// Filesystem handle over a mounted partition.
    pub fn filesystem(&self, id: &MountId) -> Result<Filesystem> {
        Ok(Filesystem::new(self.get(id)?))
    }

    #[must_use]
    pub fn list(&self) -> Vec<MountInfo> {
        self.state.lock().mounts.iter().map(|m| m.info()).collect()
    }

    /// Whether any partition of the image at `disk_path` is mounted.
    #[must_use]
    pub fn has_disk(&self, disk_path: &Path) -> bool {
        let key = disk_key(disk_path);
        self.state
            .lock()
            .mounts
            .iter()
            .any(|m| m.info.lock().disk_path == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdisk_part::{
        DiskOptions, PartitionKind, PartitionRequest, create_disk, create_partition, read_mbr,
    };
    use vdisk_types::{Fit, SizeUnit};

    fn disk_with(dir: &Path, file: &str, parts: &[(&str, PartitionKind)]) -> PathBuf {
        let path = dir.join(file);
        create_disk(
            &path,
            &DiskOptions {
                size: 64,
                unit: SizeUnit::Kilobytes,
                fit: Fit::First,
            },
        )
        .unwrap();
        let dev = FileByteDevice::open(&path).unwrap();
        for (name, kind) in parts {
            create_partition(
                &dev,
                &PartitionRequest {
                    name: (*name).to_owned(),
                    size: 8,
                    unit: SizeUnit::Kilobytes,
                    kind: *kind,
                    fit: Fit::First,
                },
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn ids_follow_disk_letters_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let a = disk_with(
            dir.path(),
            "a.dsk",
            &[("P1", PartitionKind::Primary), ("P2", PartitionKind::Primary)],
        );
        let b = disk_with(dir.path(), "b.dsk", &[("Q1", PartitionKind::Primary)]);
        let table = MountTable::default();

        assert_eq!(table.mount(&a, "P1").unwrap().as_str(), "761A");
        assert_eq!(table.mount(&b, "Q1").unwrap().as_str(), "761B");
        assert_eq!(table.mount(&a, "P2").unwrap().as_str(), "762A");
        assert_eq!(table.list().len(), 3);

        let dev = FileByteDevice::open(&a).unwrap();
        let slot = &read_mbr(&dev).unwrap().partitions[1];
        assert!(slot.is_mounted());
        assert_eq!((slot.correlative, slot.id.as_str()), (2, "762A"));
    }

    #[test]
    fn remount_returns_same_id_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let a = disk_with(dir.path(), "a.dsk", &[("P1", PartitionKind::Primary)]);
        let table = MountTable::new(MountTableConfig {
            id_prefix: "11".into(),
        });
        let first = table.mount(&a, "P1").unwrap();
        let second = table.mount(&a, "P1").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str(), "111A");
        assert_eq!(table.get(&first).unwrap().info().mount_count, 2);
    }

    #[test]
    fn unmount_clears_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let a = disk_with(dir.path(), "a.dsk", &[("P1", PartitionKind::Primary)]);
        let table = MountTable::default();
        let id = table.mount(&a, "P1").unwrap();
        assert!(table.has_disk(&a));

        let info = table.unmount(&id).unwrap();
        assert_eq!(info.partition, "P1");
        assert!(table.list().is_empty());
        assert!(matches!(table.get(&id), Err(VdiskError::NotFound(_))));
        assert!(matches!(table.unmount(&id), Err(VdiskError::NotFound(_))));

        let dev = FileByteDevice::open(&a).unwrap();
        assert!(!read_mbr(&dev).unwrap().partitions[0].is_mounted());
        // Counters keep going: the next mount gets a fresh id.
        assert_eq!(table.mount(&a, "P1").unwrap().as_str(), "762A");
    }

    #[test]
    fn missing_and_extended_partitions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = disk_with(dir.path(), "a.dsk", &[("EXT", PartitionKind::Extended)]);
        let table = MountTable::default();
        assert!(matches!(
            table.mount(&a, "nope"),
            Err(VdiskError::NotFound(_))
        ));
        assert!(matches!(
            table.mount(&a, "EXT"),
            Err(VdiskError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.mount(&dir.path().join("missing.dsk"), "P1"),
            Err(VdiskError::NotFound(_))
        ));
    }
}
