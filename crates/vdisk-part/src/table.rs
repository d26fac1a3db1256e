//! Partition Table Manager: create, delete, resize and find partitions.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vdisk_block::ByteDevice;
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::{
    Ebr, KIND_EXTENDED, KIND_PRIMARY, MOUNT_NO, MOUNT_YES, Mbr, Partition, SLOT_CLEARED,
};
use vdisk_types::{EBR_SIZE, Fit, MBR_SIZE, PARTITION_NAME_LEN, ParseError, SizeUnit};

use crate::disk::{byte_size, device_offset, disk_end, read_mbr, record_size, write_mbr};
use crate::ebr::{EbrNode, ebr_chain, write_ebr};

// ── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PartitionKind {
    #[default]
    Primary,
    Extended,
    Logical,
}

impl PartitionKind {
    /// Parse `P`, `E` or `L` (any case).
    pub fn parse(text: &str) -> std::result::Result<Self, ParseError> {
        match text.to_ascii_uppercase().as_str() {
            "P" => Ok(Self::Primary),
            "E" => Ok(Self::Extended),
            "L" => Ok(Self::Logical),
            _ => Err(ParseError::InvalidField {
                field: "type",
                reason: "expected P, E or L",
            }),
        }
    }
}

/// Parameters of `fdisk` partition creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub name: String,
    pub size: u64,
    pub unit: SizeUnit,
    pub kind: PartitionKind,
    pub fit: Fit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeleteMode {
    /// Mark the slot free and leave the data in place.
    #[default]
    Fast,
    /// Zero-fill the partition region as well.
    Full,
}

impl DeleteMode {
    pub fn parse(text: &str) -> std::result::Result<Self, ParseError> {
        match text.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "full" => Ok(Self::Full),
            _ => Err(ParseError::InvalidField {
                field: "delete",
                reason: "expected fast or full",
            }),
        }
    }
}

// ── Lookup results ──────────────────────────────────────────────────────────

/// Where a named partition lives: an MBR slot or an EBR node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionLocation {
    Primary { slot: usize, partition: Partition },
    Logical { header: u64, ebr: Ebr },
}

impl PartitionLocation {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Primary { partition, .. } => &partition.name,
            Self::Logical { ebr, .. } => &ebr.name,
        }
    }

    /// Data start offset.
    #[must_use]
    pub fn start(&self) -> u64 {
        let start = match self {
            Self::Primary { partition, .. } => partition.start,
            Self::Logical { ebr, .. } => ebr.start,
        };
        u64::try_from(start).unwrap_or_default()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        let size = match self {
            Self::Primary { partition, .. } => partition.size,
            Self::Logical { ebr, .. } => ebr.size,
        };
        u64::try_from(size).unwrap_or_default()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        match self {
            Self::Primary { partition, .. } => partition.is_mounted(),
            Self::Logical { ebr, .. } => ebr.is_mounted(),
        }
    }

    #[must_use]
    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Primary { partition, .. } if partition.is_extended())
    }
}

/// MBR plus the decoded logical chain, for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskLayout {
    pub mbr: Mbr,
    pub logical: Vec<EbrNode>,
}

// ── Free space ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gap {
    start: i64,
    len: i64,
}

fn free_gaps(mbr: &Mbr, end: i64) -> Vec<Gap> {
    let mut used: Vec<(i64, i64)> = mbr
        .partitions
        .iter()
        .filter(|part| part.is_used())
        .map(|part| (i64::from(part.start), part.end()))
        .collect();
    used.sort_unstable();

    let mut gaps = Vec::new();
    let mut cursor = i64::try_from(MBR_SIZE).unwrap_or_default();
    for (start, stop) in used {
        if start > cursor {
            gaps.push(Gap {
                start: cursor,
                len: start - cursor,
            });
        }
        cursor = cursor.max(stop);
    }
    if end > cursor {
        gaps.push(Gap {
            start: cursor,
            len: end - cursor,
        });
    }
    gaps
}

fn pick_gap(gaps: &[Gap], needed: i64, fit: Fit) -> Option<Gap> {
    let mut fitting = gaps.iter().copied().filter(|gap| gap.len >= needed);
    match fit {
        Fit::First => fitting.next(),
        Fit::Best => fitting.min_by_key(|gap| (gap.len, gap.start)),
        Fit::Worst => fitting.max_by_key(|gap| (gap.len, -gap.start)),
    }
}

// ── Operations ──────────────────────────────────────────────────────────────

fn validate_partition_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(VdiskError::InvalidArgument(
            "partition name must not be empty".into(),
        ));
    }
    if name.len() > PARTITION_NAME_LEN {
        return Err(VdiskError::InvalidArgument(format!(
            "partition name {name:?} is longer than {PARTITION_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

fn logical_nodes(dev: &dyn ByteDevice, mbr: &Mbr) -> Result<Vec<EbrNode>> {
    match mbr.extended() {
        Some(extended) => ebr_chain(dev, extended),
        None => Ok(Vec::new()),
    }
}

/// Create a primary, extended or logical partition.
pub fn create_partition(
    dev: &dyn ByteDevice,
    request: &PartitionRequest,
) -> Result<PartitionLocation> {
    validate_partition_name(&request.name)?;
    if request.size == 0 {
        return Err(VdiskError::InvalidArgument(
            "partition size must be positive".into(),
        ));
    }
    let bytes = byte_size(request.size, request.unit)?;
    let size = record_size(bytes, "partition")?;

    let mut mbr = read_mbr(dev)?;
    let logical = logical_nodes(dev, &mbr)?;
    let duplicate = mbr.slot_of(&request.name).is_some()
        || logical
            .iter()
            .any(|node| node.ebr.is_used() && node.ebr.name == request.name);
    if duplicate {
        return Err(VdiskError::AlreadyExists(format!(
            "partition {}",
            request.name
        )));
    }

    if request.kind == PartitionKind::Logical {
        return create_logical(dev, &mbr, logical, request, size);
    }

    if request.kind == PartitionKind::Extended && mbr.extended().is_some() {
        return Err(VdiskError::AlreadyExists(
            "disk already has an extended partition".into(),
        ));
    }
    let slot = mbr
        .partitions
        .iter()
        .position(|part| !part.is_used())
        .ok_or_else(|| {
            VdiskError::CapacityExceeded("all four MBR partition slots are in use".into())
        })?;
    let gaps = free_gaps(&mbr, disk_end(dev, &mbr));
    let gap = pick_gap(&gaps, i64::from(size), request.fit).ok_or_else(|| {
        VdiskError::CapacityExceeded(format!("no free region of {bytes} bytes on disk"))
    })?;
    let start = i32::try_from(gap.start).map_err(|_| VdiskError::Corruption {
        offset: 0,
        detail: format!("free region starts beyond the record range at {}", gap.start),
    })?;

    let code = if request.kind == PartitionKind::Extended {
        KIND_EXTENDED
    } else {
        KIND_PRIMARY
    };
    let partition = Partition::new(code, request.fit, start, size, &request.name);
    mbr.partitions[slot] = partition.clone();
    write_mbr(dev, &mbr)?;
    if code == KIND_EXTENDED {
        let head = device_offset(i64::from(start))?;
        write_ebr(dev, head, &Ebr::empty_at(start))?;
    }
    info!(
        name = %request.name,
        kind = ?request.kind,
        start,
        size,
        fit = %request.fit,
        "partition created"
    );
    Ok(PartitionLocation::Primary { slot, partition })
}

fn create_logical(
    dev: &dyn ByteDevice,
    mbr: &Mbr,
    nodes: Vec<EbrNode>,
    request: &PartitionRequest,
    size: i32,
) -> Result<PartitionLocation> {
    let extended = mbr.extended().ok_or_else(|| {
        VdiskError::NotFound("extended partition required for a logical partition".into())
    })?;
    let tail = nodes.into_iter().last().ok_or_else(|| VdiskError::Corruption {
        offset: device_offset(i64::from(extended.start)).unwrap_or_default(),
        detail: "extended partition has no EBR".into(),
    })?;
    if tail.ebr.is_used() {
        return Err(VdiskError::CapacityExceeded(format!(
            "extended partition {} has no room for another EBR",
            extended.name
        )));
    }

    let header = i64::try_from(tail.offset).unwrap_or(i64::MAX);
    let header_len = i64::try_from(EBR_SIZE).unwrap_or(i64::MAX);
    let data_start = header + header_len;
    let data_end = data_start + i64::from(size);
    if data_end > extended.end() {
        return Err(VdiskError::CapacityExceeded(format!(
            "extended partition {} has {} free bytes, {size} requested",
            extended.name,
            (extended.end() - data_start).max(0)
        )));
    }

    let mut ebr = Ebr {
        mount: MOUNT_NO,
        fit: request.fit.code(),
        start: i32::try_from(data_start).unwrap_or(i32::MAX),
        size,
        next: -1,
        name: request.name.clone(),
    };
    if extended.end() - data_end >= header_len {
        let next = i32::try_from(data_end).unwrap_or(i32::MAX);
        write_ebr(dev, device_offset(data_end)?, &Ebr::empty_at(next))?;
        ebr.next = next;
    }
    write_ebr(dev, tail.offset, &ebr)?;
    info!(
        name = %request.name,
        header = tail.offset,
        start = ebr.start,
        size,
        "logical partition created"
    );
    Ok(PartitionLocation::Logical {
        header: tail.offset,
        ebr,
    })
}

/// Delete the partition named `name`.
///
/// A missing name is `NotFound` and leaves the image untouched.
pub fn delete_partition(dev: &dyn ByteDevice, name: &str, mode: DeleteMode) -> Result<()> {
    let mut mbr = read_mbr(dev)?;
    let logical = logical_nodes(dev, &mbr)?;

    if let Some(slot) = mbr.slot_of(name) {
        let part = mbr.partitions[slot].clone();
        if part.is_mounted() {
            return Err(VdiskError::InvalidArgument(format!(
                "partition {name} is mounted"
            )));
        }
        if part.is_extended() && logical.iter().any(|node| node.ebr.is_mounted()) {
            return Err(VdiskError::InvalidArgument(format!(
                "extended partition {name} holds a mounted logical partition"
            )));
        }
        match mode {
            DeleteMode::Full => {
                dev.zero_range(
                    device_offset(i64::from(part.start))?,
                    device_offset(i64::from(part.size))?,
                )?;
                mbr.partitions[slot] = Partition::unset();
            }
            DeleteMode::Fast => {
                let cleared = &mut mbr.partitions[slot];
                cleared.status = SLOT_CLEARED;
                cleared.kind = SLOT_CLEARED;
                cleared.fit = SLOT_CLEARED;
                cleared.start = 0;
                cleared.size = 0;
                cleared.name.clear();
            }
        }
        write_mbr(dev, &mbr)?;
        info!(name, ?mode, "partition deleted");
        return Ok(());
    }

    let node = logical
        .into_iter()
        .find(|node| node.ebr.is_used() && node.ebr.name == name)
        .ok_or_else(|| VdiskError::NotFound(format!("partition {name}")))?;
    if node.ebr.is_mounted() {
        return Err(VdiskError::InvalidArgument(format!(
            "partition {name} is mounted"
        )));
    }
    if mode == DeleteMode::Full {
        dev.zero_range(
            device_offset(i64::from(node.ebr.start))?,
            device_offset(i64::from(node.ebr.size))?,
        )?;
    }
    let mut ebr = node.ebr;
    ebr.name.clear();
    ebr.mount = MOUNT_NO;
    write_ebr(dev, node.offset, &ebr)?;
    info!(name, ?mode, header = node.offset, "logical partition deleted");
    Ok(())
}

/// Grow or shrink `name` by `delta` bytes; returns the new size.
pub fn resize_partition(dev: &dyn ByteDevice, name: &str, delta: i64) -> Result<i64> {
    let mut mbr = read_mbr(dev)?;
    let logical = logical_nodes(dev, &mbr)?;

    if let Some(slot) = mbr.slot_of(name) {
        let part = mbr.partitions[slot].clone();
        let new_size = checked_new_size(name, part.size, delta)?;
        let new_end = i64::from(part.start) + new_size;
        if delta > 0 {
            let limit = mbr
                .partitions
                .iter()
                .filter(|other| other.is_used() && other.start > part.start)
                .map(|other| i64::from(other.start))
                .min()
                .unwrap_or_else(|| disk_end(dev, &mbr));
            if new_end > limit {
                return Err(VdiskError::CapacityExceeded(format!(
                    "partition {name} can grow by at most {} bytes",
                    limit - part.end()
                )));
            }
        }
        if part.is_extended() && delta < 0 {
            let occupied = logical
                .iter()
                .map(|node| {
                    let header_end = i64::try_from(node.offset).unwrap_or(i64::MAX)
                        + i64::try_from(EBR_SIZE).unwrap_or_default();
                    if node.ebr.is_used() {
                        node.ebr.end().max(header_end)
                    } else {
                        header_end
                    }
                })
                .max()
                .unwrap_or_default();
            if new_end < occupied {
                return Err(VdiskError::InvalidArgument(format!(
                    "shrinking {name} would cut into its logical partitions"
                )));
            }
        }
        mbr.partitions[slot].size = record_size(device_offset(new_size)?, "partition")?;
        write_mbr(dev, &mbr)?;
        info!(name, delta, new_size, "partition resized");
        return Ok(new_size);
    }

    let extended_end = mbr.extended().map_or(0, Partition::end);
    let node = logical
        .into_iter()
        .find(|node| node.ebr.is_used() && node.ebr.name == name)
        .ok_or_else(|| VdiskError::NotFound(format!("partition {name}")))?;
    let new_size = checked_new_size(name, node.ebr.size, delta)?;
    if delta > 0 {
        let limit = if node.ebr.next >= 0 {
            i64::from(node.ebr.next)
        } else {
            extended_end
        };
        if i64::from(node.ebr.start) + new_size > limit {
            return Err(VdiskError::CapacityExceeded(format!(
                "partition {name} can grow by at most {} bytes",
                limit - node.ebr.end()
            )));
        }
    }
    let mut ebr = node.ebr;
    ebr.size = record_size(device_offset(new_size)?, "partition")?;
    write_ebr(dev, node.offset, &ebr)?;
    info!(name, delta, new_size, "logical partition resized");
    Ok(new_size)
}

fn checked_new_size(name: &str, current: i32, delta: i64) -> Result<i64> {
    let new_size = i64::from(current)
        .checked_add(delta)
        .ok_or_else(|| VdiskError::InvalidArgument(format!("resize of {name} overflows")))?;
    if new_size <= 0 {
        return Err(VdiskError::InvalidArgument(format!(
            "partition {name} would shrink to {new_size} bytes"
        )));
    }
    Ok(new_size)
}

/// Locate a partition by exact name, primary slots first.
pub fn find_partition(dev: &dyn ByteDevice, name: &str) -> Result<PartitionLocation> {
    let mbr = read_mbr(dev)?;
    if let Some(slot) = mbr.slot_of(name) {
        debug!(name, slot, "partition found in MBR");
        return Ok(PartitionLocation::Primary {
            slot,
            partition: mbr.partitions[slot].clone(),
        });
    }
    logical_nodes(dev, &mbr)?
        .into_iter()
        .find(|node| node.ebr.is_used() && node.ebr.name == name)
        .map(|node| PartitionLocation::Logical {
            header: node.offset,
            ebr: node.ebr,
        })
        .ok_or_else(|| VdiskError::NotFound(format!("partition {name}")))
}

pub fn find_extended(dev: &dyn ByteDevice) -> Result<Option<Partition>> {
    Ok(read_mbr(dev)?.extended().cloned())
}

pub fn disk_layout(dev: &dyn ByteDevice) -> Result<DiskLayout> {
    let mbr = read_mbr(dev)?;
    let logical = logical_nodes(dev, &mbr)?;
    Ok(DiskLayout { mbr, logical })
}

/// Record (or clear, with `None`) the mount state of a partition on disk.
///
/// Primary partitions store the flag, correlative and id in their MBR slot;
/// logical partitions only carry the flag in their EBR.
pub fn set_mount_state(
    dev: &dyn ByteDevice,
    location: &PartitionLocation,
    mounted: Option<(i8, &str)>,
) -> Result<PartitionLocation> {
    match location {
        PartitionLocation::Primary { slot, .. } => {
            let mut mbr = read_mbr(dev)?;
            let part = &mut mbr.partitions[*slot];
            match mounted {
                Some((correlative, id)) => {
                    part.mount = MOUNT_YES;
                    part.correlative = correlative;
                    part.id = id.to_owned();
                }
                None => {
                    part.mount = MOUNT_NO;
                    part.correlative = -1;
                    part.id.clear();
                }
            }
            let partition = part.clone();
            write_mbr(dev, &mbr)?;
            Ok(PartitionLocation::Primary {
                slot: *slot,
                partition,
            })
        }
        PartitionLocation::Logical { header, ebr } => {
            let mut ebr = ebr.clone();
            ebr.mount = if mounted.is_some() { MOUNT_YES } else { MOUNT_NO };
            write_ebr(dev, *header, &ebr)?;
            Ok(PartitionLocation::Logical {
                header: *header,
                ebr,
            })
        }
    }
}
