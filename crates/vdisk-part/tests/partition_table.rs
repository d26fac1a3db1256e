#![forbid(unsafe_code)]

use std::path::Path;
use vdisk_block::{ByteDevice, FileByteDevice, read_vec};
use vdisk_error::VdiskError;
use vdisk_part::{
    DeleteMode, DiskOptions, PartitionKind, PartitionLocation, PartitionRequest, create_disk,
    create_partition, delete_partition, disk_layout, find_extended, find_partition, read_mbr,
    resize_partition, set_mount_state,
};
use vdisk_types::{EBR_SIZE, Fit, MBR_SIZE, SizeUnit};

fn new_disk(dir: &Path, kib: u64) -> FileByteDevice {
    let path = dir.join("disk.dsk");
    create_disk(
        &path,
        &DiskOptions {
            size: kib,
            unit: SizeUnit::Kilobytes,
            fit: Fit::First,
        },
    )
    .expect("mkdisk");
    FileByteDevice::open(&path).expect("open")
}

fn request(name: &str, kib: u64, kind: PartitionKind, fit: Fit) -> PartitionRequest {
    PartitionRequest {
        name: name.to_owned(),
        size: kib,
        unit: SizeUnit::Kilobytes,
        kind,
        fit,
    }
}

fn snapshot(dev: &FileByteDevice) -> Vec<u8> {
    let len = usize::try_from(dev.len_bytes()).expect("len");
    read_vec(dev, 0, len).expect("snapshot")
}

#[test]
fn primaries_are_placed_after_the_mbr() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 64);

    let p1 = create_partition(&dev, &request("P1", 8, PartitionKind::Primary, Fit::First))
        .expect("P1");
    let p2 = create_partition(&dev, &request("P2", 8, PartitionKind::Primary, Fit::First))
        .expect("P2");
    assert_eq!(p1.start(), MBR_SIZE as u64);
    assert_eq!(p2.start(), MBR_SIZE as u64 + 8 * 1024);

    let mbr = read_mbr(&dev).expect("mbr");
    assert_eq!(mbr.partitions[0].name, "P1");
    assert_eq!(mbr.partitions[1].name, "P2");
    assert!(!mbr.partitions[2].is_used());
}

#[test]
fn duplicate_names_and_slot_limits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 64);
    for name in ["A", "B", "C", "D"] {
        create_partition(&dev, &request(name, 4, PartitionKind::Primary, Fit::First))
            .expect(name);
    }
    let dup = create_partition(&dev, &request("A", 1, PartitionKind::Primary, Fit::First));
    assert!(matches!(dup, Err(VdiskError::AlreadyExists(_))));
    let fifth = create_partition(&dev, &request("E", 1, PartitionKind::Primary, Fit::First));
    assert!(matches!(fifth, Err(VdiskError::CapacityExceeded(_))));
}

#[test]
fn best_and_worst_fit_pick_gaps_by_size() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 64);
    // Layout: [A 4K][B 8K][C 4K][D 16K][free tail]
    for (name, kib) in [("A", 4), ("B", 8), ("C", 4), ("D", 16)] {
        create_partition(&dev, &request(name, kib, PartitionKind::Primary, Fit::First))
            .expect(name);
    }
    delete_partition(&dev, "A", DeleteMode::Full).expect("delete A");
    delete_partition(&dev, "C", DeleteMode::Full).expect("delete C");
    // Gaps now: 4K at 153, 4K after B, and the tail.

    let worst = create_partition(&dev, &request("W", 2, PartitionKind::Primary, Fit::Worst))
        .expect("worst");
    let d_end = find_partition(&dev, "D").expect("D");
    assert_eq!(worst.start(), d_end.start() + d_end.size());

    let best = create_partition(&dev, &request("X", 3, PartitionKind::Primary, Fit::Best))
        .expect("best");
    assert_eq!(best.start(), MBR_SIZE as u64);
}

#[test]
fn logical_partitions_chain_through_ebrs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 64);

    let missing = create_partition(&dev, &request("L0", 1, PartitionKind::Logical, Fit::First));
    assert!(matches!(missing, Err(VdiskError::NotFound(_))));

    create_partition(&dev, &request("EXT", 16, PartitionKind::Extended, Fit::First))
        .expect("extended");
    let second = create_partition(&dev, &request("EXT2", 4, PartitionKind::Extended, Fit::First));
    assert!(matches!(second, Err(VdiskError::AlreadyExists(_))));

    let l1 = create_partition(&dev, &request("L1", 2, PartitionKind::Logical, Fit::First))
        .expect("L1");
    let l2 = create_partition(&dev, &request("L2", 2, PartitionKind::Logical, Fit::First))
        .expect("L2");
    let ext = find_extended(&dev).expect("read").expect("extended");
    let ext_start = u64::try_from(ext.start).expect("start");
    assert_eq!(l1.start(), ext_start + EBR_SIZE as u64);
    assert_eq!(l2.start(), l1.start() + 2048 + EBR_SIZE as u64);

    let layout = disk_layout(&dev).expect("layout");
    let names: Vec<&str> = layout.logical.iter().map(|n| n.ebr.name.as_str()).collect();
    assert_eq!(names, vec!["L1", "L2", ""]);
    assert_eq!(layout.logical[0].ebr.next, i32::try_from(layout.logical[1].offset).expect("o"));

    let dup = create_partition(&dev, &request("L1", 1, PartitionKind::Logical, Fit::First));
    assert!(matches!(dup, Err(VdiskError::AlreadyExists(_))));
    let too_big = create_partition(&dev, &request("L3", 32, PartitionKind::Logical, Fit::First));
    assert!(matches!(too_big, Err(VdiskError::CapacityExceeded(_))));

    assert!(matches!(
        find_partition(&dev, "L2").expect("find"),
        PartitionLocation::Logical { .. }
    ));
    delete_partition(&dev, "L1", DeleteMode::Fast).expect("delete L1");
    assert!(matches!(
        find_partition(&dev, "L1"),
        Err(VdiskError::NotFound(_))
    ));
    // The chain keeps its shape after a logical delete.
    assert_eq!(disk_layout(&dev).expect("layout").logical.len(), 3);
}

#[test]
fn deleting_a_missing_partition_leaves_the_image_unchanged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 32);
    create_partition(&dev, &request("P1", 4, PartitionKind::Primary, Fit::First)).expect("P1");
    let before = snapshot(&dev);
    let err = delete_partition(&dev, "nope", DeleteMode::Full).unwrap_err();
    assert!(matches!(err, VdiskError::NotFound(_)));
    assert_eq!(snapshot(&dev), before);
}

#[test]
fn full_delete_zeroes_data_and_resets_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 32);
    let p1 = create_partition(&dev, &request("P1", 4, PartitionKind::Primary, Fit::First))
        .expect("P1");
    dev.write_all_at(p1.start() + 10, b"payload").expect("write");

    delete_partition(&dev, "P1", DeleteMode::Full).expect("delete");
    let data = read_vec(&dev, p1.start(), 4096).expect("data");
    assert!(data.iter().all(|b| *b == 0));
    let slot = &read_mbr(&dev).expect("mbr").partitions[0];
    assert_eq!(slot.status, b'N');
    assert_eq!(slot.start, -1);
}

#[test]
fn fast_delete_keeps_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 32);
    let p1 = create_partition(&dev, &request("P1", 4, PartitionKind::Primary, Fit::First))
        .expect("P1");
    dev.write_all_at(p1.start(), b"keep").expect("write");
    delete_partition(&dev, "P1", DeleteMode::Fast).expect("delete");
    assert_eq!(read_vec(&dev, p1.start(), 4).expect("data"), b"keep");
    let slot = &read_mbr(&dev).expect("mbr").partitions[0];
    assert_eq!((slot.status, slot.size, slot.name.as_str()), (b'0', 0, ""));
}

#[test]
fn resize_respects_neighbours() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 32);
    create_partition(&dev, &request("P1", 4, PartitionKind::Primary, Fit::First)).expect("P1");
    create_partition(&dev, &request("P2", 4, PartitionKind::Primary, Fit::First)).expect("P2");

    let grow = resize_partition(&dev, "P1", 1);
    assert!(matches!(grow, Err(VdiskError::CapacityExceeded(_))));
    assert_eq!(resize_partition(&dev, "P1", -1024).expect("shrink"), 3072);
    assert_eq!(resize_partition(&dev, "P1", 1024).expect("regrow"), 4096);
    let negative = resize_partition(&dev, "P1", -4096);
    assert!(matches!(negative, Err(VdiskError::InvalidArgument(_))));
    assert_eq!(resize_partition(&dev, "P2", 8192).expect("tail growth"), 12288);
    assert!(matches!(
        resize_partition(&dev, "P9", 1),
        Err(VdiskError::NotFound(_))
    ));
}

#[test]
fn mounted_partitions_cannot_be_deleted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dev = new_disk(dir.path(), 32);
    let p1 = create_partition(&dev, &request("P1", 4, PartitionKind::Primary, Fit::First))
        .expect("P1");
    let mounted = set_mount_state(&dev, &p1, Some((1, "761A"))).expect("mount");
    assert!(mounted.is_mounted());
    let slot = &read_mbr(&dev).expect("mbr").partitions[0];
    assert_eq!((slot.correlative, slot.id.as_str()), (1, "761A"));

    let err = delete_partition(&dev, "P1", DeleteMode::Fast).unwrap_err();
    assert!(matches!(err, VdiskError::InvalidArgument(_)));

    set_mount_state(&dev, &mounted, None).expect("unmount");
    delete_partition(&dev, "P1", DeleteMode::Fast).expect("delete");
}
