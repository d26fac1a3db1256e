#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
//! E2E tests for directory and file operations on a mounted image.
//!
//! Scenarios tested:
//! 1. Fresh format: bootstrap objects, counters and bitmaps agree.
//! 2. Create/delete keeps `used + free` at capacity for inodes and blocks.
//! 3. Removing a missing path is `NotFound` and leaves the image untouched.
//! 4. `mkdir -p` creates every ancestor.
//! 5. A file one byte past the direct pointers takes a pointer block.
//! 6. UGO checks for owner, group and other.
//! 7. Users and groups through `users.txt`.
//! 8. Copy merges into existing directories; move relocates a subtree.
//! 9. Recursive chmod and chown.
//! 10. Listing, tree and find.
//! 11. Sessions are bound to one mount.
//! 12. A directory entry pointing back at an ancestor does not trap walks.
//! 13. A `mkdir -p` that runs out of inodes leaves counters matching the
//!     bitmaps.

use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tempfile::TempDir;
use vdisk_core::{
    DiskOptions, DiskRegistry, FileContent, FileType, Filesystem, FormatOptions, MountTable,
    PartitionKind, PartitionRequest, Session, VdiskError, fdisk_create, mkdisk,
};
use vdisk_types::{
    BLOCK_SIZE, DIR_NAME_LEN, DIRECT_POINTERS, Fit, InodeNumber, NO_POINTER, SizeUnit,
};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    _dir: TempDir,
    disk: PathBuf,
    mounts: MountTable,
    fs: Filesystem,
    root: Session,
}

fn partition(name: &str) -> PartitionRequest {
    PartitionRequest {
        name: name.to_owned(),
        size: 1,
        unit: SizeUnit::Megabytes,
        kind: PartitionKind::Primary,
        fit: Fit::First,
    }
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let disk = dir.path().join("disk.dsk");
    let registry = DiskRegistry::in_memory();
    mkdisk(
        &registry,
        &disk,
        &DiskOptions {
            size: 3,
            unit: SizeUnit::Megabytes,
            fit: Fit::First,
        },
    )
    .unwrap();
    fdisk_create(&disk, &partition("P1")).unwrap();

    let mounts = MountTable::default();
    let id = mounts.mount(&disk, "P1").unwrap();
    let fs = mounts.filesystem(&id).unwrap();
    fs.format(FormatOptions { journaled: true }).unwrap();
    let root = fs.login("root", "123").unwrap();
    Fixture {
        _dir: dir,
        disk,
        mounts,
        fs,
        root,
    }
}

/// Counters against capacity and against the bitmaps.
fn assert_accounting(fs: &Filesystem) {
    let sb = fs.superblock().unwrap();
    let inodes = sb.inodes_count + sb.free_inodes_count;
    let blocks = sb.blocks_count + sb.free_blocks_count;
    assert_eq!(blocks, 3 * inodes);

    let inode_bitmap = fs.inode_bitmap().unwrap();
    let block_bitmap = fs.block_bitmap().unwrap();
    assert_eq!(inode_bitmap.len(), inodes as usize);
    assert_eq!(block_bitmap.len(), blocks as usize);
    let used_inodes = inode_bitmap.iter().filter(|b| **b == b'1').count();
    let used_blocks = block_bitmap.iter().filter(|b| **b == b'X').count();
    assert_eq!(used_inodes, sb.inodes_count as usize);
    assert_eq!(used_blocks, sb.blocks_count as usize);
}

fn add_user(fx: &Fixture, user: &str, group: &str) -> Session {
    let users = fx.fs.users().unwrap();
    if users.group_id(group).is_none() {
        fx.fs.mkgrp(&fx.root, group).unwrap();
    }
    fx.fs.mkusr(&fx.root, user, "pw", group).unwrap();
    fx.fs.login(user, "pw").unwrap()
}

// ---------------------------------------------------------------------------
// Scenario 1: Fresh format
// ---------------------------------------------------------------------------

#[test]
fn fresh_format_has_root_and_users_file() {
    let fx = fixture();
    let sb = fx.fs.superblock().unwrap();
    assert_eq!(sb.fs_type, 3);
    assert_eq!(sb.inodes_count, 2);
    assert_eq!(sb.blocks_count, 2);

    let root = fx.fs.inode(InodeNumber::ROOT).unwrap();
    assert!(root.is_dir());
    assert_eq!(root.perm.to_string(), "777");
    assert_eq!((root.uid, root.gid), (1, 1));

    let entries = fx.fs.ls(&fx.root, "/").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "users.txt");
    assert_eq!(entries[0].inode, InodeNumber::USERS);
    assert_eq!(entries[0].file_type, FileType::File);
    assert_eq!(
        fx.fs.cat(&fx.root, "/users.txt").unwrap(),
        b"1,G,root\n1,U,root,root,123\n"
    );
    assert_accounting(&fx.fs);
}

// ---------------------------------------------------------------------------
// Scenario 2: Accounting across create/delete
// ---------------------------------------------------------------------------

#[test]
fn create_and_delete_keep_counters_at_capacity() {
    let fx = fixture();
    let before = fx.fs.superblock().unwrap();

    fx.fs.mkdir(&fx.root, "/work", false).unwrap();
    for i in 0..6 {
        let path = format!("/work/f{i}.txt");
        fx.fs
            .mkfile(&fx.root, &path, FileContent::Zeroed(100 * i), false)
            .unwrap();
    }
    fx.fs.mkdir(&fx.root, "/work/deep/er", true).unwrap();
    assert_accounting(&fx.fs);
    let during = fx.fs.superblock().unwrap();
    assert!(during.inodes_count > before.inodes_count);

    fx.fs.remove(&fx.root, "/work").unwrap();
    assert_accounting(&fx.fs);
    let after = fx.fs.superblock().unwrap();
    assert_eq!(after.inodes_count, before.inodes_count);
    assert_eq!(after.blocks_count, before.blocks_count);
    assert!(!fx.fs.exists("/work").unwrap());
}

#[test]
fn directory_grows_past_one_block() {
    let fx = fixture();
    fx.fs.mkdir(&fx.root, "/many", false).unwrap();
    for i in 0..9 {
        fx.fs
            .mkfile(&fx.root, &format!("/many/n{i}"), FileContent::from("x"), false)
            .unwrap();
    }
    let names: Vec<String> = fx
        .fs
        .ls(&fx.root, "/many")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names.len(), 9);
    assert!(names.contains(&"n8".to_owned()));
    assert_accounting(&fx.fs);
}

// ---------------------------------------------------------------------------
// Scenario 3: Removing a missing path
// ---------------------------------------------------------------------------

#[test]
fn removing_missing_path_leaves_image_identical() {
    let fx = fixture();
    fx.fs
        .mkfile(&fx.root, "/keep.txt", FileContent::from("keep"), false)
        .unwrap();
    let before = std::fs::read(&fx.disk).unwrap();

    let err = fx.fs.remove(&fx.root, "/nope.txt").unwrap_err();
    assert!(matches!(err, VdiskError::NotFound(_)));
    let err = fx.fs.remove(&fx.root, "/nodir/nope.txt").unwrap_err();
    assert!(matches!(err, VdiskError::NotFound(_)));

    assert_eq!(std::fs::read(&fx.disk).unwrap(), before);
}

#[test]
fn bootstrap_objects_cannot_be_removed() {
    let fx = fixture();
    assert!(matches!(
        fx.fs.remove(&fx.root, "/users.txt"),
        Err(VdiskError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.fs.rename(&fx.root, "/users.txt", "u.txt"),
        Err(VdiskError::InvalidArgument(_))
    ));
    assert!(fx.fs.exists("/users.txt").unwrap());
}

// ---------------------------------------------------------------------------
// Scenario 4: mkdir -p
// ---------------------------------------------------------------------------

#[test]
fn mkdir_with_parents_creates_ancestors() {
    let fx = fixture();
    fx.fs.mkdir(&fx.root, "/a/b/c", true).unwrap();
    assert!(fx.fs.exists("/a/b/c").unwrap());
    assert!(fx.fs.exists("/a/b").unwrap());
    assert!(fx.fs.exists("/A/B").unwrap());

    assert!(matches!(
        fx.fs.mkdir(&fx.root, "/x/y", false),
        Err(VdiskError::NotFound(_))
    ));
    assert!(matches!(
        fx.fs.mkdir(&fx.root, "/a", false),
        Err(VdiskError::AlreadyExists(_))
    ));
    assert!(matches!(
        fx.fs.mkdir(&fx.root, "/abcdefghijklm", false),
        Err(VdiskError::InvalidArgument(_))
    ));
    assert!(!fx.fs.exists("/x").unwrap());
}

#[test]
fn mkfile_under_a_file_is_rejected() {
    let fx = fixture();
    fx.fs
        .mkfile(&fx.root, "/plain", FileContent::from("p"), false)
        .unwrap();
    assert!(matches!(
        fx.fs
            .mkfile(&fx.root, "/plain/child", FileContent::from("c"), true),
        Err(VdiskError::InvalidArgument(_))
    ));
}

// ---------------------------------------------------------------------------
// Scenario 5: Indirection boundary
// ---------------------------------------------------------------------------

#[test]
fn file_past_direct_pointers_uses_single_indirect() {
    let fx = fixture();
    let len = DIRECT_POINTERS * BLOCK_SIZE + 1;
    let mut content: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
    content[len - 1] = b'Z';

    let before = fx.fs.superblock().unwrap().blocks_count;
    let ino = fx
        .fs
        .mkfile(&fx.root, "/big.bin", FileContent::Bytes(content.clone()), false)
        .unwrap();
    let after = fx.fs.superblock().unwrap().blocks_count;
    // 13 data blocks and one pointer block.
    assert_eq!(after - before, 14);

    let inode = fx.fs.inode(ino).unwrap();
    assert_eq!(inode.size as usize, len);
    assert_ne!(inode.block[DIRECT_POINTERS], NO_POINTER);
    assert_eq!(inode.block[DIRECT_POINTERS + 1], NO_POINTER);

    let read = fx.fs.cat(&fx.root, "/big.bin").unwrap();
    assert_eq!(read, content);
    assert_eq!(read[len - 1], b'Z');

    fx.fs.remove(&fx.root, "/big.bin").unwrap();
    assert_eq!(fx.fs.superblock().unwrap().blocks_count, before);
    assert_accounting(&fx.fs);
}

#[test]
fn edit_rewrites_in_place_but_never_grows() {
    let fx = fixture();
    fx.fs
        .mkfile(&fx.root, "/note.txt", FileContent::from("hello"), false)
        .unwrap();
    let blocks = fx.fs.superblock().unwrap().blocks_count;

    fx.fs.edit(&fx.root, "/note.txt", b"bye").unwrap();
    assert_eq!(fx.fs.cat(&fx.root, "/note.txt").unwrap(), b"bye");

    let too_long = vec![b'x'; BLOCK_SIZE + 1];
    assert!(matches!(
        fx.fs.edit(&fx.root, "/note.txt", &too_long),
        Err(VdiskError::InvalidArgument(_))
    ));
    assert_eq!(fx.fs.cat(&fx.root, "/note.txt").unwrap(), b"bye");
    assert_eq!(fx.fs.superblock().unwrap().blocks_count, blocks);
}

// ---------------------------------------------------------------------------
// Scenario 6: UGO checks
// ---------------------------------------------------------------------------

#[test]
fn owner_writes_other_only_reads() {
    let fx = fixture();
    let ana = add_user(&fx, "ana", "staff");
    fx.fs
        .mkfile(&fx.root, "/root.txt", FileContent::from("root data"), false)
        .unwrap();

    // 664: other gets read only.
    assert_eq!(fx.fs.cat(&ana, "/root.txt").unwrap(), b"root data");
    assert!(matches!(
        fx.fs.edit(&ana, "/root.txt", b"mine"),
        Err(VdiskError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.fs.remove(&ana, "/root.txt"),
        Err(VdiskError::PermissionDenied(_))
    ));

    // The root directory is 777, so ana can create there and owns the result.
    let ino = fx
        .fs
        .mkfile(&ana, "/ana.txt", FileContent::from("ana data"), false)
        .unwrap();
    let inode = fx.fs.inode(ino).unwrap();
    assert_eq!((inode.uid, inode.gid), (ana.uid, ana.gid));
    fx.fs.edit(&ana, "/ana.txt", b"ana edit").unwrap();

    // A 664 directory owned by root is closed to other writers.
    fx.fs.mkdir(&fx.root, "/shared", false).unwrap();
    assert!(matches!(
        fx.fs.mkfile(&ana, "/shared/x", FileContent::from("x"), false),
        Err(VdiskError::PermissionDenied(_))
    ));
}

#[test]
fn group_digit_applies_to_group_members() {
    let fx = fixture();
    let ana = add_user(&fx, "ana", "staff");
    let bob = add_user(&fx, "bob", "staff");
    let eve = add_user(&fx, "eve", "guests");
    fx.fs
        .mkfile(&ana, "/team.txt", FileContent::from("plan"), false)
        .unwrap();
    fx.fs.chmod(&fx.root, "/team.txt", "660", false).unwrap();

    fx.fs.edit(&bob, "/team.txt", b"PLAN").unwrap();
    assert!(matches!(
        fx.fs.cat(&eve, "/team.txt"),
        Err(VdiskError::PermissionDenied(_))
    ));
    // No bypass for the root user: root is "other" here.
    assert!(matches!(
        fx.fs.cat(&fx.root, "/team.txt"),
        Err(VdiskError::PermissionDenied(_))
    ));
}

// ---------------------------------------------------------------------------
// Scenario 7: Users and groups
// ---------------------------------------------------------------------------

#[test]
fn users_and_groups_round_trip_through_users_file() {
    let fx = fixture();
    let gid = fx.fs.mkgrp(&fx.root, "staff").unwrap();
    let uid = fx.fs.mkusr(&fx.root, "ana", "secret", "staff").unwrap();
    assert!(gid > 1 && uid > 1);

    let ana = fx.fs.login("ana", "secret").unwrap();
    assert_eq!((ana.uid, ana.gid), (uid, gid));
    assert!(!ana.is_root_group());
    assert!(matches!(
        fx.fs.login("ana", "wrong"),
        Err(VdiskError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.fs.login("nobody", "x"),
        Err(VdiskError::NotFound(_))
    ));
    assert!(matches!(
        fx.fs.mkgrp(&ana, "other"),
        Err(VdiskError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.fs.mkgrp(&fx.root, "staff"),
        Err(VdiskError::AlreadyExists(_))
    ));
    assert!(matches!(
        fx.fs.mkusr(&fx.root, "averyverylongname", "x", "staff"),
        Err(VdiskError::InvalidArgument(_))
    ));

    fx.fs.mkgrp(&fx.root, "admins").unwrap();
    fx.fs.chgrp(&fx.root, "ana", "admins").unwrap();
    assert_eq!(fx.fs.login("ana", "secret").unwrap().group, "admins");

    fx.fs.rmusr(&fx.root, "ana").unwrap();
    assert!(matches!(
        fx.fs.login("ana", "secret"),
        Err(VdiskError::NotFound(_))
    ));
    fx.fs.rmgrp(&fx.root, "staff").unwrap();
    assert!(fx.fs.users().unwrap().group_id("staff").is_none());

    let text = String::from_utf8(fx.fs.cat(&fx.root, "/users.txt").unwrap()).unwrap();
    assert!(text.starts_with("1,G,root\n1,U,root,root,123\n"));
    assert!(text.contains("0,U,"));
    assert_accounting(&fx.fs);
}

#[test]
fn users_file_updates_are_not_journaled() {
    let fx = fixture();
    let entries = fx.fs.journaling().unwrap().len();
    fx.fs.mkgrp(&fx.root, "staff").unwrap();
    fx.fs.mkusr(&fx.root, "ana", "pw", "staff").unwrap();
    assert_eq!(fx.fs.journaling().unwrap().len(), entries);
}

// ---------------------------------------------------------------------------
// Scenario 8: Copy and move
// ---------------------------------------------------------------------------

#[test]
fn copy_merges_and_reports_skips() {
    let fx = fixture();
    fx.fs
        .mkfile(&fx.root, "/src/a.txt", FileContent::from("A"), true)
        .unwrap();
    fx.fs
        .mkfile(&fx.root, "/src/sub/b.txt", FileContent::from("B"), true)
        .unwrap();
    fx.fs
        .mkfile(&fx.root, "/dst/src/a.txt", FileContent::from("old"), true)
        .unwrap();

    let report = fx.fs.copy(&fx.root, "/src", "/dst").unwrap();
    assert_eq!(report.skipped, vec!["/src/a.txt".to_owned()]);
    assert_eq!(
        report.copied,
        vec!["/dst/src/sub".to_owned(), "/dst/src/sub/b.txt".to_owned()]
    );
    assert_eq!(fx.fs.cat(&fx.root, "/dst/src/a.txt").unwrap(), b"old");
    assert_eq!(fx.fs.cat(&fx.root, "/dst/src/sub/b.txt").unwrap(), b"B");
    assert_eq!(fx.fs.cat(&fx.root, "/src/sub/b.txt").unwrap(), b"B");

    assert!(matches!(
        fx.fs.copy(&fx.root, "/src", "/src/sub"),
        Err(VdiskError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.fs.copy(&fx.root, "/src", "/dst/src/a.txt"),
        Err(VdiskError::InvalidArgument(_))
    ));
    assert_accounting(&fx.fs);
}

#[test]
fn copy_skips_unreadable_entries() {
    let fx = fixture();
    let ana = add_user(&fx, "ana", "staff");
    fx.fs
        .mkfile(&fx.root, "/pub/open.txt", FileContent::from("o"), true)
        .unwrap();
    fx.fs
        .mkfile(&fx.root, "/pub/closed.txt", FileContent::from("c"), false)
        .unwrap();
    fx.fs.chmod(&fx.root, "/pub/closed.txt", "600", false).unwrap();
    fx.fs.mkdir(&ana, "/mine", false).unwrap();

    let report = fx.fs.copy(&ana, "/pub", "/mine").unwrap();
    assert_eq!(report.skipped, vec!["/pub/closed.txt".to_owned()]);
    assert!(fx.fs.exists("/mine/pub/open.txt").unwrap());
    assert!(!fx.fs.exists("/mine/pub/closed.txt").unwrap());
    let copy = fx.fs.ls(&ana, "/mine/pub").unwrap();
    assert_eq!(copy[0].uid, ana.uid);
}

#[test]
fn move_relocates_a_subtree() {
    let fx = fixture();
    fx.fs
        .mkfile(&fx.root, "/from/tree/leaf.txt", FileContent::from("leaf"), true)
        .unwrap();
    fx.fs.mkdir(&fx.root, "/to", false).unwrap();
    let used = fx.fs.superblock().unwrap().inodes_count;

    fx.fs.mv(&fx.root, "/from/tree", "/to").unwrap();
    assert!(!fx.fs.exists("/from/tree").unwrap());
    assert_eq!(fx.fs.cat(&fx.root, "/to/tree/leaf.txt").unwrap(), b"leaf");
    assert_eq!(fx.fs.superblock().unwrap().inodes_count, used);

    assert!(matches!(
        fx.fs.mv(&fx.root, "/to/tree", "/to"),
        Err(VdiskError::AlreadyExists(_))
    ));
    fx.fs
        .mkfile(&fx.root, "/other/tree/leaf.txt", FileContent::from("x"), true)
        .unwrap();
    assert!(matches!(
        fx.fs.mv(&fx.root, "/other/tree", "/to"),
        Err(VdiskError::AlreadyExists(_))
    ));
    assert!(fx.fs.exists("/other/tree/leaf.txt").unwrap());
    assert_accounting(&fx.fs);
}

#[test]
fn move_without_write_access_changes_nothing() {
    let fx = fixture();
    let ana = add_user(&fx, "ana", "staff");
    fx.fs
        .mkfile(&ana, "/box/mine.txt", FileContent::from("m"), true)
        .unwrap();
    fx.fs.chmod(&fx.root, "/box", "777", false).unwrap();
    fx.fs
        .mkfile(&fx.root, "/box/root.txt", FileContent::from("r"), false)
        .unwrap();
    fx.fs.mkdir(&ana, "/dest", false).unwrap();

    assert!(matches!(
        fx.fs.mv(&ana, "/box", "/dest"),
        Err(VdiskError::PermissionDenied(_))
    ));
    assert!(fx.fs.exists("/box/root.txt").unwrap());
    assert!(!fx.fs.exists("/dest/box").unwrap());
}

// ---------------------------------------------------------------------------
// Scenario 9: chmod and chown
// ---------------------------------------------------------------------------

#[test]
fn chmod_needs_root_group_and_recurses() {
    let fx = fixture();
    let ana = add_user(&fx, "ana", "staff");
    fx.fs
        .mkfile(&fx.root, "/t/u/v.txt", FileContent::from("v"), true)
        .unwrap();

    assert!(matches!(
        fx.fs.chmod(&ana, "/t", "777", true),
        Err(VdiskError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.fs.chmod(&fx.root, "/t", "9x9", true),
        Err(VdiskError::InvalidArgument(_))
    ));
    assert_eq!(fx.fs.chmod(&fx.root, "/t", "750", true).unwrap(), 3);
    assert_eq!(fx.fs.chmod(&fx.root, "/t", "700", false).unwrap(), 1);

    let tree = fx.fs.tree(&fx.root, "/t").unwrap();
    assert_eq!(tree.entry.perm, "700");
    assert_eq!(tree.children[0].entry.perm, "750");
    assert_eq!(tree.children[0].children[0].entry.perm, "750");
}

#[test]
fn chown_recursion_only_touches_owned_entries() {
    let fx = fixture();
    let ana = add_user(&fx, "ana", "staff");
    fx.fs
        .mkfile(&ana, "/home/a.txt", FileContent::from("a"), true)
        .unwrap();
    fx.fs.chmod(&fx.root, "/home", "777", false).unwrap();
    fx.fs
        .mkfile(&fx.root, "/home/r.txt", FileContent::from("r"), false)
        .unwrap();

    assert_eq!(fx.fs.chown(&ana, "/home", "root", true).unwrap(), 2);
    let listing = fx.fs.ls(&fx.root, "/home").unwrap();
    assert!(listing.iter().all(|e| e.uid == 1));

    // Not the owner any more and not in the root group.
    assert!(matches!(
        fx.fs.chown(&ana, "/home", "ana", false),
        Err(VdiskError::PermissionDenied(_))
    ));
    assert!(matches!(
        fx.fs.chown(&fx.root, "/home", "ghost", false),
        Err(VdiskError::NotFound(_))
    ));
    assert_eq!(fx.fs.chown(&fx.root, "/home", "ana", true).unwrap(), 3);
}

// ---------------------------------------------------------------------------
// Scenario 10: ls, tree, find
// ---------------------------------------------------------------------------

#[test]
fn listing_tree_and_find() {
    let fx = fixture();
    fx.fs
        .mkfile(&fx.root, "/docs/a.txt", FileContent::from("a"), true)
        .unwrap();
    fx.fs
        .mkfile(&fx.root, "/docs/img/b.png", FileContent::from("b"), true)
        .unwrap();
    fx.fs
        .mkfile(&fx.root, "/docs/img/c.txt", FileContent::from("c"), true)
        .unwrap();

    let ls = fx.fs.ls(&fx.root, "/docs").unwrap();
    let names: Vec<&str> = ls.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "img"]);
    assert_eq!(ls[1].file_type, FileType::Directory);

    let file = fx.fs.ls(&fx.root, "/docs/a.txt").unwrap();
    assert_eq!(file.len(), 1);
    assert_eq!(file[0].size, 1);

    let tree = fx.fs.tree(&fx.root, "/").unwrap();
    let paths = tree.paths("/");
    assert!(paths.contains(&"/docs/img/b.png".to_owned()));
    assert!(paths.contains(&"/users.txt".to_owned()));

    let found = fx.fs.find(&fx.root, "/docs", "*.TXT").unwrap();
    assert_eq!(found, vec!["/docs/a.txt".to_owned(), "/docs/img/c.txt".to_owned()]);
    let found = fx.fs.find(&fx.root, "/", "?.png").unwrap();
    assert_eq!(found, vec!["/docs/img/b.png".to_owned()]);

    assert!(matches!(
        fx.fs.ls(&fx.root, "/missing"),
        Err(VdiskError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Scenario 11: Sessions and mounts
// ---------------------------------------------------------------------------

#[test]
fn session_is_bound_to_its_mount() {
    let fx = fixture();
    fdisk_create(&fx.disk, &partition("P2")).unwrap();
    let id = fx.mounts.mount(&fx.disk, "P2").unwrap();
    assert_eq!(id.as_str(), "762A");
    let second = fx.mounts.filesystem(&id).unwrap();
    second.format(FormatOptions { journaled: false }).unwrap();

    assert!(matches!(
        second.mkdir(&fx.root, "/x", false),
        Err(VdiskError::InvalidArgument(_))
    ));
    let local = second.login("root", "123").unwrap();
    second.mkdir(&local, "/x", false).unwrap();
    assert!(!fx.fs.exists("/x").unwrap());
    assert!(matches!(
        second.journaling(),
        Err(VdiskError::NotAFilesystemFeature(_))
    ));
    assert_eq!(fx.mounts.list().len(), 2);
}

// ---------------------------------------------------------------------------
// Scenario 12: Cyclic directory entries
// ---------------------------------------------------------------------------

/// Write `name -> target` into entry `slot` of the first block of `dir`,
/// behind the filesystem's back.
fn link_raw(fx: &Fixture, dir: InodeNumber, slot: usize, name: &str, target: InodeNumber) {
    let sb = fx.fs.superblock().unwrap();
    let block = fx.fs.inode(dir).unwrap().block[0];
    let offset = sb.block_start as u64 + block as u64 * BLOCK_SIZE as u64
        + (slot * (DIR_NAME_LEN + 4)) as u64;
    let mut entry = [0u8; DIR_NAME_LEN + 4];
    entry[..name.len()].copy_from_slice(name.as_bytes());
    entry[DIR_NAME_LEN..].copy_from_slice(&i32::try_from(target.0).unwrap().to_le_bytes());
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&fx.disk)
        .unwrap();
    file.write_all_at(&entry, offset).unwrap();
}

#[test]
fn entry_pointing_at_an_ancestor_is_walked_once() {
    let fx = fixture();
    let a = fx.fs.mkdir(&fx.root, "/a", false).unwrap();
    let b = fx.fs.mkdir(&fx.root, "/a/b", false).unwrap();
    fx.fs
        .mkfile(&fx.root, "/a/b/f.txt", FileContent::from("f"), false)
        .unwrap();
    // Slots 0 and 1 hold `.` and `..`, slot 2 holds f.txt.
    link_raw(&fx, b, 3, "loop", a);
    assert_eq!(fx.fs.ls(&fx.root, "/a/b").unwrap().len(), 2);

    let tree = fx.fs.tree(&fx.root, "/a").unwrap();
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].children.len(), 1);

    fx.fs.mkdir(&fx.root, "/dst", false).unwrap();
    let report = fx.fs.copy(&fx.root, "/a", "/dst").unwrap();
    assert_eq!(report.copied, vec!["/dst/a", "/dst/a/b", "/dst/a/b/f.txt"]);
    assert!(!fx.fs.exists("/dst/a/b/loop").unwrap());

    assert_eq!(fx.fs.chmod(&fx.root, "/a", "775", true).unwrap(), 3);

    fx.fs.remove(&fx.root, "/a").unwrap();
    assert!(!fx.fs.exists("/a").unwrap());
    assert_eq!(fx.fs.cat(&fx.root, "/dst/a/b/f.txt").unwrap(), b"f");
    assert_accounting(&fx.fs);
}

// ---------------------------------------------------------------------------
// Scenario 13: Partial failure accounting
// ---------------------------------------------------------------------------

#[test]
fn failed_mkdir_with_parents_keeps_counters_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let disk = dir.path().join("small.dsk");
    mkdisk(
        &DiskRegistry::in_memory(),
        &disk,
        &DiskOptions {
            size: 64,
            unit: SizeUnit::Kilobytes,
            fit: Fit::First,
        },
    )
    .unwrap();
    fdisk_create(
        &disk,
        &PartitionRequest {
            size: 3,
            unit: SizeUnit::Kilobytes,
            ..partition("P1")
        },
    )
    .unwrap();
    let mounts = MountTable::default();
    let id = mounts.mount(&disk, "P1").unwrap();
    let fs = mounts.filesystem(&id).unwrap();
    fs.format(FormatOptions { journaled: false }).unwrap();
    let root = fs.login("root", "123").unwrap();

    let sb = fs.superblock().unwrap();
    assert_eq!(sb.inodes_count + sb.free_inodes_count, 10);
    for i in 0..7 {
        fs.mkfile(&root, &format!("/f{i}"), FileContent::Zeroed(0), false)
            .unwrap();
    }
    assert_eq!(fs.superblock().unwrap().free_inodes_count, 1);

    let err = fs.mkdir(&root, "/x/y", true).unwrap_err();
    assert!(matches!(err, VdiskError::CapacityExceeded(_)));
    assert!(fs.exists("/x").unwrap());
    let sb = fs.superblock().unwrap();
    assert_eq!(sb.inodes_count, 10);
    assert_eq!(sb.free_inodes_count, 0);
    assert_accounting(&fs);

    // A failure that allocated nothing leaves the image untouched.
    let before = std::fs::read(&disk).unwrap();
    assert!(fs.mkdir(&root, "/z", false).is_err());
    assert_eq!(std::fs::read(&disk).unwrap(), before);
}
