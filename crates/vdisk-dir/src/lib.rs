#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory is an inode whose data blocks are `DirBlock`s of four
//! `(name, inode)` slots. The first block starts with `.` and `..`. Free
//! slots are reused before a new block is chained through the inode's block
//! map; blocks are never compacted. Names compare case-insensitively.

use tracing::trace;
use vdisk_alloc::FsLayout;
use vdisk_block::ByteDevice;
use vdisk_error::{Result, VdiskError};
use vdisk_inode::{data_blocks, map_or_alloc, read_dir_block, write_dir_block};
use vdisk_ondisk::{DirBlock, DirEntry, Inode, SuperBlock};
use vdisk_types::{BLOCK_SIZE, BlockNumber, DIR_NAME_LEN, InodeNumber, usize_to_i32};

/// Check that `name` fits a directory slot and is a plain path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VdiskError::InvalidArgument("empty name".into()));
    }
    if name.len() > DIR_NAME_LEN {
        return Err(VdiskError::InvalidArgument(format!(
            "name {name:?} is longer than {DIR_NAME_LEN} bytes"
        )));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(VdiskError::InvalidArgument(format!(
            "{name:?} is not a valid entry name"
        )));
    }
    Ok(())
}

fn slot_of(ino: InodeNumber) -> Result<i32> {
    ino.to_slot()
        .map_err(|err| VdiskError::InvalidArgument(err.to_string()))
}

fn dir_size(blocks: usize) -> Result<i32> {
    usize_to_i32(blocks * BLOCK_SIZE, "size")
        .map_err(|err| VdiskError::CapacityExceeded(err.to_string()))
}

/// Give a fresh directory inode its first block holding `.` and `..`.
pub fn init_dir(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    dir: &mut Inode,
    self_ino: InodeNumber,
    parent_ino: InodeNumber,
) -> Result<BlockNumber> {
    let block = map_or_alloc(dev, layout, sb, dir, 0)?;
    let dots = DirBlock::with_dots(slot_of(self_ino)?, slot_of(parent_ino)?);
    write_dir_block(dev, layout, block, &dots)?;
    dir.size = dir_size(1)?;
    Ok(block)
}

/// Every directory block in chain order with its physical number.
pub fn read_dir_blocks(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    dir: &Inode,
) -> Result<Vec<(BlockNumber, DirBlock)>> {
    data_blocks(dev, layout, dir)?
        .into_iter()
        .map(|block| Ok((block, read_dir_block(dev, layout, block)?)))
        .collect()
}

/// Inode a name refers to inside `dir`. `.` and `..` resolve too.
pub fn lookup(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    dir: &Inode,
    name: &str,
) -> Result<Option<InodeNumber>> {
    for (_, block) in read_dir_blocks(dev, layout, dir)? {
        if let Some(slot) = block.find(name) {
            let ino = InodeNumber::from_slot(block.entries[slot].inode);
            trace!(name, inode = ?ino, "directory hit");
            return Ok(ino);
        }
    }
    Ok(None)
}

/// Live entries other than `.` and `..`, in slot order.
pub fn list_entries(dev: &dyn ByteDevice, layout: &FsLayout, dir: &Inode) -> Result<Vec<DirEntry>> {
    Ok(read_dir_blocks(dev, layout, dir)?
        .into_iter()
        .flat_map(|(_, block)| block.entries)
        .filter(|entry| !entry.is_free() && !entry.is_dot())
        .collect())
}

/// Insert `name -> child` into `dir`, chaining a new block when every slot
/// is taken. Updates `dir.size` in memory; the caller writes the inode.
pub fn add_entry(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    dir: &mut Inode,
    name: &str,
    child: InodeNumber,
) -> Result<()> {
    validate_name(name)?;
    let entry = DirEntry::new(name, slot_of(child)?);
    let blocks = read_dir_blocks(dev, layout, dir)?;
    if blocks.iter().any(|(_, block)| block.find(name).is_some()) {
        return Err(VdiskError::AlreadyExists(name.to_owned()));
    }

    for (number, mut block) in blocks.iter().cloned() {
        if let Some(slot) = block.free_slot() {
            block.entries[slot] = entry;
            return write_dir_block(dev, layout, number, &block);
        }
    }

    let logical = u32::try_from(blocks.len())
        .map_err(|_| VdiskError::CapacityExceeded("directory block chain too long".into()))?;
    let number = map_or_alloc(dev, layout, sb, dir, logical)?;
    let mut block = DirBlock::empty();
    block.entries[0] = entry;
    write_dir_block(dev, layout, number, &block)?;
    dir.size = dir_size(blocks.len() + 1)?;
    trace!(name, block = number.0, "directory grew");
    Ok(())
}

/// Clear the slot holding `name` and return the inode it pointed to.
pub fn remove_entry(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    dir: &Inode,
    name: &str,
) -> Result<InodeNumber> {
    for (number, mut block) in read_dir_blocks(dev, layout, dir)? {
        let Some(slot) = block.find(name) else {
            continue;
        };
        if block.entries[slot].is_dot() {
            return Err(VdiskError::InvalidArgument(format!("cannot remove {name:?}")));
        }
        let ino = InodeNumber::from_slot(block.entries[slot].inode);
        block.entries[slot] = DirEntry::empty();
        write_dir_block(dev, layout, number, &block)?;
        return ino.ok_or_else(|| VdiskError::NotFound(name.to_owned()));
    }
    Err(VdiskError::NotFound(name.to_owned()))
}

/// Rename an entry in place. The new name must not collide with a sibling.
pub fn rename_entry(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    dir: &Inode,
    old: &str,
    new: &str,
) -> Result<()> {
    validate_name(new)?;
    let blocks = read_dir_blocks(dev, layout, dir)?;
    let same = old.eq_ignore_ascii_case(new);
    if !same && blocks.iter().any(|(_, block)| block.find(new).is_some()) {
        return Err(VdiskError::AlreadyExists(new.to_owned()));
    }
    for (number, mut block) in blocks {
        if let Some(slot) = block.find(old) {
            if block.entries[slot].is_dot() {
                return Err(VdiskError::InvalidArgument(format!("cannot rename {old:?}")));
            }
            block.entries[slot].name = new.to_owned();
            return write_dir_block(dev, layout, number, &block);
        }
    }
    Err(VdiskError::NotFound(old.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdisk_alloc::init_bitmaps;
    use vdisk_block::MemByteDevice;
    use vdisk_types::{FS_TYPE_EXT2, Permissions};

    fn setup() -> (MemByteDevice, FsLayout, SuperBlock, Inode) {
        let dev = MemByteDevice::new(60_000);
        let layout = FsLayout::compute(0, 60_000, false).unwrap();
        init_bitmaps(&dev, &layout).unwrap();
        let mut sb = layout.fresh_superblock(FS_TYPE_EXT2, 0.0).unwrap();
        let mut dir = Inode::new_dir(1, 1, Permissions::ROOT_DIR, 0.0);
        init_dir(&dev, &layout, &mut sb, &mut dir, InodeNumber(0), InodeNumber(0)).unwrap();
        (dev, layout, sb, dir)
    }

    #[test]
    fn validate_name_limits() {
        assert!(validate_name("twelve_chars").is_ok());
        assert!(validate_name("thirteen_char").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn init_dir_holds_dot_entries() {
        let (dev, layout, _, dir) = setup();
        assert_eq!(dir.size, 64);
        assert_eq!(lookup(&dev, &layout, &dir, ".").unwrap(), Some(InodeNumber(0)));
        assert_eq!(lookup(&dev, &layout, &dir, "..").unwrap(), Some(InodeNumber(0)));
        assert!(list_entries(&dev, &layout, &dir).unwrap().is_empty());
    }

    #[test]
    fn add_entry_fills_free_slots_then_chains_blocks() {
        let (dev, layout, mut sb, mut dir) = setup();
        add_entry(&dev, &layout, &mut sb, &mut dir, "a", InodeNumber(2)).unwrap();
        add_entry(&dev, &layout, &mut sb, &mut dir, "b", InodeNumber(3)).unwrap();
        assert_eq!(dir.size, 64);
        add_entry(&dev, &layout, &mut sb, &mut dir, "c", InodeNumber(4)).unwrap();
        assert_eq!(dir.size, 128);
        assert_eq!(read_dir_blocks(&dev, &layout, &dir).unwrap().len(), 2);

        let names: Vec<String> = list_entries(&dev, &layout, &dir)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(lookup(&dev, &layout, &dir, "C").unwrap(), Some(InodeNumber(4)));
    }

    #[test]
    fn add_entry_rejects_duplicates_case_insensitively() {
        let (dev, layout, mut sb, mut dir) = setup();
        add_entry(&dev, &layout, &mut sb, &mut dir, "Notes", InodeNumber(2)).unwrap();
        let err = add_entry(&dev, &layout, &mut sb, &mut dir, "notes", InodeNumber(3)).unwrap_err();
        assert_eq!(err.to_errno(), libc::EEXIST);
    }

    #[test]
    fn directory_grows_past_direct_pointers() {
        let (dev, layout, mut sb, mut dir) = setup();
        // 2 slots in the first block, then 4 per block: 50 entries need 13 blocks.
        for i in 0..50_u32 {
            add_entry(&dev, &layout, &mut sb, &mut dir, &format!("f{i}"), InodeNumber(i + 2))
                .unwrap();
        }
        assert_eq!(read_dir_blocks(&dev, &layout, &dir).unwrap().len(), 13);
        assert!(dir.block[12] >= 0);
        assert_eq!(
            lookup(&dev, &layout, &dir, "f49").unwrap(),
            Some(InodeNumber(51))
        );
    }

    #[test]
    fn remove_entry_frees_the_slot_for_reuse() {
        let (dev, layout, mut sb, mut dir) = setup();
        add_entry(&dev, &layout, &mut sb, &mut dir, "a", InodeNumber(2)).unwrap();
        assert_eq!(remove_entry(&dev, &layout, &dir, "A").unwrap(), InodeNumber(2));
        assert_eq!(lookup(&dev, &layout, &dir, "a").unwrap(), None);
        assert!(matches!(
            remove_entry(&dev, &layout, &dir, "a"),
            Err(VdiskError::NotFound(_))
        ));
        assert!(remove_entry(&dev, &layout, &dir, "..").is_err());

        let blocks = read_dir_blocks(&dev, &layout, &dir).unwrap();
        assert_eq!(blocks[0].1.entries[2], DirEntry::empty());
        add_entry(&dev, &layout, &mut sb, &mut dir, "b", InodeNumber(3)).unwrap();
        assert_eq!(dir.size, 64);
    }

    #[test]
    fn rename_entry_checks_collisions() {
        let (dev, layout, mut sb, mut dir) = setup();
        add_entry(&dev, &layout, &mut sb, &mut dir, "a", InodeNumber(2)).unwrap();
        add_entry(&dev, &layout, &mut sb, &mut dir, "b", InodeNumber(3)).unwrap();
        assert!(matches!(
            rename_entry(&dev, &layout, &dir, "a", "B"),
            Err(VdiskError::AlreadyExists(_))
        ));
        rename_entry(&dev, &layout, &dir, "a", "A").unwrap();
        rename_entry(&dev, &layout, &dir, "A", "z").unwrap();
        assert_eq!(lookup(&dev, &layout, &dir, "z").unwrap(), Some(InodeNumber(2)));
        assert!(matches!(
            rename_entry(&dev, &layout, &dir, "missing", "q"),
            Err(VdiskError::NotFound(_))
        ));
    }
}
