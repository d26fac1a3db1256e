#![forbid(unsafe_code)]
//! Inode table access and the 3-level block map.
//!
//! An inode addresses up to `12 + 16 + 16² + 16³` data blocks: twelve direct
//! pointers, then single, double and triple indirect trees of
//! `PointerBlock`s. Pointer blocks are allocated lazily the first time a
//! logical block below them is mapped.

use tracing::{debug, trace};
use vdisk_alloc::{FsLayout, alloc_block, free_block};
use vdisk_block::{ByteDevice, corruption_at, read_record};
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::{DirBlock, FileBlock, Inode, PointerBlock, SuperBlock};
use vdisk_types::{
    BLOCK_SIZE, BlockNumber, DIRECT_POINTERS, DOUBLE_INDIRECT_SLOT, INODE_SIZE, InodeNumber,
    INODE_BLOCK_POINTERS, NO_POINTER, SINGLE_INDIRECT_SLOT, TRIPLE_INDIRECT_SLOT, usize_to_i32,
};

const FANOUT: u32 = 16;
const DIRECT: u32 = 12;
const SINGLE_SPAN: u32 = FANOUT;
const DOUBLE_SPAN: u32 = FANOUT * FANOUT;
const TRIPLE_SPAN: u32 = FANOUT * FANOUT * FANOUT;

/// Largest number of data blocks one inode can address.
pub const MAX_FILE_BLOCKS: u32 = DIRECT + SINGLE_SPAN + DOUBLE_SPAN + TRIPLE_SPAN;

// ── Record I/O ──────────────────────────────────────────────────────────────

pub fn read_inode(dev: &dyn ByteDevice, layout: &FsLayout, ino: InodeNumber) -> Result<Inode> {
    let offset = layout.inode_offset(ino)?;
    read_record(dev, offset, INODE_SIZE, Inode::parse_from_bytes)
}

pub fn write_inode(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    ino: InodeNumber,
    inode: &Inode,
) -> Result<()> {
    let offset = layout.inode_offset(ino)?;
    let bytes = inode.to_bytes().map_err(corruption_at(offset))?;
    dev.write_all_at(offset, &bytes)
}

pub fn read_block_bytes(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    block: BlockNumber,
) -> Result<[u8; BLOCK_SIZE]> {
    let offset = layout.block_offset(block)?;
    read_record(dev, offset, BLOCK_SIZE, |bytes| {
        FileBlock::parse_from_bytes(bytes).map(|b| b.0)
    })
}

pub fn write_block_bytes(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    block: BlockNumber,
    bytes: &[u8; BLOCK_SIZE],
) -> Result<()> {
    dev.write_all_at(layout.block_offset(block)?, bytes)
}

pub fn read_dir_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    block: BlockNumber,
) -> Result<DirBlock> {
    let offset = layout.block_offset(block)?;
    read_record(dev, offset, BLOCK_SIZE, DirBlock::parse_from_bytes)
}

pub fn write_dir_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    block: BlockNumber,
    dir: &DirBlock,
) -> Result<()> {
    let offset = layout.block_offset(block)?;
    let bytes = dir.to_bytes().map_err(corruption_at(offset))?;
    dev.write_all_at(offset, &bytes)
}

pub fn read_pointer_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    block: BlockNumber,
) -> Result<PointerBlock> {
    let offset = layout.block_offset(block)?;
    read_record(dev, offset, BLOCK_SIZE, PointerBlock::parse_from_bytes)
}

pub fn write_pointer_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    block: BlockNumber,
    pointers: &PointerBlock,
) -> Result<()> {
    let offset = layout.block_offset(block)?;
    let bytes = pointers.to_bytes().map_err(corruption_at(offset))?;
    dev.write_all_at(offset, &bytes)
}

// ── Block map ───────────────────────────────────────────────────────────────

/// Route from the inode's pointer array to a logical block: the top-level
/// slot, then one index per pointer level.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockPath {
    slot: usize,
    indices: Vec<usize>,
}

fn block_path(logical: u32) -> Result<BlockPath> {
    let idx = |value: u32| usize::try_from(value).unwrap_or(usize::MAX);
    let path = if logical < DIRECT {
        BlockPath {
            slot: idx(logical),
            indices: Vec::new(),
        }
    } else if logical < DIRECT + SINGLE_SPAN {
        BlockPath {
            slot: SINGLE_INDIRECT_SLOT,
            indices: vec![idx(logical - DIRECT)],
        }
    } else if logical < DIRECT + SINGLE_SPAN + DOUBLE_SPAN {
        let rel = logical - DIRECT - SINGLE_SPAN;
        BlockPath {
            slot: DOUBLE_INDIRECT_SLOT,
            indices: vec![idx(rel / FANOUT), idx(rel % FANOUT)],
        }
    } else if logical < MAX_FILE_BLOCKS {
        let rel = logical - DIRECT - SINGLE_SPAN - DOUBLE_SPAN;
        BlockPath {
            slot: TRIPLE_INDIRECT_SLOT,
            indices: vec![
                idx(rel / DOUBLE_SPAN),
                idx((rel / FANOUT) % FANOUT),
                idx(rel % FANOUT),
            ],
        }
    } else {
        return Err(VdiskError::CapacityExceeded(format!(
            "logical block {logical} beyond the {MAX_FILE_BLOCKS}-block addressing limit"
        )));
    };
    Ok(path)
}

/// Physical block holding `logical`, if mapped.
pub fn map_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    inode: &Inode,
    logical: u32,
) -> Result<Option<BlockNumber>> {
    let path = block_path(logical)?;
    let mut current = BlockNumber::from_slot(inode.block[path.slot]);
    for index in path.indices {
        let Some(pointer_block) = current else {
            return Ok(None);
        };
        let pointers = read_pointer_block(dev, layout, pointer_block)?;
        current = BlockNumber::from_slot(pointers.pointers[index]);
    }
    Ok(current)
}

fn fresh_pointer_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
) -> Result<BlockNumber> {
    let block = alloc_block(dev, layout, sb)?;
    write_pointer_block(dev, layout, block, &PointerBlock::empty())?;
    trace!(block = block.0, "pointer block allocated");
    Ok(block)
}

fn slot_value(block: BlockNumber) -> Result<i32> {
    block.to_slot().map_err(|err| VdiskError::Corruption {
        offset: 0,
        detail: err.to_string(),
    })
}

/// Physical block for `logical`, allocating it (and any missing pointer
/// blocks) when unmapped. Updates `inode.block` in memory only.
pub fn map_or_alloc(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    inode: &mut Inode,
    logical: u32,
) -> Result<BlockNumber> {
    let path = block_path(logical)?;
    let levels = path.indices.len();

    let mut current = match BlockNumber::from_slot(inode.block[path.slot]) {
        Some(block) => block,
        None => {
            let block = if levels == 0 {
                alloc_block(dev, layout, sb)?
            } else {
                fresh_pointer_block(dev, layout, sb)?
            };
            inode.block[path.slot] = slot_value(block)?;
            block
        }
    };

    for (depth, index) in path.indices.into_iter().enumerate() {
        let mut pointers = read_pointer_block(dev, layout, current)?;
        current = match BlockNumber::from_slot(pointers.pointers[index]) {
            Some(block) => block,
            None => {
                let leaf = depth + 1 == levels;
                let block = if leaf {
                    alloc_block(dev, layout, sb)?
                } else {
                    fresh_pointer_block(dev, layout, sb)?
                };
                pointers.pointers[index] = slot_value(block)?;
                write_pointer_block(dev, layout, current, &pointers)?;
                block
            }
        };
    }
    Ok(current)
}

fn collect_tree(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    root: BlockNumber,
    depth: usize,
    leaves: &mut Vec<BlockNumber>,
    pointer_blocks: &mut Vec<BlockNumber>,
) -> Result<()> {
    pointer_blocks.push(root);
    let pointers = read_pointer_block(dev, layout, root)?;
    for child in pointers.pointers.iter().filter_map(|p| BlockNumber::from_slot(*p)) {
        if depth == 1 {
            leaves.push(child);
        } else {
            collect_tree(dev, layout, child, depth - 1, leaves, pointer_blocks)?;
        }
    }
    Ok(())
}

/// Mapped data blocks in logical order and the pointer blocks above them.
pub fn block_tree(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    inode: &Inode,
) -> Result<(Vec<BlockNumber>, Vec<BlockNumber>)> {
    let mut leaves = Vec::new();
    let mut pointer_blocks = Vec::new();
    leaves.extend(
        inode.block[..DIRECT_POINTERS]
            .iter()
            .filter_map(|p| BlockNumber::from_slot(*p)),
    );
    for (depth, slot) in [
        (1, SINGLE_INDIRECT_SLOT),
        (2, DOUBLE_INDIRECT_SLOT),
        (3, TRIPLE_INDIRECT_SLOT),
    ] {
        if let Some(root) = BlockNumber::from_slot(inode.block[slot]) {
            collect_tree(dev, layout, root, depth, &mut leaves, &mut pointer_blocks)?;
        }
    }
    Ok((leaves, pointer_blocks))
}

/// Mapped data blocks in logical order.
pub fn data_blocks(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    inode: &Inode,
) -> Result<Vec<BlockNumber>> {
    Ok(block_tree(dev, layout, inode)?.0)
}

/// Pointer blocks needed to address `count` data blocks.
#[must_use]
pub fn pointer_blocks_for(count: u32) -> u32 {
    let mut needed = 0;
    let mut rest = count.saturating_sub(DIRECT);
    if rest == 0 {
        return 0;
    }
    needed += 1;
    rest = rest.saturating_sub(SINGLE_SPAN);
    if rest == 0 {
        return needed;
    }
    let in_double = rest.min(DOUBLE_SPAN);
    needed += 1 + in_double.div_ceil(FANOUT);
    rest -= in_double;
    if rest == 0 {
        return needed;
    }
    needed + 1 + rest.div_ceil(DOUBLE_SPAN) + rest.div_ceil(FANOUT)
}

// ── Content ─────────────────────────────────────────────────────────────────

/// File content, exactly `inode.size` bytes.
pub fn read_content(dev: &dyn ByteDevice, layout: &FsLayout, inode: &Inode) -> Result<Vec<u8>> {
    let size = usize::try_from(inode.size.max(0)).unwrap_or_default();
    let mut out = Vec::with_capacity(size);
    for block in data_blocks(dev, layout, inode)? {
        if out.len() >= size {
            break;
        }
        let bytes = read_block_bytes(dev, layout, block)?;
        let take = (size - out.len()).min(BLOCK_SIZE);
        out.extend_from_slice(&bytes[..take]);
    }
    Ok(out)
}

fn blocks_for_len(len: usize) -> Result<u32> {
    let blocks = len.div_ceil(BLOCK_SIZE).max(1);
    u32::try_from(blocks)
        .ok()
        .filter(|b| *b <= MAX_FILE_BLOCKS)
        .ok_or_else(|| {
            VdiskError::CapacityExceeded(format!(
                "content of {len} bytes exceeds the per-file addressing limit"
            ))
        })
}

/// Allocate blocks for `content` on an inode that owns none and write it.
///
/// A file always owns at least one data block, so an empty file can later
/// be edited in place up to one block of content.
pub fn write_content(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    inode: &mut Inode,
    content: &[u8],
) -> Result<()> {
    let blocks = blocks_for_len(content.len())?;
    let needed = blocks + pointer_blocks_for(blocks);
    if i64::from(sb.free_blocks_count) < i64::from(needed) {
        return Err(VdiskError::CapacityExceeded(format!(
            "{needed} blocks needed, {} free",
            sb.free_blocks_count
        )));
    }
    for logical in 0..blocks {
        let block = map_or_alloc(dev, layout, sb, inode, logical)?;
        let start = usize::try_from(logical).unwrap_or(usize::MAX) * BLOCK_SIZE;
        let chunk = content.get(start..).unwrap_or_default();
        write_block_bytes(dev, layout, block, FileBlock::from_chunk(chunk).as_bytes())?;
    }
    inode.size = usize_to_i32(content.len(), "size").map_err(|err| {
        VdiskError::CapacityExceeded(format!("content too large: {err}"))
    })?;
    debug!(blocks, bytes = content.len(), "content written");
    Ok(())
}

/// Overwrite content in the blocks the inode already owns.
///
/// Fails with `InvalidArgument` when `content` needs more than the existing
/// allocation; the block count never changes.
pub fn overwrite_content(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    inode: &mut Inode,
    content: &[u8],
) -> Result<()> {
    let blocks = data_blocks(dev, layout, inode)?;
    let capacity = blocks.len() * BLOCK_SIZE;
    if content.len() > capacity {
        return Err(VdiskError::InvalidArgument(format!(
            "content of {} bytes exceeds the file's allocation of {capacity} bytes",
            content.len()
        )));
    }
    for (index, block) in blocks.iter().enumerate() {
        let chunk = content.get(index * BLOCK_SIZE..).unwrap_or_default();
        write_block_bytes(dev, layout, *block, FileBlock::from_chunk(chunk).as_bytes())?;
    }
    inode.size = usize_to_i32(content.len(), "size").map_err(|err| {
        VdiskError::InvalidArgument(format!("content too large: {err}"))
    })?;
    Ok(())
}

/// Release every data and pointer block of `inode` and reset its map.
pub fn free_inode_blocks(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    inode: &mut Inode,
) -> Result<()> {
    let (leaves, pointer_blocks) = block_tree(dev, layout, inode)?;
    for block in leaves.into_iter().chain(pointer_blocks) {
        free_block(dev, layout, sb, block)?;
    }
    inode.block = [NO_POINTER; INODE_BLOCK_POINTERS];
    inode.size = 0;
    Ok(())
}

/// Free the old blocks and write `content` into a fresh allocation.
pub fn replace_content(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    inode: &mut Inode,
    content: &[u8],
) -> Result<()> {
    free_inode_blocks(dev, layout, sb, inode)?;
    write_content(dev, layout, sb, inode, content)
}
