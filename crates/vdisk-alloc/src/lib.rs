#![forbid(unsafe_code)]
//! Inode and block allocation.
//!
//! ## Design
//!
//! 1. **Layout** ([`FsLayout`]): region offsets and capacities derived from
//!    the superblock (or, for `mkfs`, from the partition size).
//! 2. **Bitmaps**: one byte per unit. Inodes use `'1'`/`'0'`, blocks use
//!    `'X'`/`'O'`; any byte other than the used marker counts as free, so
//!    zeroed bitmaps read as empty.
//! 3. **Allocation**: every allocation scans the bitmap. The superblock's
//!    `first_ino`/`first_blo` fields are refreshed afterwards to the address
//!    of the lowest free unit and are only used as a scan start hint.
//!
//! Allocation functions update the in-memory `SuperBlock` counters; the
//! caller persists the superblock once per operation.

use tracing::debug;
use vdisk_block::{ByteDevice, read_vec};
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::SuperBlock;
use vdisk_types::{
    BLOCK_FREE, BLOCK_SIZE, BLOCK_USED, BlockNumber, FS_MAGIC, INODE_FREE, INODE_SIZE, INODE_USED,
    InodeNumber, JOURNAL_ENTRY_SIZE, SUPERBLOCK_SIZE,
};

/// Blocks budgeted per inode.
pub const BLOCKS_PER_INODE: u64 = 3;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Whether unit `idx` is marked `used`. Out-of-range indices read as used.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32, used: u8) -> bool {
    usize::try_from(idx)
        .ok()
        .and_then(|i| bitmap.get(i))
        .is_none_or(|byte| *byte == used)
}

/// Count units not marked `used`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], used: u8) -> u32 {
    let free = bitmap.iter().filter(|byte| **byte != used).count();
    u32::try_from(free).unwrap_or(u32::MAX)
}

/// First unit not marked `used`, scanning from `start` and wrapping around.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], used: u8, start: u32) -> Option<u32> {
    let len = u32::try_from(bitmap.len()).unwrap_or(u32::MAX);
    let start = if start < len { start } else { 0 };
    (start..len)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx, used))
}

// ── Layout ──────────────────────────────────────────────────────────────────

/// Region offsets (absolute image offsets) and capacities of one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsLayout {
    pub part_start: u64,
    /// Journal region, present on journaled filesystems.
    pub journal_start: Option<u64>,
    pub bm_inode_start: u64,
    pub bm_block_start: u64,
    pub inode_start: u64,
    pub block_start: u64,
    /// Inode capacity `N`; also the journal slot count.
    pub inode_count: u32,
    /// Block capacity `3N`.
    pub block_count: u32,
}

impl FsLayout {
    /// Lay out a new filesystem over `part_size` bytes at `part_start`.
    ///
    /// `N = (size - superblock) / (4 + inode + 3 * block [+ journal entry])`.
    pub fn compute(part_start: u64, part_size: u64, journaled: bool) -> Result<Self> {
        let mut per_unit = 1
            + BLOCKS_PER_INODE
            + as_u64(INODE_SIZE)
            + BLOCKS_PER_INODE * as_u64(BLOCK_SIZE);
        if journaled {
            per_unit += as_u64(JOURNAL_ENTRY_SIZE);
        }
        let n = part_size.saturating_sub(as_u64(SUPERBLOCK_SIZE)) / per_unit;
        if n < 2 {
            return Err(VdiskError::CapacityExceeded(format!(
                "partition of {part_size} bytes cannot hold a filesystem"
            )));
        }
        let inode_count = u32::try_from(n).map_err(|_| {
            VdiskError::InvalidArgument(format!("partition of {part_size} bytes is too large"))
        })?;
        let after_sb = part_start + as_u64(SUPERBLOCK_SIZE);
        let (journal_start, bm_inode_start) = if journaled {
            (Some(after_sb), after_sb + n * as_u64(JOURNAL_ENTRY_SIZE))
        } else {
            (None, after_sb)
        };
        let bm_block_start = bm_inode_start + n;
        let inode_start = bm_block_start + BLOCKS_PER_INODE * n;
        let block_start = inode_start + n * as_u64(INODE_SIZE);
        Ok(Self {
            part_start,
            journal_start,
            bm_inode_start,
            bm_block_start,
            inode_start,
            block_start,
            inode_count,
            block_count: inode_count.saturating_mul(3),
        })
    }

    /// Recover the layout from a superblock's region pointers.
    pub fn from_superblock(sb: &SuperBlock) -> Result<Self> {
        let field = |value: i32, name: &str| {
            u64::try_from(value).map_err(|_| VdiskError::Corruption {
                offset: 0,
                detail: format!("superblock {name} is negative ({value})"),
            })
        };
        let bm_inode_start = field(sb.bm_inode_start, "bm_inode_start")?;
        let bm_block_start = field(sb.bm_block_start, "bm_block_start")?;
        let inode_start = field(sb.inode_start, "inode_start")?;
        let block_start = field(sb.block_start, "block_start")?;

        let n = bm_block_start.saturating_sub(bm_inode_start);
        let consistent = n > 0
            && inode_start == bm_block_start + BLOCKS_PER_INODE * n
            && block_start == inode_start + n * as_u64(INODE_SIZE);
        if !consistent {
            return Err(VdiskError::Corruption {
                offset: bm_inode_start,
                detail: "superblock region pointers are not monotonic or disagree in size".into(),
            });
        }
        let inode_count = u32::try_from(n).map_err(|_| VdiskError::Corruption {
            offset: bm_inode_start,
            detail: format!("inode capacity {n} out of range"),
        })?;

        let journal_len = if sb.is_journaled() {
            n * as_u64(JOURNAL_ENTRY_SIZE)
        } else {
            0
        };
        let after_sb = bm_inode_start
            .checked_sub(journal_len)
            .ok_or_else(|| VdiskError::Corruption {
                offset: bm_inode_start,
                detail: "journal region would start before the partition".into(),
            })?;
        let part_start = after_sb.saturating_sub(as_u64(SUPERBLOCK_SIZE));
        Ok(Self {
            part_start,
            journal_start: sb.is_journaled().then_some(after_sb),
            bm_inode_start,
            bm_block_start,
            inode_start,
            block_start,
            inode_count,
            block_count: inode_count.saturating_mul(3),
        })
    }

    /// Superblock of an empty filesystem with this layout, mounted once.
    pub fn fresh_superblock(&self, fs_type: i32, now: f32) -> Result<SuperBlock> {
        let field = |value: u64, name: &str| {
            i32::try_from(value).map_err(|_| {
                VdiskError::InvalidArgument(format!("{name} offset {value} exceeds the image limit"))
            })
        };
        Ok(SuperBlock {
            fs_type,
            inodes_count: 0,
            blocks_count: 0,
            free_blocks_count: to_i32(self.block_count),
            free_inodes_count: to_i32(self.inode_count),
            mtime: now,
            umtime: 0.0,
            mnt_count: 1,
            magic: FS_MAGIC,
            inode_size: i32::try_from(INODE_SIZE).unwrap_or(i32::MAX),
            block_size: i32::try_from(BLOCK_SIZE).unwrap_or(i32::MAX),
            first_ino: field(self.inode_start, "inode table")?,
            first_blo: field(self.block_start, "block table")?,
            bm_inode_start: field(self.bm_inode_start, "inode bitmap")?,
            bm_block_start: field(self.bm_block_start, "block bitmap")?,
            inode_start: field(self.inode_start, "inode table")?,
            block_start: field(self.block_start, "block table")?,
        })
    }

    /// Bytes from the partition start to the end of the block table.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.block_start + u64::from(self.block_count) * as_u64(BLOCK_SIZE) - self.part_start
    }

    pub fn inode_offset(&self, ino: InodeNumber) -> Result<u64> {
        if ino.0 >= self.inode_count {
            return Err(VdiskError::Corruption {
                offset: self.inode_start,
                detail: format!("inode {ino} beyond capacity {}", self.inode_count),
            });
        }
        Ok(self.inode_start + u64::from(ino.0) * as_u64(INODE_SIZE))
    }

    pub fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(VdiskError::Corruption {
                offset: self.block_start,
                detail: format!("block {block} beyond capacity {}", self.block_count),
            });
        }
        Ok(self.block_start + u64::from(block.0) * as_u64(BLOCK_SIZE))
    }
}

fn as_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn usize_len(count: u32) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

fn address_hint(table_start: u64, stride: usize, idx: Option<u32>) -> i32 {
    idx.and_then(|idx| {
        let addr = table_start + u64::from(idx) * as_u64(stride);
        i32::try_from(addr).ok()
    })
    .unwrap_or(-1)
}

fn hint_index(hint: i32, table_start: u64, stride: usize) -> u32 {
    u64::try_from(hint)
        .ok()
        .and_then(|addr| addr.checked_sub(table_start))
        .and_then(|delta| u32::try_from(delta / as_u64(stride)).ok())
        .unwrap_or(0)
}

// ── Bitmap I/O ──────────────────────────────────────────────────────────────

pub fn read_inode_bitmap(dev: &dyn ByteDevice, layout: &FsLayout) -> Result<Vec<u8>> {
    read_vec(dev, layout.bm_inode_start, usize_len(layout.inode_count))
}

pub fn read_block_bitmap(dev: &dyn ByteDevice, layout: &FsLayout) -> Result<Vec<u8>> {
    read_vec(dev, layout.bm_block_start, usize_len(layout.block_count))
}

/// Mark every inode and block free.
pub fn init_bitmaps(dev: &dyn ByteDevice, layout: &FsLayout) -> Result<()> {
    dev.write_all_at(
        layout.bm_inode_start,
        &vec![INODE_FREE; usize_len(layout.inode_count)],
    )?;
    dev.write_all_at(
        layout.bm_block_start,
        &vec![BLOCK_FREE; usize_len(layout.block_count)],
    )
}

/// Recount used units from the bitmaps into `sb` and refresh both hints.
pub fn sync_counts(dev: &dyn ByteDevice, layout: &FsLayout, sb: &mut SuperBlock) -> Result<()> {
    let inodes = read_inode_bitmap(dev, layout)?;
    let blocks = read_block_bitmap(dev, layout)?;
    let free_inodes = bitmap_count_free(&inodes, INODE_USED);
    let free_blocks = bitmap_count_free(&blocks, BLOCK_USED);
    sb.free_inodes_count = to_i32(free_inodes);
    sb.inodes_count = to_i32(layout.inode_count - free_inodes);
    sb.free_blocks_count = to_i32(free_blocks);
    sb.blocks_count = to_i32(layout.block_count - free_blocks);
    sb.first_ino = address_hint(
        layout.inode_start,
        INODE_SIZE,
        bitmap_find_free(&inodes, INODE_USED, 0),
    );
    sb.first_blo = address_hint(
        layout.block_start,
        BLOCK_SIZE,
        bitmap_find_free(&blocks, BLOCK_USED, 0),
    );
    Ok(())
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

// ── Allocation ──────────────────────────────────────────────────────────────

pub fn alloc_inode(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
) -> Result<InodeNumber> {
    let mut bitmap = read_inode_bitmap(dev, layout)?;
    let start = hint_index(sb.first_ino, layout.inode_start, INODE_SIZE);
    let idx = bitmap_find_free(&bitmap, INODE_USED, start)
        .ok_or_else(|| VdiskError::CapacityExceeded("no free inodes".into()))?;
    dev.write_all_at(layout.bm_inode_start + u64::from(idx), &[INODE_USED])?;
    bitmap[usize_len(idx)] = INODE_USED;

    sb.inodes_count += 1;
    sb.free_inodes_count -= 1;
    sb.first_ino = address_hint(
        layout.inode_start,
        INODE_SIZE,
        bitmap_find_free(&bitmap, INODE_USED, 0),
    );
    debug!(inode = idx, free = sb.free_inodes_count, "inode allocated");
    Ok(InodeNumber(idx))
}

pub fn free_inode(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    ino: InodeNumber,
) -> Result<()> {
    let mut bitmap = read_inode_bitmap(dev, layout)?;
    if !bitmap_get(&bitmap, ino.0, INODE_USED) {
        return Err(VdiskError::Corruption {
            offset: layout.bm_inode_start + u64::from(ino.0),
            detail: format!("inode {ino} is already free"),
        });
    }
    dev.write_all_at(layout.bm_inode_start + u64::from(ino.0), &[INODE_FREE])?;
    bitmap[usize_len(ino.0)] = INODE_FREE;

    sb.inodes_count -= 1;
    sb.free_inodes_count += 1;
    sb.first_ino = address_hint(
        layout.inode_start,
        INODE_SIZE,
        bitmap_find_free(&bitmap, INODE_USED, 0),
    );
    debug!(inode = ino.0, free = sb.free_inodes_count, "inode freed");
    Ok(())
}

/// Mark a specific inode used. Returns `false` when it already was.
pub fn claim_inode(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    ino: InodeNumber,
) -> Result<bool> {
    let mut bitmap = read_inode_bitmap(dev, layout)?;
    if ino.0 >= layout.inode_count {
        return Err(VdiskError::InvalidArgument(format!(
            "inode {ino} is outside the table"
        )));
    }
    if bitmap_get(&bitmap, ino.0, INODE_USED) {
        return Ok(false);
    }
    dev.write_all_at(layout.bm_inode_start + u64::from(ino.0), &[INODE_USED])?;
    bitmap[usize_len(ino.0)] = INODE_USED;

    sb.inodes_count += 1;
    sb.free_inodes_count -= 1;
    sb.first_ino = address_hint(
        layout.inode_start,
        INODE_SIZE,
        bitmap_find_free(&bitmap, INODE_USED, 0),
    );
    debug!(inode = ino.0, "inode claimed");
    Ok(true)
}

pub fn alloc_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
) -> Result<BlockNumber> {
    let mut bitmap = read_block_bitmap(dev, layout)?;
    let start = hint_index(sb.first_blo, layout.block_start, BLOCK_SIZE);
    let idx = bitmap_find_free(&bitmap, BLOCK_USED, start)
        .ok_or_else(|| VdiskError::CapacityExceeded("no free blocks".into()))?;
    dev.write_all_at(layout.bm_block_start + u64::from(idx), &[BLOCK_USED])?;
    bitmap[usize_len(idx)] = BLOCK_USED;

    sb.blocks_count += 1;
    sb.free_blocks_count -= 1;
    sb.first_blo = address_hint(
        layout.block_start,
        BLOCK_SIZE,
        bitmap_find_free(&bitmap, BLOCK_USED, 0),
    );
    debug!(block = idx, free = sb.free_blocks_count, "block allocated");
    Ok(BlockNumber(idx))
}

pub fn free_block(
    dev: &dyn ByteDevice,
    layout: &FsLayout,
    sb: &mut SuperBlock,
    block: BlockNumber,
) -> Result<()> {
    let mut bitmap = read_block_bitmap(dev, layout)?;
    if !bitmap_get(&bitmap, block.0, BLOCK_USED) {
        return Err(VdiskError::Corruption {
            offset: layout.bm_block_start + u64::from(block.0),
            detail: format!("block {block} is already free"),
        });
    }
    dev.write_all_at(layout.bm_block_start + u64::from(block.0), &[BLOCK_FREE])?;
    bitmap[usize_len(block.0)] = BLOCK_FREE;

    sb.blocks_count -= 1;
    sb.free_blocks_count += 1;
    sb.first_blo = address_hint(
        layout.block_start,
        BLOCK_SIZE,
        bitmap_find_free(&bitmap, BLOCK_USED, 0),
    );
    debug!(block = block.0, free = sb.free_blocks_count, "block freed");
    Ok(())
}
