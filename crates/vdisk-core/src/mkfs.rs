//! Filesystem formatter.

use serde::{Deserialize, Serialize};
use tracing::info;
use vdisk_alloc::{FsLayout, alloc_inode, init_bitmaps};
use vdisk_block::ByteDevice;
use vdisk_dir::{add_entry, init_dir};
use vdisk_error::{Result, VdiskError};
use vdisk_inode::write_content;
use vdisk_journal::JournalOp;
use vdisk_ondisk::{Inode, SuperBlock};
use vdisk_types::{FS_TYPE_EXT2, FS_TYPE_EXT3, InodeNumber, Permissions, ROOT_GID, ROOT_UID};

use crate::fs::context::FsContext;
use crate::users::UsersFile;

/// Name of the credential file in the root directory.
pub const USERS_FILE: &str = "users.txt";

/// Parameters of `mkfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Reserve a journal after the superblock (`ext3`).
    pub journaled: bool,
}

impl FormatOptions {
    #[must_use]
    pub fn fs_type(self) -> i32 {
        if self.journaled { FS_TYPE_EXT3 } else { FS_TYPE_EXT2 }
    }
}

/// Format the partition at `[part_start, part_start + part_size)`.
///
/// The region is zero-filled, the bitmaps are marked free, and the root
/// directory plus `users.txt` are created. On ext3 both bootstrap objects
/// are the first two journal entries.
pub fn format(
    dev: &dyn ByteDevice,
    part_start: u64,
    part_size: u64,
    options: FormatOptions,
) -> Result<SuperBlock> {
    let layout = FsLayout::compute(part_start, part_size, options.journaled)?;
    dev.zero_range(part_start, part_size)?;
    init_bitmaps(dev, &layout)?;
    let sb = layout.fresh_superblock(options.fs_type(), FsContext::now())?;

    let mut ctx = FsContext::with_layout(dev, layout, sb);
    bootstrap(&mut ctx)?;
    ctx.save_superblock()?;
    ctx.record(JournalOp::Mkdir, "/", "");
    ctx.record(
        JournalOp::Mkfile,
        &format!("/{USERS_FILE}"),
        UsersFile::BOOTSTRAP,
    );
    info!(
        start = part_start,
        inodes = layout.inode_count,
        blocks = layout.block_count,
        fs_type = options.fs_type(),
        "filesystem formatted"
    );
    Ok(ctx.sb)
}

fn expect_inode(got: InodeNumber, want: InodeNumber, offset: u64) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(VdiskError::Corruption {
            offset,
            detail: format!("bootstrap expected inode {want}, allocator returned {got}"),
        })
    }
}

/// Create the root directory (inode 0) and `users.txt` (inode 1) on a
/// filesystem whose bitmaps are empty.
///
/// Does not touch the journal and does not save the superblock.
pub(crate) fn bootstrap(ctx: &mut FsContext<'_>) -> Result<()> {
    let now = FsContext::now();
    let offset = ctx.layout.bm_inode_start;

    let root_ino = alloc_inode(ctx.dev, &ctx.layout, &mut ctx.sb)?;
    expect_inode(root_ino, InodeNumber::ROOT, offset)?;
    let mut root = Inode::new_dir(ROOT_UID, ROOT_GID, Permissions::ROOT_DIR, now);
    init_dir(
        ctx.dev,
        &ctx.layout,
        &mut ctx.sb,
        &mut root,
        InodeNumber::ROOT,
        InodeNumber::ROOT,
    )?;

    let users_ino = alloc_inode(ctx.dev, &ctx.layout, &mut ctx.sb)?;
    expect_inode(users_ino, InodeNumber::USERS, offset)?;
    let mut users = Inode::new_file(ROOT_UID, ROOT_GID, Permissions::DEFAULT_FILE, now);
    write_content(
        ctx.dev,
        &ctx.layout,
        &mut ctx.sb,
        &mut users,
        UsersFile::BOOTSTRAP.as_bytes(),
    )?;
    add_entry(
        ctx.dev,
        &ctx.layout,
        &mut ctx.sb,
        &mut root,
        USERS_FILE,
        InodeNumber::USERS,
    )?;

    ctx.put_inode(InodeNumber::ROOT, &root)?;
    ctx.put_inode(InodeNumber::USERS, &users)?;
    Ok(())
}
