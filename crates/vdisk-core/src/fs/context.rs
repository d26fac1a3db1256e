//! Per-operation view of a mounted filesystem.

use tracing::warn;
use vdisk_alloc::{FsLayout, sync_counts};
use vdisk_block::{ByteDevice, corruption_at, read_record};
use vdisk_error::{Result, VdiskError};
use vdisk_inode::{read_inode, write_inode};
use vdisk_journal::{Journal, JournalOp};
use vdisk_ondisk::{Inode, SuperBlock};
use vdisk_types::{InodeNumber, SUPERBLOCK_SIZE, unix_timestamp};

use crate::perms::require_write;
use crate::session::Actor;

/// Superblock, layout and device of one filesystem, loaded at the start of
/// an operation and dropped at its end.
///
/// Allocation updates `sb` in memory; the operation calls
/// [`FsContext::save_superblock`] once when it is done.
pub(crate) struct FsContext<'a> {
    pub(crate) dev: &'a dyn ByteDevice,
    pub(crate) layout: FsLayout,
    pub(crate) sb: SuperBlock,
    loaded: SuperBlock,
    journal: Option<Journal>,
    replaying: bool,
}

impl<'a> FsContext<'a> {
    /// Read the superblock at `part_start` and derive the layout from it.
    pub(crate) fn load(dev: &'a dyn ByteDevice, part_start: u64) -> Result<Self> {
        let sb = read_record(dev, part_start, SUPERBLOCK_SIZE, SuperBlock::parse_from_bytes)?;
        let layout = FsLayout::from_superblock(&sb)?;
        if layout.part_start != part_start {
            return Err(VdiskError::Corruption {
                offset: part_start,
                detail: format!(
                    "superblock regions start at {} instead of the partition start",
                    layout.part_start
                ),
            });
        }
        Ok(Self::with_layout(dev, layout, sb))
    }

    pub(crate) fn with_layout(dev: &'a dyn ByteDevice, layout: FsLayout, sb: SuperBlock) -> Self {
        Self {
            dev,
            layout,
            loaded: sb.clone(),
            sb,
            journal: Journal::from_layout(&layout),
            replaying: false,
        }
    }

    /// Switch to journal replay: nothing is journaled and directory write
    /// checks are skipped for the rest of this context.
    pub(crate) fn begin_replay(&mut self) {
        self.replaying = true;
    }

    /// Write access on a directory about to gain an entry.
    pub(crate) fn check_dir_write(&self, dir: &Inode, actor: Actor, path: &str) -> Result<()> {
        if self.replaying {
            return Ok(());
        }
        require_write(dir, actor, path)
    }

    pub(crate) fn journal(&self) -> Result<Journal> {
        Journal::require(&self.layout)
    }

    pub(crate) fn now() -> f32 {
        unix_timestamp()
    }

    pub(crate) fn inode(&self, ino: InodeNumber) -> Result<Inode> {
        read_inode(self.dev, &self.layout, ino)
    }

    pub(crate) fn put_inode(&self, ino: InodeNumber, inode: &Inode) -> Result<()> {
        write_inode(self.dev, &self.layout, ino, inode)
    }

    pub(crate) fn save_superblock(&self) -> Result<()> {
        let offset = self.layout.part_start;
        let bytes = self.sb.to_bytes().map_err(corruption_at(offset))?;
        self.dev.write_all_at(offset, &bytes)
    }

    /// Bring the superblock counters back in line with the bitmaps after an
    /// operation failed partway.
    ///
    /// Nothing is written when the bitmaps still match the counters loaded
    /// at the start, so a failure that changed nothing leaves the image as
    /// it was.
    pub(crate) fn settle_counts(&mut self) -> Result<()> {
        let mut settled = self.loaded.clone();
        sync_counts(self.dev, &self.layout, &mut settled)?;
        let counters = |sb: &SuperBlock| {
            (
                sb.inodes_count,
                sb.free_inodes_count,
                sb.blocks_count,
                sb.free_blocks_count,
            )
        };
        if counters(&settled) == counters(&self.loaded) {
            return Ok(());
        }
        self.sb = settled;
        self.save_superblock()
    }

    /// Append `op` to the journal on ext3 filesystems.
    ///
    /// Runs after the mutation is applied. A failed append is logged and
    /// does not undo the mutation.
    pub(crate) fn record(&self, op: JournalOp, path: &str, content: &str) {
        if self.replaying {
            return;
        }
        let Some(journal) = self.journal else {
            return;
        };
        if let Err(err) = journal.append(self.dev, op, path, content, Self::now()) {
            warn!(op = %op, path, error = %err, "journal append failed");
        }
    }
}
