#![forbid(unsafe_code)]
//! Operation journal for ext3-mode filesystems.
//!
//! The journal is a fixed array of 114-byte slots right after the
//! superblock, one slot per inode of capacity. Entries are appended at the
//! first empty slot and never rewritten; the first empty slot also ends the
//! log when reading. A full journal rejects appends with `CapacityExceeded`
//! instead of spilling into the bitmap region that follows it.
//!
//! The journal records *what* was done (operation tag, path, a content
//! snippet), not block images. Recovery replays it at the operation level.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use vdisk_alloc::FsLayout;
use vdisk_block::{ByteDevice, corruption_at, read_vec};
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::JournalEntry;
use vdisk_types::{
    JOURNAL_CONTENT_LEN, JOURNAL_ENTRY_SIZE, JOURNAL_PATH_LEN, truncate_to_width,
};

// ---------------------------------------------------------------------------
// Operation tags
// ---------------------------------------------------------------------------

/// Mutating operations recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalOp {
    Mkdir,
    Mkfile,
    Edit,
    Remove,
    Rename,
    Copy,
    Move,
    Chmod,
    Chown,
}

impl JournalOp {
    pub const ALL: [Self; 9] = [
        Self::Mkdir,
        Self::Mkfile,
        Self::Edit,
        Self::Remove,
        Self::Rename,
        Self::Copy,
        Self::Move,
        Self::Chmod,
        Self::Chown,
    ];

    /// Tag as stored in the entry's 10-byte operation field.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Mkdir => "mkdir",
            Self::Mkfile => "mkfile",
            Self::Edit => "edit",
            Self::Remove => "remove",
            Self::Rename => "rename",
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Chmod => "chmod",
            Self::Chown => "chown",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.tag().eq_ignore_ascii_case(tag.trim()))
    }
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ---------------------------------------------------------------------------
// Journal region
// ---------------------------------------------------------------------------

/// Location and slot count of a filesystem's journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Journal {
    start: u64,
    capacity: u32,
}

impl Journal {
    /// Journal of a journaled layout; `None` for ext2.
    #[must_use]
    pub fn from_layout(layout: &FsLayout) -> Option<Self> {
        layout.journal_start.map(|start| Self {
            start,
            capacity: layout.inode_count,
        })
    }

    /// Journal of `layout`, or `NotAFilesystemFeature` when it has none.
    pub fn require(layout: &FsLayout) -> Result<Self> {
        Self::from_layout(layout).ok_or_else(|| {
            VdiskError::NotAFilesystemFeature("filesystem was formatted without a journal".into())
        })
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn region_len(&self) -> u64 {
        u64::from(self.capacity) * JOURNAL_ENTRY_SIZE as u64
    }

    fn slot_offset(&self, slot: u32) -> u64 {
        self.start + u64::from(slot) * JOURNAL_ENTRY_SIZE as u64
    }

    fn read_region(&self, dev: &dyn ByteDevice) -> Result<Vec<u8>> {
        let len = usize::try_from(self.region_len()).map_err(|_| VdiskError::Corruption {
            offset: self.start,
            detail: "journal region exceeds addressable memory".into(),
        })?;
        read_vec(dev, self.start, len)
    }

    /// Entries in slot order, up to the first empty slot.
    pub fn entries(&self, dev: &dyn ByteDevice) -> Result<Vec<JournalEntry>> {
        let region = self.read_region(dev)?;
        let mut entries = Vec::new();
        for (slot, bytes) in region.chunks_exact(JOURNAL_ENTRY_SIZE).enumerate() {
            let offset = self.start + (slot * JOURNAL_ENTRY_SIZE) as u64;
            if JournalEntry::is_empty_slot(bytes).map_err(corruption_at(offset))? {
                break;
            }
            entries.push(JournalEntry::parse_from_bytes(bytes).map_err(corruption_at(offset))?);
        }
        Ok(entries)
    }

    /// Number of used slots.
    pub fn len(&self, dev: &dyn ByteDevice) -> Result<u32> {
        let region = self.read_region(dev)?;
        let mut used = 0_u32;
        for (slot, bytes) in region.chunks_exact(JOURNAL_ENTRY_SIZE).enumerate() {
            let offset = self.start + (slot * JOURNAL_ENTRY_SIZE) as u64;
            if JournalEntry::is_empty_slot(bytes).map_err(corruption_at(offset))? {
                break;
            }
            used += 1;
        }
        Ok(used)
    }

    pub fn is_empty(&self, dev: &dyn ByteDevice) -> Result<bool> {
        Ok(self.len(dev)? == 0)
    }

    /// Record `op` in the next free slot. Path and content are cut to their
    /// field widths. The entry's counter is its 1-based slot number.
    pub fn append(
        &self,
        dev: &dyn ByteDevice,
        op: JournalOp,
        path: &str,
        content: &str,
        now: f32,
    ) -> Result<JournalEntry> {
        let slot = self.len(dev)?;
        if slot >= self.capacity {
            return Err(VdiskError::CapacityExceeded(format!(
                "journal full ({} entries)",
                self.capacity
            )));
        }
        let count = i32::try_from(slot + 1).map_err(|_| {
            VdiskError::CapacityExceeded("journal sequence overflow".into())
        })?;
        let entry = JournalEntry {
            count,
            op: op.tag().to_owned(),
            path: truncate_to_width(path, JOURNAL_PATH_LEN).to_owned(),
            content: truncate_to_width(content, JOURNAL_CONTENT_LEN).to_owned(),
            date: now,
        };
        let offset = self.slot_offset(slot);
        let bytes = entry.to_bytes().map_err(corruption_at(offset))?;
        dev.write_all_at(offset, &bytes)?;
        debug!(seq = count, op = %op, path, "journal append");
        Ok(entry)
    }
}
