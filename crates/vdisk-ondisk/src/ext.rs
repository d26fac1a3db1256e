//! Filesystem records living inside a formatted partition.

use serde::{Deserialize, Serialize};
use vdisk_types::{
    BLOCK_SIZE, DIR_ENTRIES_PER_BLOCK, DIR_NAME_LEN, FS_MAGIC, FS_TYPE_EXT3, INODE_BLOCK_POINTERS,
    INODE_SIZE, JOURNAL_CONTENT_LEN, JOURNAL_ENTRY_SIZE, JOURNAL_OP_LEN, JOURNAL_PATH_LEN,
    NO_POINTER, POINTERS_PER_BLOCK, ParseError, Permissions, SUPERBLOCK_SIZE, ensure_slice,
    read_fixed, read_le_f32, read_le_i32, read_u8, trim_nul_padded, write_le_f32, write_le_i32,
    write_padded, write_u8,
};

pub const INODE_KIND_DIR: u8 = b'0';
pub const INODE_KIND_FILE: u8 = b'1';

// ── Superblock ──────────────────────────────────────────────────────────────

/// Superblock at the start of a formatted partition.
///
/// `inodes_count` and `blocks_count` hold the number of *used* units; the
/// free counters complete them to the capacity. The four `*_start` fields are
/// absolute image offsets and the only source of truth for region layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperBlock {
    pub fs_type: i32,
    pub inodes_count: i32,
    pub blocks_count: i32,
    pub free_blocks_count: i32,
    pub free_inodes_count: i32,
    pub mtime: f32,
    pub umtime: f32,
    pub mnt_count: i32,
    pub magic: i32,
    pub inode_size: i32,
    pub block_size: i32,
    pub first_ino: i32,
    pub first_blo: i32,
    pub bm_inode_start: i32,
    pub bm_block_start: i32,
    pub inode_start: i32,
    pub block_start: i32,
}

impl SuperBlock {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, SUPERBLOCK_SIZE)?;
        let magic = read_le_i32(bytes, 32)?;
        if magic != FS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FS_MAGIC.unsigned_abs()),
                actual: u64::from(magic.unsigned_abs()),
            });
        }
        Ok(Self {
            fs_type: read_le_i32(bytes, 0)?,
            inodes_count: read_le_i32(bytes, 4)?,
            blocks_count: read_le_i32(bytes, 8)?,
            free_blocks_count: read_le_i32(bytes, 12)?,
            free_inodes_count: read_le_i32(bytes, 16)?,
            mtime: read_le_f32(bytes, 20)?,
            umtime: read_le_f32(bytes, 24)?,
            mnt_count: read_le_i32(bytes, 28)?,
            magic,
            inode_size: read_le_i32(bytes, 36)?,
            block_size: read_le_i32(bytes, 40)?,
            first_ino: read_le_i32(bytes, 44)?,
            first_blo: read_le_i32(bytes, 48)?,
            bm_inode_start: read_le_i32(bytes, 52)?,
            bm_block_start: read_le_i32(bytes, 56)?,
            inode_start: read_le_i32(bytes, 60)?,
            block_start: read_le_i32(bytes, 64)?,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; SUPERBLOCK_SIZE], ParseError> {
        let mut out = [0_u8; SUPERBLOCK_SIZE];
        let ints = [
            (0, self.fs_type),
            (4, self.inodes_count),
            (8, self.blocks_count),
            (12, self.free_blocks_count),
            (16, self.free_inodes_count),
            (28, self.mnt_count),
            (32, self.magic),
            (36, self.inode_size),
            (40, self.block_size),
            (44, self.first_ino),
            (48, self.first_blo),
            (52, self.bm_inode_start),
            (56, self.bm_block_start),
            (60, self.inode_start),
            (64, self.block_start),
        ];
        for (offset, value) in ints {
            write_le_i32(&mut out, offset, value)?;
        }
        write_le_f32(&mut out, 20, self.mtime)?;
        write_le_f32(&mut out, 24, self.umtime)?;
        Ok(out)
    }

    #[must_use]
    pub fn is_journaled(&self) -> bool {
        self.fs_type == FS_TYPE_EXT3
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// 88-byte inode record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    pub uid: i32,
    pub gid: i32,
    pub size: i32,
    pub atime: f32,
    pub ctime: f32,
    pub mtime: f32,
    pub block: [i32; INODE_BLOCK_POINTERS],
    pub kind: u8,
    pub perm: Permissions,
}

impl Inode {
    fn with_kind(kind: u8, uid: i32, gid: i32, perm: Permissions, now: f32) -> Self {
        Self {
            uid,
            gid,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            block: [NO_POINTER; INODE_BLOCK_POINTERS],
            kind,
            perm,
        }
    }

    #[must_use]
    pub fn new_dir(uid: i32, gid: i32, perm: Permissions, now: f32) -> Self {
        Self::with_kind(INODE_KIND_DIR, uid, gid, perm, now)
    }

    #[must_use]
    pub fn new_file(uid: i32, gid: i32, perm: Permissions, now: f32) -> Self {
        Self::with_kind(INODE_KIND_FILE, uid, gid, perm, now)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == INODE_KIND_DIR
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == INODE_KIND_FILE
    }

    /// A zeroed or garbage record has neither type marker.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_dir() || self.is_file()
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_SIZE)?;
        let mut block = [NO_POINTER; INODE_BLOCK_POINTERS];
        for (index, slot) in block.iter_mut().enumerate() {
            *slot = read_le_i32(bytes, 24 + index * 4)?;
        }
        Ok(Self {
            uid: read_le_i32(bytes, 0)?,
            gid: read_le_i32(bytes, 4)?,
            size: read_le_i32(bytes, 8)?,
            atime: read_le_f32(bytes, 12)?,
            ctime: read_le_f32(bytes, 16)?,
            mtime: read_le_f32(bytes, 20)?,
            block,
            kind: read_u8(bytes, 84)?,
            perm: Permissions::from_raw(read_fixed::<3>(bytes, 85)?),
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; INODE_SIZE], ParseError> {
        let mut out = [0_u8; INODE_SIZE];
        write_le_i32(&mut out, 0, self.uid)?;
        write_le_i32(&mut out, 4, self.gid)?;
        write_le_i32(&mut out, 8, self.size)?;
        write_le_f32(&mut out, 12, self.atime)?;
        write_le_f32(&mut out, 16, self.ctime)?;
        write_le_f32(&mut out, 20, self.mtime)?;
        for (index, pointer) in self.block.iter().enumerate() {
            write_le_i32(&mut out, 24 + index * 4, *pointer)?;
        }
        write_u8(&mut out, 84, self.kind)?;
        out[85..88].copy_from_slice(&self.perm.raw());
        Ok(out)
    }
}

// ── Directory block ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: i32,
}

impl DirEntry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            inode: NO_POINTER,
        }
    }

    #[must_use]
    pub fn new(name: &str, inode: i32) -> Self {
        Self {
            name: name.to_owned(),
            inode,
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.inode < 0
    }

    /// `.` and `..` are bookkeeping entries, never user content.
    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Four `(name[12], inode:i32)` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirBlock {
    pub entries: [DirEntry; DIR_ENTRIES_PER_BLOCK],
}

impl DirBlock {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: std::array::from_fn(|_| DirEntry::empty()),
        }
    }

    /// First block of a new directory: `.` and `..` then two free slots.
    #[must_use]
    pub fn with_dots(self_inode: i32, parent_inode: i32) -> Self {
        let mut block = Self::empty();
        block.entries[0] = DirEntry::new(".", self_inode);
        block.entries[1] = DirEntry::new("..", parent_inode);
        block
    }

    #[must_use]
    pub fn free_slot(&self) -> Option<usize> {
        self.entries.iter().position(DirEntry::is_free)
    }

    /// Slot of a live entry whose name matches case-insensitively.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_free() && entry.name.eq_ignore_ascii_case(name))
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, BLOCK_SIZE)?;
        let stride = DIR_NAME_LEN + 4;
        let mut block = Self::empty();
        for (index, entry) in block.entries.iter_mut().enumerate() {
            let at = index * stride;
            entry.name = trim_nul_padded(&read_fixed::<DIR_NAME_LEN>(bytes, at)?);
            entry.inode = read_le_i32(bytes, at + DIR_NAME_LEN)?;
        }
        Ok(block)
    }

    pub fn to_bytes(&self) -> Result<[u8; BLOCK_SIZE], ParseError> {
        let stride = DIR_NAME_LEN + 4;
        let mut out = [0_u8; BLOCK_SIZE];
        for (index, entry) in self.entries.iter().enumerate() {
            let at = index * stride;
            write_padded(&mut out, at, DIR_NAME_LEN, entry.name.as_bytes())?;
            write_le_i32(&mut out, at + DIR_NAME_LEN, entry.inode)?;
        }
        Ok(out)
    }
}

// ── File and pointer blocks ─────────────────────────────────────────────────

/// Raw 64-byte content block, zero padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock(pub [u8; BLOCK_SIZE]);

impl FileBlock {
    /// Copy up to `BLOCK_SIZE` bytes of `chunk`, zero-padding the rest.
    #[must_use]
    pub fn from_chunk(chunk: &[u8]) -> Self {
        let mut data = [0_u8; BLOCK_SIZE];
        let n = chunk.len().min(BLOCK_SIZE);
        data[..n].copy_from_slice(&chunk[..n]);
        Self(data)
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self(read_fixed::<BLOCK_SIZE>(bytes, 0)?))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }
}

/// Sixteen block indices; used at every indirection level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerBlock {
    pub pointers: [i32; POINTERS_PER_BLOCK],
}

impl PointerBlock {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            pointers: [NO_POINTER; POINTERS_PER_BLOCK],
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, BLOCK_SIZE)?;
        let mut pointers = [NO_POINTER; POINTERS_PER_BLOCK];
        for (index, slot) in pointers.iter_mut().enumerate() {
            *slot = read_le_i32(bytes, index * 4)?;
        }
        Ok(Self { pointers })
    }

    pub fn to_bytes(&self) -> Result<[u8; BLOCK_SIZE], ParseError> {
        let mut out = [0_u8; BLOCK_SIZE];
        for (index, pointer) in self.pointers.iter().enumerate() {
            write_le_i32(&mut out, index * 4, *pointer)?;
        }
        Ok(out)
    }
}

// ── Journal entry ───────────────────────────────────────────────────────────

/// One 114-byte journal slot.
///
/// Layout: `count:i32 | op[10] | path[32] | content[64] | date:f32`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub count: i32,
    pub op: String,
    pub path: String,
    pub content: String,
    pub date: f32,
}

const JOURNAL_OP_AT: usize = 4;
const JOURNAL_PATH_AT: usize = JOURNAL_OP_AT + JOURNAL_OP_LEN;
const JOURNAL_CONTENT_AT: usize = JOURNAL_PATH_AT + JOURNAL_PATH_LEN;
const JOURNAL_DATE_AT: usize = JOURNAL_CONTENT_AT + JOURNAL_CONTENT_LEN;

impl JournalEntry {
    /// A slot is empty when its operation tag holds only NUL or space bytes.
    pub fn is_empty_slot(bytes: &[u8]) -> Result<bool, ParseError> {
        let op = ensure_slice(bytes, JOURNAL_OP_AT, JOURNAL_OP_LEN)?;
        Ok(op.iter().all(|b| *b == 0 || *b == b' '))
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, JOURNAL_ENTRY_SIZE)?;
        let content = ensure_slice(bytes, JOURNAL_CONTENT_AT, JOURNAL_CONTENT_LEN)?;
        let content_end = content.iter().position(|b| *b == 0).unwrap_or(content.len());
        Ok(Self {
            count: read_le_i32(bytes, 0)?,
            op: trim_nul_padded(ensure_slice(bytes, JOURNAL_OP_AT, JOURNAL_OP_LEN)?),
            path: trim_nul_padded(ensure_slice(bytes, JOURNAL_PATH_AT, JOURNAL_PATH_LEN)?),
            // Content keeps surrounding whitespace: file bodies end in newlines.
            content: String::from_utf8_lossy(&content[..content_end]).into_owned(),
            date: read_le_f32(bytes, JOURNAL_DATE_AT)?,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; JOURNAL_ENTRY_SIZE], ParseError> {
        let mut out = [0_u8; JOURNAL_ENTRY_SIZE];
        write_le_i32(&mut out, 0, self.count)?;
        write_padded(&mut out, JOURNAL_OP_AT, JOURNAL_OP_LEN, self.op.as_bytes())?;
        write_padded(&mut out, JOURNAL_PATH_AT, JOURNAL_PATH_LEN, self.path.as_bytes())?;
        write_padded(
            &mut out,
            JOURNAL_CONTENT_AT,
            JOURNAL_CONTENT_LEN,
            self.content.as_bytes(),
        )?;
        write_le_f32(&mut out, JOURNAL_DATE_AT, self.date)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdisk_types::{FS_TYPE_EXT2, PermClass};

    fn sample_superblock() -> SuperBlock {
        SuperBlock {
            fs_type: FS_TYPE_EXT3,
            inodes_count: 2,
            blocks_count: 2,
            free_blocks_count: 100,
            free_inodes_count: 32,
            mtime: 1_700_000_000.0,
            umtime: 0.0,
            mnt_count: 1,
            magic: FS_MAGIC,
            inode_size: 88,
            block_size: 64,
            first_ino: 2,
            first_blo: 2,
            bm_inode_start: 4000,
            bm_block_start: 4034,
            inode_start: 4136,
            block_start: 7128,
        }
    }

    #[test]
    fn superblock_round_trip_and_offsets() {
        let sb = sample_superblock();
        let bytes = sb.to_bytes().expect("encode");
        assert_eq!(read_le_i32(&bytes, 32).expect("magic"), 0xEF53);
        assert_eq!(read_le_i32(&bytes, 64).expect("block_start"), 7128);
        let parsed = SuperBlock::parse_from_bytes(&bytes).expect("decode");
        assert_eq!(parsed, sb);
        assert!(parsed.is_journaled());
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut sb = sample_superblock();
        sb.fs_type = FS_TYPE_EXT2;
        let mut bytes = sb.to_bytes().expect("encode");
        bytes[32] = 0;
        let err = SuperBlock::parse_from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
        assert!(SuperBlock::parse_from_bytes(&[0_u8; 67]).is_err());
    }

    #[test]
    fn inode_layout() {
        let mut inode = Inode::new_file(10, 5, Permissions::DEFAULT_FILE, 12.0);
        inode.size = 769;
        inode.block[0] = 3;
        inode.block[12] = 40;
        let bytes = inode.to_bytes().expect("encode");
        assert_eq!(bytes[84], b'1');
        assert_eq!(&bytes[85..88], b"664");
        assert_eq!(read_le_i32(&bytes, 24 + 12 * 4).expect("indirect"), 40);
        let parsed = Inode::parse_from_bytes(&bytes).expect("decode");
        assert_eq!(parsed, inode);
        assert!(parsed.is_file() && parsed.is_valid());
        assert!(parsed.perm.allows(PermClass::Owner, Permissions::WRITE));
    }

    #[test]
    fn zeroed_inode_is_invalid() {
        let parsed = Inode::parse_from_bytes(&[0_u8; INODE_SIZE]).expect("decode");
        assert!(!parsed.is_valid());
    }

    #[test]
    fn dir_block_lookup_is_case_insensitive() {
        let mut block = DirBlock::with_dots(0, 0);
        block.entries[2] = DirEntry::new("users.txt", 1);
        let parsed = DirBlock::parse_from_bytes(&block.to_bytes().expect("encode")).expect("decode");
        assert_eq!(parsed, block);
        assert_eq!(parsed.find("USERS.TXT"), Some(2));
        assert_eq!(parsed.find("missing"), None);
        assert_eq!(parsed.free_slot(), Some(3));
        assert!(parsed.entries[1].is_dot());
    }

    #[test]
    fn twelve_byte_names_fill_the_field() {
        let mut block = DirBlock::empty();
        block.entries[0] = DirEntry::new("abcdefghijkl", 7);
        let bytes = block.to_bytes().expect("encode");
        assert_eq!(&bytes[..12], b"abcdefghijkl");
        assert_eq!(read_le_i32(&bytes, 12).expect("inode"), 7);
        let parsed = DirBlock::parse_from_bytes(&bytes).expect("decode");
        assert_eq!(parsed.entries[0].name, "abcdefghijkl");
    }

    #[test]
    fn pointer_block_defaults_to_unused() {
        let mut block = PointerBlock::empty();
        block.pointers[15] = 99;
        let parsed =
            PointerBlock::parse_from_bytes(&block.to_bytes().expect("encode")).expect("decode");
        assert_eq!(parsed.pointers[0], NO_POINTER);
        assert_eq!(parsed.pointers[15], 99);
    }

    #[test]
    fn file_block_pads_with_zeros() {
        let block = FileBlock::from_chunk(b"hello");
        assert_eq!(&block.as_bytes()[..5], b"hello");
        assert!(block.as_bytes()[5..].iter().all(|b| *b == 0));
        let long = FileBlock::from_chunk(&[7_u8; 100]);
        assert_eq!(long.as_bytes(), &[7_u8; BLOCK_SIZE]);
    }

    #[test]
    fn journal_entry_truncates_and_keeps_newlines() {
        let entry = JournalEntry {
            count: 2,
            op: "mkfile".into(),
            path: "/users.txt".into(),
            content: "1,G,root\n1,U,root,root,123\n".into(),
            date: 5.0,
        };
        let bytes = entry.to_bytes().expect("encode");
        assert!(!JournalEntry::is_empty_slot(&bytes).expect("slot"));
        assert_eq!(JournalEntry::parse_from_bytes(&bytes).expect("decode"), entry);

        let long = JournalEntry {
            path: "/".repeat(40),
            content: "x".repeat(80),
            ..entry
        };
        let parsed = JournalEntry::parse_from_bytes(&long.to_bytes().expect("encode"))
            .expect("decode");
        assert_eq!(parsed.path.len(), JOURNAL_PATH_LEN);
        assert_eq!(parsed.content.len(), JOURNAL_CONTENT_LEN);
    }

    #[test]
    fn blank_journal_slot_is_empty() {
        let mut bytes = [0_u8; JOURNAL_ENTRY_SIZE];
        assert!(JournalEntry::is_empty_slot(&bytes).expect("zero"));
        bytes[4..14].copy_from_slice(b"          ");
        assert!(JournalEntry::is_empty_slot(&bytes).expect("spaces"));
    }
}
