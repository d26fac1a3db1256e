#![forbid(unsafe_code)]
//! Shared primitives for the vdisk workspace.
//!
//! Fixed on-disk sizes, unit-carrying newtypes, the little-endian codec
//! helpers every structure parser is built on, and a few small value types
//! (`Fit`, `SizeUnit`, `Permissions`) that travel between crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── On-disk sizes ───────────────────────────────────────────────────────────

/// Bytes reserved for the MBR at offset 0 of a disk image.
pub const MBR_SIZE: usize = 153;
/// Bytes actually carried by the MBR fields; the rest of `MBR_SIZE` is zero.
pub const MBR_FIELDS_SIZE: usize = 145;
pub const PARTITION_SIZE: usize = 33;
pub const EBR_SIZE: usize = 30;
pub const SUPERBLOCK_SIZE: usize = 68;
pub const INODE_SIZE: usize = 88;
pub const BLOCK_SIZE: usize = 64;
pub const JOURNAL_ENTRY_SIZE: usize = 114;

pub const PARTITION_NAME_LEN: usize = 16;
pub const PARTITION_ID_LEN: usize = 4;
pub const MBR_PARTITION_SLOTS: usize = 4;

pub const DIR_NAME_LEN: usize = 12;
pub const DIR_ENTRIES_PER_BLOCK: usize = 4;
pub const POINTERS_PER_BLOCK: usize = 16;

pub const INODE_BLOCK_POINTERS: usize = 15;
pub const DIRECT_POINTERS: usize = 12;
pub const SINGLE_INDIRECT_SLOT: usize = 12;
pub const DOUBLE_INDIRECT_SLOT: usize = 13;
pub const TRIPLE_INDIRECT_SLOT: usize = 14;

pub const JOURNAL_OP_LEN: usize = 10;
pub const JOURNAL_PATH_LEN: usize = 32;
pub const JOURNAL_CONTENT_LEN: usize = 64;

pub const FS_MAGIC: i32 = 0xEF53;
pub const FS_TYPE_EXT2: i32 = 2;
pub const FS_TYPE_EXT3: i32 = 3;

/// Marker for an unused pointer or directory slot.
pub const NO_POINTER: i32 = -1;

/// Inode bitmap markers (one byte per inode).
pub const INODE_FREE: u8 = b'0';
pub const INODE_USED: u8 = b'1';
/// Block bitmap markers (one byte per block).
pub const BLOCK_FREE: u8 = b'O';
pub const BLOCK_USED: u8 = b'X';

/// Uid of the bootstrap `root` user; also the recursion-unrestricted sentinel.
pub const ROOT_UID: i32 = 1;
pub const ROOT_GID: i32 = 1;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Index into the inode table (0 is the root directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    pub const ROOT: Self = Self(0);
    pub const USERS: Self = Self(1);

    /// Decode an on-disk `i32` slot; `-1` (or any negative value) means empty.
    #[must_use]
    pub fn from_slot(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    /// Encode for an on-disk `i32` slot.
    pub fn to_slot(self) -> Result<i32, ParseError> {
        i32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "inode_number",
        })
    }
}

/// Index into the block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    #[must_use]
    pub fn from_slot(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    pub fn to_slot(self) -> Result<i32, ParseError> {
        i32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_number",
        })
    }
}

/// Absolute byte offset inside a disk image.
///
/// Unit-carrying wrapper so offsets are never confused with indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Offset of element `index` in a table of `stride`-sized records.
    #[must_use]
    pub fn at_index(self, index: u32, stride: usize) -> Option<Self> {
        let stride = u64::try_from(stride).ok()?;
        u64::from(index)
            .checked_mul(stride)
            .and_then(|delta| self.checked_add(delta))
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse errors and codec helpers ──────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len().saturating_sub(offset);
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_f32(data: &[u8], offset: usize) -> Result<f32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_f32(data: &mut [u8], offset: usize, value: f32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Write `value` into a fixed-width field, truncating or NUL-padding it.
pub fn write_padded(
    data: &mut [u8],
    offset: usize,
    width: usize,
    value: &[u8],
) -> Result<(), ParseError> {
    let field = ensure_slice_mut(data, offset, width)?;
    field.fill(0);
    let n = value.len().min(width);
    field[..n].copy_from_slice(&value[..n]);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Longest prefix of `s` that fits in `width` bytes without splitting a char.
#[must_use]
pub fn truncate_to_width(s: &str, width: usize) -> &str {
    if s.len() <= width {
        return s;
    }
    let mut end = width;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub fn usize_to_i32(value: usize, field: &'static str) -> Result<i32, ParseError> {
    i32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

pub fn i32_to_u64(value: i32, field: &'static str) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Seconds since the epoch as stored in the `f32` timestamp fields.
#[must_use]
#[expect(clippy::cast_precision_loss)]
pub fn unix_timestamp() -> f32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs() as f32)
}

// ── Fit policy ──────────────────────────────────────────────────────────────

/// Free-space placement policy for partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Fit {
    #[default]
    First,
    Best,
    Worst,
}

impl Fit {
    /// Single-byte code stored in MBR/partition/EBR records.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::First => b'F',
            Self::Best => b'B',
            Self::Worst => b'W',
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'F' => Some(Self::First),
            b'B' => Some(Self::Best),
            b'W' => Some(Self::Worst),
            _ => None,
        }
    }

    /// Parse the user-facing spelling: `FF`, `BF` or `WF` (any case).
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match text.to_ascii_uppercase().as_str() {
            "FF" => Ok(Self::First),
            "BF" => Ok(Self::Best),
            "WF" => Ok(Self::Worst),
            _ => Err(ParseError::InvalidField {
                field: "fit",
                reason: "expected FF, BF or WF",
            }),
        }
    }
}

impl fmt::Display for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::First => "FF",
            Self::Best => "BF",
            Self::Worst => "WF",
        };
        f.write_str(text)
    }
}

// ── Size units ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SizeUnit {
    Bytes,
    Kilobytes,
    #[default]
    Megabytes,
}

impl SizeUnit {
    #[must_use]
    pub fn multiplier(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kilobytes => 1024,
            Self::Megabytes => 1024 * 1024,
        }
    }

    /// Parse `B`, `K` or `M` (any case).
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match text.to_ascii_uppercase().as_str() {
            "B" => Ok(Self::Bytes),
            "K" => Ok(Self::Kilobytes),
            "M" => Ok(Self::Megabytes),
            _ => Err(ParseError::InvalidField {
                field: "unit",
                reason: "expected B, K or M",
            }),
        }
    }

    /// Convert `amount` of this unit to bytes, rejecting overflow.
    pub fn to_bytes(self, amount: u64) -> Result<u64, ParseError> {
        amount
            .checked_mul(self.multiplier())
            .ok_or(ParseError::IntegerConversion { field: "size" })
    }
}

// ── UGO permissions ─────────────────────────────────────────────────────────

/// Which class of a UGO triplet applies to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermClass {
    Owner,
    Group,
    Other,
}

/// ASCII octal triplet such as `664`, stored verbatim in inodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions([u8; 3]);

impl Permissions {
    pub const READ: u8 = 4;
    pub const WRITE: u8 = 2;

    pub const DEFAULT_FILE: Self = Self(*b"664");
    pub const ROOT_DIR: Self = Self(*b"777");

    /// Parse exactly three digits in `0..=7`.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let bytes = text.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| (b'0'..=b'7').contains(b)) {
            return Err(ParseError::InvalidField {
                field: "permissions",
                reason: "expected three octal digits",
            });
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    /// Accept raw bytes from disk without validation.
    #[must_use]
    pub fn from_raw(raw: [u8; 3]) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> [u8; 3] {
        self.0
    }

    /// Numeric digit for a class; non-digit bytes count as 0.
    #[must_use]
    pub fn digit(self, class: PermClass) -> u8 {
        let byte = match class {
            PermClass::Owner => self.0[0],
            PermClass::Group => self.0[1],
            PermClass::Other => self.0[2],
        };
        if byte.is_ascii_digit() { byte - b'0' } else { 0 }
    }

    /// Whether the digit for `class` carries every bit in `wanted`.
    #[must_use]
    pub fn allows(self, class: PermClass, wanted: u8) -> bool {
        self.digit(class) & wanted == wanted
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
