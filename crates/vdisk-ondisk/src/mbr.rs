//! Partition table records: MBR, its partition slots and the EBR chain.

use serde::{Deserialize, Serialize};
use vdisk_types::{
    EBR_SIZE, Fit, MBR_FIELDS_SIZE, MBR_PARTITION_SLOTS, MBR_SIZE, PARTITION_ID_LEN,
    PARTITION_NAME_LEN, PARTITION_SIZE, ParseError, ensure_slice, read_fixed, read_le_f32,
    read_le_i32, read_u8, trim_nul_padded, write_le_f32, write_le_i32, write_padded, write_u8,
};

/// Status/type/fit byte of a never-used MBR slot.
pub const SLOT_UNSET: u8 = b'N';
/// Status/type/fit byte of a slot cleared by a fast delete.
pub const SLOT_CLEARED: u8 = b'0';
pub const STATUS_ACTIVE: u8 = b'1';
pub const KIND_PRIMARY: u8 = b'P';
pub const KIND_EXTENDED: u8 = b'E';
pub const MOUNT_NO: u8 = b'0';
pub const MOUNT_YES: u8 = b'1';

/// `EBR_SIZE` as the signed offset type used inside records.
const EBR_LEN: i32 = 30;

// ── Partition slot ──────────────────────────────────────────────────────────

/// One of the four 33-byte partition descriptors carried by the MBR.
///
/// Layout: `status | kind | fit | mount | start:i32 | size:i32 | name[16] |
/// correlative:i8 | id[4]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub status: u8,
    pub kind: u8,
    pub fit: u8,
    pub mount: u8,
    pub start: i32,
    pub size: i32,
    pub name: String,
    pub correlative: i8,
    pub id: String,
}

impl Partition {
    /// The sentinel written into unused slots.
    #[must_use]
    pub fn unset() -> Self {
        Self {
            status: SLOT_UNSET,
            kind: SLOT_UNSET,
            fit: SLOT_UNSET,
            mount: SLOT_UNSET,
            start: -1,
            size: -1,
            name: "N".to_owned(),
            correlative: -1,
            id: "N".to_owned(),
        }
    }

    #[must_use]
    pub fn new(kind: u8, fit: Fit, start: i32, size: i32, name: &str) -> Self {
        Self {
            status: STATUS_ACTIVE,
            kind,
            fit: fit.code(),
            mount: MOUNT_NO,
            start,
            size,
            name: name.to_owned(),
            correlative: -1,
            id: String::new(),
        }
    }

    /// Whether this slot describes a live primary or extended partition.
    #[must_use]
    pub fn is_used(&self) -> bool {
        matches!(self.kind, KIND_PRIMARY | KIND_EXTENDED) && self.start >= 0 && self.size > 0
    }

    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.is_used() && self.kind == KIND_EXTENDED
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mount == MOUNT_YES
    }

    /// One past the last byte of the partition.
    #[must_use]
    pub fn end(&self) -> i64 {
        i64::from(self.start) + i64::from(self.size)
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, PARTITION_SIZE)?;
        Ok(Self {
            status: read_u8(bytes, 0)?,
            kind: read_u8(bytes, 1)?,
            fit: read_u8(bytes, 2)?,
            mount: read_u8(bytes, 3)?,
            start: read_le_i32(bytes, 4)?,
            size: read_le_i32(bytes, 8)?,
            name: trim_nul_padded(&read_fixed::<PARTITION_NAME_LEN>(bytes, 12)?),
            correlative: i8::from_le_bytes([read_u8(bytes, 28)?]),
            id: trim_nul_padded(&read_fixed::<PARTITION_ID_LEN>(bytes, 29)?),
        })
    }

    pub fn write_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(out, 0, PARTITION_SIZE)?;
        write_u8(out, 0, self.status)?;
        write_u8(out, 1, self.kind)?;
        write_u8(out, 2, self.fit)?;
        write_u8(out, 3, self.mount)?;
        write_le_i32(out, 4, self.start)?;
        write_le_i32(out, 8, self.size)?;
        write_padded(out, 12, PARTITION_NAME_LEN, self.name.as_bytes())?;
        write_u8(out, 28, self.correlative.to_le_bytes()[0])?;
        write_padded(out, 29, PARTITION_ID_LEN, self.id.as_bytes())
    }
}

// ── MBR ─────────────────────────────────────────────────────────────────────

/// Master boot record at offset 0 of every disk image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mbr {
    pub size: i32,
    pub created: f32,
    pub signature: i32,
    pub fit: u8,
    pub partitions: [Partition; MBR_PARTITION_SLOTS],
}

impl Mbr {
    #[must_use]
    pub fn new(size: i32, created: f32, signature: i32, fit: Fit) -> Self {
        Self {
            size,
            created,
            signature,
            fit: fit.code(),
            partitions: std::array::from_fn(|_| Partition::unset()),
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, MBR_FIELDS_SIZE)?;
        let mut partitions: [Partition; MBR_PARTITION_SLOTS] =
            std::array::from_fn(|_| Partition::unset());
        for (index, slot) in partitions.iter_mut().enumerate() {
            let at = 13 + index * PARTITION_SIZE;
            *slot = Partition::parse_from_bytes(ensure_slice(bytes, at, PARTITION_SIZE)?)?;
        }
        Ok(Self {
            size: read_le_i32(bytes, 0)?,
            created: read_le_f32(bytes, 4)?,
            signature: read_le_i32(bytes, 8)?,
            fit: read_u8(bytes, 12)?,
            partitions,
        })
    }

    /// Serialize into the full reserved header (`MBR_SIZE` bytes, zero tail).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = vec![0_u8; MBR_SIZE];
        write_le_i32(&mut out, 0, self.size)?;
        write_le_f32(&mut out, 4, self.created)?;
        write_le_i32(&mut out, 8, self.signature)?;
        write_u8(&mut out, 12, self.fit)?;
        for (index, part) in self.partitions.iter().enumerate() {
            let at = 13 + index * PARTITION_SIZE;
            part.write_into(&mut out[at..at + PARTITION_SIZE])?;
        }
        Ok(out)
    }

    /// Slot index of the partition named `name` (case-sensitive, live only).
    #[must_use]
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.partitions
            .iter()
            .position(|part| part.is_used() && part.name == name)
    }

    #[must_use]
    pub fn extended(&self) -> Option<&Partition> {
        self.partitions.iter().find(|part| part.is_extended())
    }
}

// ── EBR ─────────────────────────────────────────────────────────────────────

/// Extended boot record: one node of the logical-partition chain.
///
/// `start` is the offset of the logical partition's data, which begins right
/// after this 30-byte header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ebr {
    pub mount: u8,
    pub fit: u8,
    pub start: i32,
    pub size: i32,
    pub next: i32,
    pub name: String,
}

impl Ebr {
    /// An unused node whose header sits at `offset`.
    #[must_use]
    pub fn empty_at(offset: i32) -> Self {
        Self {
            mount: MOUNT_NO,
            fit: SLOT_UNSET,
            start: offset.saturating_add(EBR_LEN),
            size: -1,
            next: -1,
            name: String::new(),
        }
    }

    /// Whether this node currently holds a logical partition.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.size > 0 && !self.name.is_empty()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mount == MOUNT_YES
    }

    /// Offset of this node's own header.
    #[must_use]
    pub fn header_offset(&self) -> i64 {
        i64::from(self.start) - i64::from(EBR_LEN)
    }

    #[must_use]
    pub fn end(&self) -> i64 {
        i64::from(self.start) + i64::from(self.size.max(0))
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, EBR_SIZE)?;
        Ok(Self {
            mount: read_u8(bytes, 0)?,
            fit: read_u8(bytes, 1)?,
            start: read_le_i32(bytes, 2)?,
            size: read_le_i32(bytes, 6)?,
            next: read_le_i32(bytes, 10)?,
            name: trim_nul_padded(&read_fixed::<PARTITION_NAME_LEN>(bytes, 14)?),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; EBR_SIZE] {
        let mut out = [0_u8; EBR_SIZE];
        out[0] = self.mount;
        out[1] = self.fit;
        out[2..6].copy_from_slice(&self.start.to_le_bytes());
        out[6..10].copy_from_slice(&self.size.to_le_bytes());
        out[10..14].copy_from_slice(&self.next.to_le_bytes());
        let name = self.name.as_bytes();
        let n = name.len().min(PARTITION_NAME_LEN);
        out[14..14 + n].copy_from_slice(&name[..n]);
        out
    }
}
