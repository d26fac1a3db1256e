//! Walking and rewriting the logical-partition chain.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use vdisk_block::{ByteDevice, read_record};
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::{Ebr, Partition};
use vdisk_types::EBR_SIZE;

use crate::disk::device_offset;

/// One EBR together with the offset of its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbrNode {
    pub offset: u64,
    pub ebr: Ebr,
}

pub fn read_ebr(dev: &dyn ByteDevice, offset: u64) -> Result<Ebr> {
    read_record(dev, offset, EBR_SIZE, Ebr::parse_from_bytes)
}

pub fn write_ebr(dev: &dyn ByteDevice, offset: u64, ebr: &Ebr) -> Result<()> {
    dev.write_all_at(offset, &ebr.to_bytes())
}

/// Every node of the chain rooted at `extended.start`, in link order.
///
/// Links that leave the extended partition or revisit a node are reported
/// as corruption instead of being followed.
pub fn ebr_chain(dev: &dyn ByteDevice, extended: &Partition) -> Result<Vec<EbrNode>> {
    let lower = i64::from(extended.start);
    let upper = extended.end();
    let header = i64::try_from(EBR_SIZE).unwrap_or(i64::MAX);

    let mut nodes = Vec::new();
    let mut visited = HashSet::new();
    let mut at = lower;
    loop {
        if at < lower || at.saturating_add(header) > upper {
            return Err(VdiskError::Corruption {
                offset: device_offset(at.max(0))?,
                detail: format!("EBR link {at} leaves extended partition {}", extended.name),
            });
        }
        if !visited.insert(at) {
            return Err(VdiskError::Corruption {
                offset: device_offset(at)?,
                detail: "EBR chain loops back on itself".into(),
            });
        }
        let offset = device_offset(at)?;
        let ebr = read_ebr(dev, offset)?;
        let next = ebr.next;
        nodes.push(EbrNode { offset, ebr });
        if next < 0 {
            return Ok(nodes);
        }
        at = i64::from(next);
    }
}
