//! UGO permission checks.
//!
//! The class is picked first-match: owner when the uids match, else group
//! when the gids match, else other. Only that class's digit is consulted.
//! Read needs the 4 bit of that digit, write the 2 bit.

use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::Inode;
use vdisk_types::{PermClass, Permissions};

use crate::session::Actor;

#[must_use]
pub fn access_class(inode: &Inode, actor: Actor) -> PermClass {
    if inode.uid == actor.uid {
        PermClass::Owner
    } else if inode.gid == actor.gid {
        PermClass::Group
    } else {
        PermClass::Other
    }
}

#[must_use]
pub fn can_read(inode: &Inode, actor: Actor) -> bool {
    inode.perm.allows(access_class(inode, actor), Permissions::READ)
}

#[must_use]
pub fn can_write(inode: &Inode, actor: Actor) -> bool {
    inode.perm.allows(access_class(inode, actor), Permissions::WRITE)
}

pub(crate) fn require_read(inode: &Inode, actor: Actor, path: &str) -> Result<()> {
    if can_read(inode, actor) {
        Ok(())
    } else {
        Err(VdiskError::PermissionDenied(format!("read access to {path}")))
    }
}

pub(crate) fn require_write(inode: &Inode, actor: Actor, path: &str) -> Result<()> {
    if can_write(inode, actor) {
        Ok(())
    } else {
        Err(VdiskError::PermissionDenied(format!("write access to {path}")))
    }
}
