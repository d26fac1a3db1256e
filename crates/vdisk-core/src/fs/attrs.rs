//! `chmod` and `chown`.
//!
//! The named path is always changed once the caller passes the top-level
//! check. Recursion only touches entries owned by the caller, or every entry
//! when the caller is the root user.

use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::Inode;
use vdisk_types::Permissions;

use super::context::FsContext;
use super::tree::TreeItem;
use crate::session::Actor;

impl FsContext<'_> {
    fn targets(&self, path: &str, recursive: bool) -> Result<Vec<TreeItem>> {
        let (ino, inode) = self.resolve(path)?;
        if recursive {
            self.subtree(ino, inode, path)
        } else {
            Ok(vec![TreeItem {
                ino,
                inode,
                path: path.to_owned(),
            }])
        }
    }

    fn apply(
        &self,
        actor: Actor,
        items: Vec<TreeItem>,
        mut change: impl FnMut(&mut Inode),
    ) -> Result<usize> {
        let now = Self::now();
        let mut changed = 0;
        for (index, item) in items.into_iter().enumerate() {
            if index > 0 && !actor.is_root() && item.inode.uid != actor.uid {
                continue;
            }
            let mut inode = item.inode;
            change(&mut inode);
            inode.ctime = now;
            self.put_inode(item.ino, &inode)?;
            changed += 1;
        }
        Ok(changed)
    }

    /// The caller has already been checked for the root group.
    pub(crate) fn chmod(
        &mut self,
        actor: Actor,
        path: &str,
        perm: Permissions,
        recursive: bool,
    ) -> Result<usize> {
        let items = self.targets(path, recursive)?;
        self.apply(actor, items, |inode| inode.perm = perm)
    }

    /// Give `path` to `uid`. The caller must be in the root group or own
    /// the path.
    pub(crate) fn chown(
        &mut self,
        actor: Actor,
        root_group: bool,
        path: &str,
        uid: i32,
        recursive: bool,
    ) -> Result<usize> {
        let items = self.targets(path, recursive)?;
        if let Some(top) = items.first() {
            if !root_group && top.inode.uid != actor.uid {
                return Err(VdiskError::PermissionDenied(format!(
                    "{path} is not owned by the caller"
                )));
            }
        }
        self.apply(actor, items, |inode| inode.uid = uid)
    }
}
