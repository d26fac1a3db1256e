//! Reading and editing file content.

use vdisk_error::{Result, VdiskError};
use vdisk_inode::{overwrite_content, read_content};

use super::context::FsContext;
use crate::perms::{require_read, require_write};
use crate::session::Actor;

impl FsContext<'_> {
    pub(crate) fn cat(&self, actor: Actor, path: &str) -> Result<Vec<u8>> {
        let (_, inode) = self.resolve(path)?;
        if !inode.is_file() {
            return Err(VdiskError::InvalidArgument(format!("{path} is not a file")));
        }
        require_read(&inode, actor, path)?;
        read_content(self.dev, &self.layout, &inode)
    }

    /// Overwrite a file in its existing blocks.
    pub(crate) fn edit(&mut self, actor: Actor, path: &str, content: &[u8]) -> Result<()> {
        let (ino, mut inode) = self.resolve(path)?;
        if !inode.is_file() {
            return Err(VdiskError::InvalidArgument(format!("{path} is not a file")));
        }
        require_read(&inode, actor, path)?;
        require_write(&inode, actor, path)?;
        overwrite_content(self.dev, &self.layout, &mut inode, content)?;
        inode.mtime = Self::now();
        self.put_inode(ino, &inode)
    }
}
