//! `users.txt` access.

use vdisk_error::{Result, VdiskError};
use vdisk_inode::{read_content, replace_content};
use vdisk_ondisk::Inode;
use vdisk_types::InodeNumber;

use super::context::FsContext;
use crate::mkfs::USERS_FILE;
use crate::users::UsersFile;

impl FsContext<'_> {
    fn users_inode(&self) -> Result<(InodeNumber, Inode)> {
        let root = self.root()?;
        self.child(&root, USERS_FILE)?
            .filter(|(_, inode)| inode.is_file())
            .ok_or_else(|| VdiskError::Corruption {
                offset: self.layout.inode_start,
                detail: format!("{USERS_FILE} is missing"),
            })
    }

    fn parse_users(&self, inode: &Inode) -> Result<UsersFile> {
        let bytes = read_content(self.dev, &self.layout, inode)?;
        UsersFile::parse(&String::from_utf8_lossy(&bytes))
    }

    pub(crate) fn load_users(&self) -> Result<UsersFile> {
        let (_, inode) = self.users_inode()?;
        self.parse_users(&inode)
    }

    /// Apply `change` to `users.txt` and rewrite the file, which may grow.
    pub(crate) fn update_users<T>(
        &mut self,
        change: impl FnOnce(&mut UsersFile) -> Result<T>,
    ) -> Result<T> {
        let (ino, mut inode) = self.users_inode()?;
        let mut users = self.parse_users(&inode)?;
        let out = change(&mut users)?;
        replace_content(
            self.dev,
            &self.layout,
            &mut self.sb,
            &mut inode,
            users.render().as_bytes(),
        )?;
        inode.mtime = Self::now();
        self.put_inode(ino, &inode)?;
        self.save_superblock()?;
        Ok(out)
    }
}
