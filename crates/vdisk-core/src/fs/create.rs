//! Creating directories and files.

use tracing::{debug, warn};
use vdisk_alloc::{alloc_inode, free_inode};
use vdisk_dir::{add_entry, init_dir, validate_name};
use vdisk_error::{Result, VdiskError};
use vdisk_inode::{free_inode_blocks, write_content};
use vdisk_ondisk::Inode;
use vdisk_types::{InodeNumber, Permissions};

use super::context::FsContext;
use super::path::{join_path, split_path};
use crate::session::Actor;

impl FsContext<'_> {
    fn check_new_entry(&self, dir: &Inode, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.child(dir, name)?.is_some() {
            return Err(VdiskError::AlreadyExists(name.to_owned()));
        }
        Ok(())
    }

    /// Free whatever a half-built inode owns.
    fn discard(&mut self, ino: InodeNumber, inode: &mut Inode) {
        let freed = free_inode_blocks(self.dev, &self.layout, &mut self.sb, inode)
            .and_then(|()| free_inode(self.dev, &self.layout, &mut self.sb, ino));
        if let Err(err) = freed {
            warn!(inode = ino.0, error = %err, "rollback of a partial create failed");
        }
    }

    /// Link a freshly built inode into `parent` and write both, undoing the
    /// allocation on failure.
    fn link_new(
        &mut self,
        parent_ino: InodeNumber,
        parent: &mut Inode,
        name: &str,
        ino: InodeNumber,
        mut inode: Inode,
    ) -> Result<InodeNumber> {
        let linked = add_entry(self.dev, &self.layout, &mut self.sb, parent, name, ino)
            .and_then(|()| self.put_inode(ino, &inode));
        if let Err(err) = linked {
            self.discard(ino, &mut inode);
            return Err(err);
        }
        parent.mtime = Self::now();
        self.put_inode(parent_ino, parent)?;
        Ok(ino)
    }

    /// New directory `name` inside `parent`, owned by `actor`.
    pub(crate) fn create_dir_in(
        &mut self,
        actor: Actor,
        parent_ino: InodeNumber,
        parent: &mut Inode,
        name: &str,
        perm: Permissions,
    ) -> Result<InodeNumber> {
        self.check_new_entry(parent, name)?;
        let ino = alloc_inode(self.dev, &self.layout, &mut self.sb)?;
        let mut dir = Inode::new_dir(actor.uid, actor.gid, perm, Self::now());
        if let Err(err) = init_dir(self.dev, &self.layout, &mut self.sb, &mut dir, ino, parent_ino) {
            self.discard(ino, &mut dir);
            return Err(err);
        }
        debug!(name, inode = ino.0, "directory created");
        self.link_new(parent_ino, parent, name, ino, dir)
    }

    /// New file `name` inside `parent` holding `content`, owned by `actor`.
    pub(crate) fn create_file_in(
        &mut self,
        actor: Actor,
        parent_ino: InodeNumber,
        parent: &mut Inode,
        name: &str,
        content: &[u8],
        perm: Permissions,
    ) -> Result<InodeNumber> {
        self.check_new_entry(parent, name)?;
        let ino = alloc_inode(self.dev, &self.layout, &mut self.sb)?;
        let mut file = Inode::new_file(actor.uid, actor.gid, perm, Self::now());
        if let Err(err) = write_content(self.dev, &self.layout, &mut self.sb, &mut file, content) {
            self.discard(ino, &mut file);
            return Err(err);
        }
        debug!(name, inode = ino.0, bytes = content.len(), "file created");
        self.link_new(parent_ino, parent, name, ino, file)
    }

    /// Resolve the directory `components`, creating missing ones when
    /// `parents` is set. Each created directory needs write access on its
    /// parent.
    pub(crate) fn ensure_dirs(
        &mut self,
        actor: Actor,
        components: &[&str],
        parents: bool,
    ) -> Result<(InodeNumber, Inode)> {
        let mut ino = InodeNumber::ROOT;
        let mut dir = self.root()?;
        for (depth, name) in components.iter().enumerate() {
            let here = join_path(&components[..=depth]);
            (ino, dir) = match self.child(&dir, name)? {
                Some((next, inode)) if inode.is_dir() => (next, inode),
                Some(_) => {
                    return Err(VdiskError::InvalidArgument(format!(
                        "{here} is not a directory"
                    )));
                }
                None if parents => {
                    self.check_dir_write(&dir, actor, &join_path(&components[..depth]))?;
                    let next =
                        self.create_dir_in(actor, ino, &mut dir, name, Permissions::DEFAULT_FILE)?;
                    (next, self.inode(next)?)
                }
                None => return Err(VdiskError::NotFound(here)),
            };
        }
        Ok((ino, dir))
    }

    /// `mkdir`. The superblock is left for the caller to save.
    pub(crate) fn mkdir(&mut self, actor: Actor, path: &str, parents: bool) -> Result<InodeNumber> {
        let components = split_path(path)?;
        let Some((name, parent_components)) = components.split_last() else {
            return Err(VdiskError::AlreadyExists("/".into()));
        };
        let (parent_ino, mut parent) = self.ensure_dirs(actor, parent_components, parents)?;
        if self.child(&parent, name)?.is_some() {
            return Err(VdiskError::AlreadyExists(path.to_owned()));
        }
        self.check_dir_write(&parent, actor, &join_path(parent_components))?;
        self.create_dir_in(actor, parent_ino, &mut parent, name, Permissions::DEFAULT_FILE)
    }

    /// `mkfile`. The superblock is left for the caller to save.
    pub(crate) fn mkfile(
        &mut self,
        actor: Actor,
        path: &str,
        content: &[u8],
        parents: bool,
    ) -> Result<InodeNumber> {
        let components = split_path(path)?;
        let Some((name, parent_components)) = components.split_last() else {
            return Err(VdiskError::InvalidArgument("/ is a directory".into()));
        };
        let (parent_ino, mut parent) = self.ensure_dirs(actor, parent_components, parents)?;
        if self.child(&parent, name)?.is_some() {
            return Err(VdiskError::AlreadyExists(path.to_owned()));
        }
        self.check_dir_write(&parent, actor, &join_path(parent_components))?;
        self.create_file_in(
            actor,
            parent_ino,
            &mut parent,
            name,
            content,
            Permissions::DEFAULT_FILE,
        )
    }
}
