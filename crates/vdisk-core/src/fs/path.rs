//! Absolute path resolution from the root inode.

use tracing::debug;
use vdisk_dir::lookup;
use vdisk_error::{Result, VdiskError};
use vdisk_ondisk::Inode;
use vdisk_types::InodeNumber;

use super::context::FsContext;

/// Components of an absolute path; empty components are dropped, so `/`
/// yields none.
pub(crate) fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(VdiskError::InvalidArgument(format!(
            "path {path:?} is not absolute"
        )));
    }
    Ok(path.split('/').filter(|c| !c.is_empty()).collect())
}

pub(crate) fn join_path(components: &[&str]) -> String {
    format!("/{}", components.join("/"))
}

pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

impl FsContext<'_> {
    /// A live inode referenced by a directory entry.
    pub(crate) fn live_inode(&self, ino: InodeNumber) -> Result<Inode> {
        let inode = self.inode(ino)?;
        if !inode.is_valid() {
            return Err(VdiskError::Corruption {
                offset: self.layout.inode_offset(ino)?,
                detail: format!("directory entry points at unused inode {ino}"),
            });
        }
        Ok(inode)
    }

    pub(crate) fn root(&self) -> Result<Inode> {
        let root = self.inode(InodeNumber::ROOT)?;
        if !root.is_dir() {
            return Err(VdiskError::Corruption {
                offset: self.layout.inode_start,
                detail: "root directory is missing".into(),
            });
        }
        Ok(root)
    }

    /// Entry `name` of directory `dir`, if present.
    pub(crate) fn child(&self, dir: &Inode, name: &str) -> Result<Option<(InodeNumber, Inode)>> {
        match lookup(self.dev, &self.layout, dir, name)? {
            Some(ino) => Ok(Some((ino, self.live_inode(ino)?))),
            None => Ok(None),
        }
    }

    pub(crate) fn walk(&self, components: &[&str]) -> Result<(InodeNumber, Inode)> {
        let mut ino = InodeNumber::ROOT;
        let mut inode = self.root()?;
        for (depth, name) in components.iter().enumerate() {
            if !inode.is_dir() {
                return Err(VdiskError::InvalidArgument(format!(
                    "{} is not a directory",
                    join_path(&components[..depth])
                )));
            }
            (ino, inode) = self
                .child(&inode, name)?
                .ok_or_else(|| VdiskError::NotFound(join_path(&components[..=depth])))?;
        }
        debug!(path = %join_path(components), inode = ino.0, "path resolved");
        Ok((ino, inode))
    }

    pub(crate) fn resolve(&self, path: &str) -> Result<(InodeNumber, Inode)> {
        self.walk(&split_path(path)?)
    }

    /// Like [`FsContext::walk`], but the target must be a directory.
    pub(crate) fn walk_dir(&self, components: &[&str]) -> Result<(InodeNumber, Inode)> {
        let (ino, inode) = self.walk(components)?;
        if !inode.is_dir() {
            return Err(VdiskError::InvalidArgument(format!(
                "{} is not a directory",
                join_path(components)
            )));
        }
        Ok((ino, inode))
    }

    /// Parent directory and final component of a path other than `/`.
    pub(crate) fn parent_of<'p>(
        &self,
        components: &[&'p str],
    ) -> Result<(InodeNumber, Inode, &'p str)> {
        let Some((name, parent)) = components.split_last() else {
            return Err(VdiskError::InvalidArgument(
                "the root directory cannot be used here".into(),
            ));
        };
        let (ino, inode) = self.walk_dir(parent)?;
        Ok((ino, inode, name))
    }
}
