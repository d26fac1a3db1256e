//! Whole-subtree operations: remove, rename, copy and move.
//!
//! Every walk carries a visited set of inode numbers, so a corrupt entry
//! that points back up the tree is seen once and never followed again.

use std::collections::HashSet;
use vdisk_alloc::free_inode;
use vdisk_dir::{list_entries, lookup, remove_entry, rename_entry};
use vdisk_error::{Result, VdiskError};
use vdisk_inode::{free_inode_blocks, read_content};
use vdisk_ondisk::Inode;
use vdisk_types::InodeNumber;

use super::CopyReport;
use super::context::FsContext;
use super::path::{child_path, split_path};
use crate::perms::{can_read, require_read, require_write};
use crate::session::Actor;

/// One inode of a subtree listing.
#[derive(Debug, Clone)]
pub(crate) struct TreeItem {
    pub(crate) ino: InodeNumber,
    pub(crate) inode: Inode,
    pub(crate) path: String,
}

fn protect_bootstrap(ino: InodeNumber, path: &str) -> Result<()> {
    if ino == InodeNumber::ROOT || ino == InodeNumber::USERS {
        return Err(VdiskError::InvalidArgument(format!(
            "{path} cannot be removed, renamed or moved"
        )));
    }
    Ok(())
}

impl FsContext<'_> {
    /// Pre-order listing of the subtree at `ino`, each inode once.
    pub(crate) fn subtree(&self, ino: InodeNumber, inode: Inode, path: &str) -> Result<Vec<TreeItem>> {
        let mut visited = HashSet::new();
        let mut items = Vec::new();
        let mut stack = vec![TreeItem {
            ino,
            inode,
            path: path.to_owned(),
        }];
        while let Some(item) = stack.pop() {
            if !visited.insert(item.ino) {
                continue;
            }
            if item.inode.is_dir() {
                let entries = list_entries(self.dev, &self.layout, &item.inode)?;
                for entry in entries.iter().rev() {
                    let Some(child) = InodeNumber::from_slot(entry.inode) else {
                        continue;
                    };
                    if visited.contains(&child) {
                        continue;
                    }
                    stack.push(TreeItem {
                        ino: child,
                        inode: self.live_inode(child)?,
                        path: child_path(&item.path, &entry.name),
                    });
                }
            }
            items.push(item);
        }
        Ok(items)
    }

    /// Whether `ino` is `ancestor` or lies below it, following `..` links.
    fn is_within(&self, ino: InodeNumber, ancestor: InodeNumber) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut current = ino;
        loop {
            if current == ancestor {
                return Ok(true);
            }
            if current == InodeNumber::ROOT || !visited.insert(current) {
                return Ok(false);
            }
            let inode = self.live_inode(current)?;
            match lookup(self.dev, &self.layout, &inode, "..")? {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    // ── remove ──────────────────────────────────────────────────────────────

    /// Unlink `name` from `parent` and free its whole subtree, after write
    /// access has been confirmed on every inode in it.
    fn remove_tree(
        &mut self,
        actor: Actor,
        parent_ino: InodeNumber,
        parent: &mut Inode,
        name: &str,
        item: TreeItem,
    ) -> Result<()> {
        let items = self.subtree(item.ino, item.inode, &item.path)?;
        for item in &items {
            require_write(&item.inode, actor, &item.path)?;
        }
        remove_entry(self.dev, &self.layout, parent, name)?;
        for item in items.into_iter().rev() {
            let mut inode = item.inode;
            free_inode_blocks(self.dev, &self.layout, &mut self.sb, &mut inode)?;
            free_inode(self.dev, &self.layout, &mut self.sb, item.ino)?;
        }
        parent.mtime = Self::now();
        self.put_inode(parent_ino, parent)
    }

    pub(crate) fn remove(&mut self, actor: Actor, path: &str) -> Result<()> {
        let components = split_path(path)?;
        let (parent_ino, mut parent, name) = self.parent_of(&components)?;
        let (ino, inode) = self
            .child(&parent, name)?
            .ok_or_else(|| VdiskError::NotFound(path.to_owned()))?;
        protect_bootstrap(ino, path)?;
        let item = TreeItem {
            ino,
            inode,
            path: path.to_owned(),
        };
        self.remove_tree(actor, parent_ino, &mut parent, name, item)
    }

    // ── rename ──────────────────────────────────────────────────────────────

    pub(crate) fn rename(&mut self, actor: Actor, path: &str, new_name: &str) -> Result<()> {
        let components = split_path(path)?;
        let (_, parent, name) = self.parent_of(&components)?;
        let (ino, inode) = self
            .child(&parent, name)?
            .ok_or_else(|| VdiskError::NotFound(path.to_owned()))?;
        protect_bootstrap(ino, path)?;
        require_write(&inode, actor, path)?;
        rename_entry(self.dev, &self.layout, &parent, name, new_name)
    }

    // ── copy ────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn copy_node(
        &mut self,
        actor: Actor,
        source: &TreeItem,
        dst_ino: InodeNumber,
        dst: &mut Inode,
        dst_path: &str,
        name: &str,
        visited: &mut HashSet<InodeNumber>,
        report: &mut CopyReport,
    ) -> Result<()> {
        if !visited.insert(source.ino) {
            return Ok(());
        }
        if !can_read(&source.inode, actor) {
            report.skipped.push(source.path.clone());
            return Ok(());
        }
        let target_path = child_path(dst_path, name);
        let existing = self.child(dst, name)?;

        if source.inode.is_file() {
            if existing.is_some() {
                report.skipped.push(source.path.clone());
                return Ok(());
            }
            let content = read_content(self.dev, &self.layout, &source.inode)?;
            self.create_file_in(actor, dst_ino, dst, name, &content, source.inode.perm)?;
            report.copied.push(target_path);
            return Ok(());
        }

        let (target_ino, mut target) = match existing {
            Some((ino, inode)) if inode.is_dir() && ino != source.ino => (ino, inode),
            Some(_) => {
                report.skipped.push(source.path.clone());
                return Ok(());
            }
            None => {
                let ino = self.create_dir_in(actor, dst_ino, dst, name, source.inode.perm)?;
                report.copied.push(target_path.clone());
                (ino, self.inode(ino)?)
            }
        };
        for entry in list_entries(self.dev, &self.layout, &source.inode)? {
            let Some(child) = InodeNumber::from_slot(entry.inode) else {
                continue;
            };
            let child_item = TreeItem {
                ino: child,
                inode: self.live_inode(child)?,
                path: child_path(&source.path, &entry.name),
            };
            self.copy_node(
                actor,
                &child_item,
                target_ino,
                &mut target,
                &target_path,
                &entry.name,
                visited,
                report,
            )?;
        }
        Ok(())
    }

    /// Copy `src` into the directory `dst`. Unreadable entries below `src`
    /// are skipped and reported; `src` itself must be readable.
    pub(crate) fn copy(&mut self, actor: Actor, src: &str, dst: &str) -> Result<CopyReport> {
        let src_components = split_path(src)?;
        let Some(name) = src_components.last() else {
            return Err(VdiskError::InvalidArgument("/ cannot be copied".into()));
        };
        let (src_ino, src_inode) = self.walk(&src_components)?;
        require_read(&src_inode, actor, src)?;
        let (dst_ino, mut dst_inode) = self.walk_dir(&split_path(dst)?)?;
        require_write(&dst_inode, actor, dst)?;
        if src_inode.is_dir() && self.is_within(dst_ino, src_ino)? {
            return Err(VdiskError::InvalidArgument(format!(
                "cannot copy {src} into itself"
            )));
        }

        let source = TreeItem {
            ino: src_ino,
            inode: src_inode,
            path: src.to_owned(),
        };
        let mut report = CopyReport::default();
        let mut visited = HashSet::new();
        self.copy_node(
            actor,
            &source,
            dst_ino,
            &mut dst_inode,
            dst,
            name,
            &mut visited,
            &mut report,
        )?;
        Ok(report)
    }

    // ── move ────────────────────────────────────────────────────────────────

    /// First path below `dst` that would block merging `source` into it: a
    /// file where anything already exists, or a directory where a file does.
    fn move_conflict(
        &self,
        source: &TreeItem,
        dst: &Inode,
        name: &str,
        visited: &mut HashSet<InodeNumber>,
    ) -> Result<Option<String>> {
        if !visited.insert(source.ino) {
            return Ok(None);
        }
        let Some((_, existing)) = self.child(dst, name)? else {
            return Ok(None);
        };
        if source.inode.is_file() || existing.is_file() {
            return Ok(Some(source.path.clone()));
        }
        for entry in list_entries(self.dev, &self.layout, &source.inode)? {
            let Some(child) = InodeNumber::from_slot(entry.inode) else {
                continue;
            };
            let child_item = TreeItem {
                ino: child,
                inode: self.live_inode(child)?,
                path: child_path(&source.path, &entry.name),
            };
            if let Some(path) = self.move_conflict(&child_item, &existing, &entry.name, visited)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Copy `src` into `dst`, then remove it. Read and write access on the
    /// whole source tree and a conflict-free destination are checked first,
    /// so nothing is left half-moved by a permission or name failure.
    pub(crate) fn move_tree(&mut self, actor: Actor, src: &str, dst: &str) -> Result<()> {
        let components = split_path(src)?;
        let (parent_ino, mut parent, name) = self.parent_of(&components)?;
        let (ino, inode) = self
            .child(&parent, name)?
            .ok_or_else(|| VdiskError::NotFound(src.to_owned()))?;
        protect_bootstrap(ino, src)?;
        let (dst_ino, dst_inode) = self.walk_dir(&split_path(dst)?)?;
        if dst_ino == parent_ino {
            return Err(VdiskError::AlreadyExists(format!("{src} is already in {dst}")));
        }

        let source = TreeItem {
            ino,
            inode: inode.clone(),
            path: src.to_owned(),
        };
        for item in self.subtree(ino, inode, src)? {
            require_read(&item.inode, actor, &item.path)?;
            require_write(&item.inode, actor, &item.path)?;
        }
        if let Some(path) = self.move_conflict(&source, &dst_inode, name, &mut HashSet::new())? {
            return Err(VdiskError::AlreadyExists(format!(
                "{path} collides with an entry in {dst}"
            )));
        }

        self.copy(actor, src, dst)?;
        self.remove_tree(actor, parent_ino, &mut parent, name, source)
    }
}
