//! Directory and file operations on a mounted partition.
//!
//! [`Filesystem`] is a cheap handle over a [`MountedPartition`]. Every call
//! loads the superblock, performs one operation under the partition's lock
//! and writes the superblock back before the lock is released. Mutations
//! are journaled on ext3 after they are applied.

pub(crate) mod context;

mod accounts;
mod attrs;
mod content;
mod create;
mod listing;
mod path;
mod tree;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use vdisk_alloc::{read_block_bitmap, read_inode_bitmap};
use vdisk_error::{Result, VdiskError};
use vdisk_journal::JournalOp;
use vdisk_ondisk::{Inode, JournalEntry, SuperBlock};
use vdisk_types::{InodeNumber, Permissions};

use crate::mkfs::{self, FormatOptions};
use crate::mount::{MountId, MountedPartition};
use crate::recovery::{self, LossReport, RecoveryReport};
use crate::session::{Actor, Session};
use crate::users::UsersFile;
use crate::parse_permissions;

use self::context::FsContext;

// ── Public value types ──────────────────────────────────────────────────────

/// Source of a new file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileContent {
    /// Exactly these bytes.
    Bytes(Vec<u8>),
    /// `n` NUL bytes.
    Zeroed(usize),
}

impl FileContent {
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Zeroed(len) => vec![0; len],
        }
    }

    /// Text stored in the journal for this content.
    fn journal_text(&self) -> String {
        match self {
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Zeroed(_) => String::new(),
        }
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        Self::Bytes(text.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Directory,
    File,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Directory => "dir",
            Self::File => "file",
        })
    }
}

/// One directory entry with its inode metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub inode: InodeNumber,
    pub file_type: FileType,
    pub size: i32,
    pub uid: i32,
    pub gid: i32,
    pub perm: String,
    pub atime: f32,
    pub ctime: f32,
    pub mtime: f32,
}

impl EntryInfo {
    pub(crate) fn new(name: &str, ino: InodeNumber, inode: &Inode) -> Self {
        Self {
            name: name.to_owned(),
            inode: ino,
            file_type: if inode.is_dir() {
                FileType::Directory
            } else {
                FileType::File
            },
            size: inode.size,
            uid: inode.uid,
            gid: inode.gid,
            perm: inode.perm.to_string(),
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
        }
    }
}

/// A directory subtree as returned by `tree`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub entry: EntryInfo,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Paths of this node and every descendant, pre-order.
    #[must_use]
    pub fn paths(&self, base: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(base, &mut out);
        out
    }

    fn collect_paths(&self, path: &str, out: &mut Vec<String>) {
        out.push(path.to_owned());
        for child in &self.children {
            child.collect_paths(&path::child_path(path, &child.entry.name), out);
        }
    }
}

/// Outcome of `copy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyReport {
    /// Destination paths created.
    pub copied: Vec<String>,
    /// Source paths left behind: unreadable, or a file already present at
    /// the destination.
    pub skipped: Vec<String>,
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// Operations on one mounted partition.
#[derive(Debug, Clone)]
pub struct Filesystem {
    mount: Arc<MountedPartition>,
}

impl Filesystem {
    #[must_use]
    pub fn new(mount: Arc<MountedPartition>) -> Self {
        Self { mount }
    }

    #[must_use]
    pub fn mount_id(&self) -> MountId {
        self.mount.id()
    }

    fn read<T>(&self, f: impl FnOnce(&FsContext<'_>) -> Result<T>) -> Result<T> {
        let start = self.mount.info().start;
        self.mount.with_read(|dev| {
            let ctx = FsContext::load(dev, start)?;
            f(&ctx)
        })
    }

    fn write<T>(&self, f: impl FnOnce(&mut FsContext<'_>) -> Result<T>) -> Result<T> {
        let start = self.mount.info().start;
        self.mount.with_write(|dev| {
            let mut ctx = FsContext::load(dev, start)?;
            let out = f(&mut ctx);
            if out.is_err() {
                if let Err(err) = ctx.settle_counts() {
                    warn!(error = %err, "superblock counters not resynced after a failed operation");
                }
            }
            out
        })
    }

    /// The session must belong to this partition.
    fn actor(&self, session: &Session) -> Result<Actor> {
        let id = self.mount_id();
        if session.mount_id != id {
            return Err(VdiskError::InvalidArgument(format!(
                "session belongs to {}, not {id}",
                session.mount_id
            )));
        }
        Ok(session.actor())
    }

    fn root_group(&self, session: &Session, what: &str) -> Result<Actor> {
        let actor = self.actor(session)?;
        if !session.is_root_group() {
            return Err(VdiskError::PermissionDenied(format!(
                "{what} requires the root group"
            )));
        }
        Ok(actor)
    }

    // ── Format and raw views ────────────────────────────────────────────────

    /// `mkfs`: format the whole partition.
    pub fn format(&self, options: FormatOptions) -> Result<SuperBlock> {
        let info = self.mount.info();
        let sb = self
            .mount
            .with_write(|dev| mkfs::format(dev, info.start, info.size, options))?;
        info!(mount_id = %info.id, journaled = options.journaled, "mkfs");
        Ok(sb)
    }

    pub fn superblock(&self) -> Result<SuperBlock> {
        self.read(|ctx| Ok(ctx.sb.clone()))
    }

    /// Raw inode bitmap bytes (`'1'` used).
    pub fn inode_bitmap(&self) -> Result<Vec<u8>> {
        self.read(|ctx| read_inode_bitmap(ctx.dev, &ctx.layout))
    }

    /// Raw block bitmap bytes (`'X'` used).
    pub fn block_bitmap(&self) -> Result<Vec<u8>> {
        self.read(|ctx| read_block_bitmap(ctx.dev, &ctx.layout))
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<Inode> {
        self.read(|ctx| ctx.inode(ino))
    }

    // ── Users and groups ────────────────────────────────────────────────────

    /// Check credentials against `users.txt` and open a session.
    pub fn login(&self, user: &str, password: &str) -> Result<Session> {
        let users = self.read(|ctx| ctx.load_users())?;
        let (uid, group, stored) = users
            .user(user)
            .ok_or_else(|| VdiskError::NotFound(format!("user {user}")))?;
        if stored != password {
            return Err(VdiskError::PermissionDenied(format!(
                "wrong password for {user}"
            )));
        }
        let gid = users
            .group_id(group)
            .ok_or_else(|| VdiskError::NotFound(format!("group {group}")))?;
        let session = Session {
            mount_id: self.mount_id(),
            user: user.to_owned(),
            group: group.to_owned(),
            uid,
            gid,
        };
        info!(user, mount_id = %session.mount_id, "login");
        Ok(session)
    }

    pub fn users(&self) -> Result<UsersFile> {
        self.read(|ctx| ctx.load_users())
    }

    pub fn mkgrp(&self, session: &Session, name: &str) -> Result<i32> {
        self.root_group(session, "mkgrp")?;
        self.write(|ctx| ctx.update_users(|users| users.add_group(name)))
    }

    pub fn rmgrp(&self, session: &Session, name: &str) -> Result<()> {
        self.root_group(session, "rmgrp")?;
        self.write(|ctx| ctx.update_users(|users| users.remove_group(name)))
    }

    pub fn mkusr(&self, session: &Session, user: &str, password: &str, group: &str) -> Result<i32> {
        self.root_group(session, "mkusr")?;
        self.write(|ctx| ctx.update_users(|users| users.add_user(user, password, group)))
    }

    pub fn rmusr(&self, session: &Session, user: &str) -> Result<()> {
        self.root_group(session, "rmusr")?;
        self.write(|ctx| ctx.update_users(|users| users.remove_user(user)))
    }

    /// Move `user` into `group`.
    pub fn chgrp(&self, session: &Session, user: &str, group: &str) -> Result<()> {
        self.root_group(session, "chgrp")?;
        self.write(|ctx| ctx.update_users(|users| users.set_user_group(user, group)))
    }

    // ── Directories and files ───────────────────────────────────────────────

    /// Create a directory; with `parents`, missing ancestors are created too.
    pub fn mkdir(&self, session: &Session, path: &str, parents: bool) -> Result<InodeNumber> {
        let actor = self.actor(session)?;
        self.write(|ctx| {
            let ino = ctx.mkdir(actor, path, parents)?;
            ctx.save_superblock()?;
            ctx.record(JournalOp::Mkdir, path, "");
            Ok(ino)
        })
    }

    pub fn mkfile(
        &self,
        session: &Session,
        path: &str,
        content: FileContent,
        parents: bool,
    ) -> Result<InodeNumber> {
        let actor = self.actor(session)?;
        self.write(|ctx| {
            let text = content.journal_text();
            let ino = ctx.mkfile(actor, path, &content.into_bytes(), parents)?;
            ctx.save_superblock()?;
            ctx.record(JournalOp::Mkfile, path, &text);
            Ok(ino)
        })
    }

    pub fn cat(&self, session: &Session, path: &str) -> Result<Vec<u8>> {
        let actor = self.actor(session)?;
        self.read(|ctx| ctx.cat(actor, path))
    }

    /// Replace a file's content in place. The file never gains blocks.
    pub fn edit(&self, session: &Session, path: &str, content: &[u8]) -> Result<()> {
        let actor = self.actor(session)?;
        self.write(|ctx| {
            ctx.edit(actor, path, content)?;
            ctx.record(JournalOp::Edit, path, &String::from_utf8_lossy(content));
            Ok(())
        })
    }

    pub fn rename(&self, session: &Session, path: &str, new_name: &str) -> Result<()> {
        let actor = self.actor(session)?;
        self.write(|ctx| {
            ctx.rename(actor, path, new_name)?;
            ctx.record(JournalOp::Rename, path, new_name);
            Ok(())
        })
    }

    /// Remove a file or a whole directory tree.
    ///
    /// Write permission is checked on every entry before anything is freed.
    pub fn remove(&self, session: &Session, path: &str) -> Result<()> {
        let actor = self.actor(session)?;
        self.write(|ctx| {
            ctx.remove(actor, path)?;
            ctx.save_superblock()?;
            ctx.record(JournalOp::Remove, path, "");
            Ok(())
        })
    }

    /// Copy `src` into the directory `dst`, merging into directories that
    /// already exist there.
    pub fn copy(&self, session: &Session, src: &str, dst: &str) -> Result<CopyReport> {
        let actor = self.actor(session)?;
        self.write(|ctx| {
            let report = ctx.copy(actor, src, dst)?;
            ctx.save_superblock()?;
            ctx.record(JournalOp::Copy, src, dst);
            Ok(report)
        })
    }

    /// Move `src` into the directory `dst` (copy, then remove the source).
    pub fn mv(&self, session: &Session, src: &str, dst: &str) -> Result<()> {
        let actor = self.actor(session)?;
        self.write(|ctx| {
            ctx.move_tree(actor, src, dst)?;
            ctx.save_superblock()?;
            ctx.record(JournalOp::Move, src, dst);
            Ok(())
        })
    }

    /// Set permissions; returns how many inodes changed.
    pub fn chmod(&self, session: &Session, path: &str, perm: &str, recursive: bool) -> Result<usize> {
        let actor = self.root_group(session, "chmod")?;
        let perm: Permissions = parse_permissions(perm)?;
        self.write(|ctx| {
            let changed = ctx.chmod(actor, path, perm, recursive)?;
            ctx.record(JournalOp::Chmod, path, &perm.to_string());
            Ok(changed)
        })
    }

    /// Hand `path` to `user`; returns how many inodes changed.
    pub fn chown(&self, session: &Session, path: &str, user: &str, recursive: bool) -> Result<usize> {
        let actor = self.actor(session)?;
        let root_group = session.is_root_group();
        self.write(|ctx| {
            let (uid, _, _) = ctx
                .load_users()?
                .user(user)
                .ok_or_else(|| VdiskError::NotFound(format!("user {user}")))?;
            let changed = ctx.chown(actor, root_group, path, uid, recursive)?;
            ctx.record(JournalOp::Chown, path, user);
            Ok(changed)
        })
    }

    // ── Listing ─────────────────────────────────────────────────────────────

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.read(|ctx| match ctx.resolve(path) {
            Ok(_) => Ok(true),
            Err(VdiskError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        })
    }

    pub fn ls(&self, session: &Session, path: &str) -> Result<Vec<EntryInfo>> {
        let actor = self.actor(session)?;
        self.read(|ctx| ctx.ls(actor, path))
    }

    pub fn tree(&self, session: &Session, path: &str) -> Result<TreeNode> {
        let actor = self.actor(session)?;
        self.read(|ctx| ctx.tree(actor, path))
    }

    /// Paths under `path` whose name matches `pattern` (`*` and `?`).
    pub fn find(&self, session: &Session, path: &str, pattern: &str) -> Result<Vec<String>> {
        let actor = self.actor(session)?;
        self.read(|ctx| ctx.find(actor, path, pattern))
    }

    // ── Journal ─────────────────────────────────────────────────────────────

    /// Journal entries in log order. Ext3 only.
    pub fn journaling(&self) -> Result<Vec<JournalEntry>> {
        self.read(|ctx| ctx.journal()?.entries(ctx.dev))
    }

    /// Zero the bitmaps and both tables, keeping the superblock and journal.
    pub fn loss(&self) -> Result<LossReport> {
        let report = self.write(|ctx| recovery::simulate_loss(ctx))?;
        info!(mount_id = %self.mount_id(), bytes = report.total_bytes(), "metadata loss simulated");
        Ok(report)
    }

    /// Rebuild the filesystem by replaying the journal.
    pub fn recovery(&self) -> Result<RecoveryReport> {
        let report = self.write(|ctx| recovery::recover(ctx))?;
        info!(
            mount_id = %self.mount_id(),
            replayed = report.replayed,
            failed = report.failures.len(),
            "recovery finished"
        );
        Ok(report)
    }
}
