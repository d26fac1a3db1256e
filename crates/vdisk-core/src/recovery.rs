//! Metadata loss simulation and journal replay.
//!
//! Loss zero-fills both bitmaps and both tables; the superblock and the
//! journal survive. Recovery rebuilds the tree from the journal in four
//! phases:
//!
//! 0. recreate the root directory and `users.txt` if they are gone;
//! 1. replay every `mkdir` in log order, creating parents as needed;
//! 2. create the parent directories of every `mkfile`;
//! 3. replay `mkfile` and `edit` in log order with their recorded content.
//!
//! `remove` is never replayed, so recovery only ever restores. `rename`,
//! `copy`, `move`, `chmod` and `chown` are accepted but not replayed.
//! Replayed objects belong to the root user; the journal keeps no owners.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};
use vdisk_alloc::{claim_inode, init_bitmaps, sync_counts};
use vdisk_dir::{add_entry, lookup, remove_entry};
use vdisk_error::{Result, VdiskError};
use vdisk_inode::{free_inode_blocks, replace_content, write_content};
use vdisk_journal::JournalOp;
use vdisk_ondisk::{Inode, JournalEntry};
use vdisk_types::{BLOCK_SIZE, INODE_SIZE, InodeNumber, Permissions, ROOT_GID, ROOT_UID};

use crate::fs::context::FsContext;
use crate::mkfs::{USERS_FILE, bootstrap};
use crate::session::Actor;
use crate::users::UsersFile;

// ── Reports ─────────────────────────────────────────────────────────────────

/// One region wiped by `loss`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroedRegion {
    pub name: String,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossReport {
    pub regions: Vec<ZeroedRegion>,
}

impl LossReport {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.len).sum()
    }
}

impl fmt::Display for LossReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for region in &self.regions {
            writeln!(
                f,
                "zeroed {}: {} bytes at offset {}",
                region.name, region.len, region.offset
            )?;
        }
        write!(f, "total: {} bytes", self.total_bytes())
    }
}

/// A journal entry that could not be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFailure {
    pub seq: i32,
    pub op: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Entries found in the journal.
    pub entries: usize,
    /// Entries applied (or found already applied).
    pub replayed: usize,
    /// Entries of operations that are not replayed.
    pub skipped: usize,
    /// Whether the root directory and `users.txt` had to be recreated.
    pub bootstrapped: bool,
    pub failures: Vec<ReplayFailure>,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "journal entries: {}, replayed: {}, skipped: {}, failed: {}",
            self.entries,
            self.replayed,
            self.skipped,
            self.failures.len()
        )?;
        if self.bootstrapped {
            write!(f, "\nroot directory and {USERS_FILE} recreated")?;
        }
        for failure in &self.failures {
            write!(
                f,
                "\n  #{} {} {}: {}",
                failure.seq, failure.op, failure.path, failure.error
            )?;
        }
        Ok(())
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

pub(crate) fn simulate_loss(ctx: &mut FsContext<'_>) -> Result<LossReport> {
    ctx.journal()?;
    let layout = ctx.layout;
    let inodes = u64::from(layout.inode_count);
    let blocks = u64::from(layout.block_count);
    let regions = [
        ("inode bitmap", layout.bm_inode_start, inodes),
        ("block bitmap", layout.bm_block_start, blocks),
        ("inode table", layout.inode_start, inodes * INODE_SIZE as u64),
        ("block table", layout.block_start, blocks * BLOCK_SIZE as u64),
    ];
    let mut report = LossReport::default();
    for (name, offset, len) in regions {
        ctx.dev.zero_range(offset, len)?;
        debug!(region = name, offset, len, "region zeroed");
        report.regions.push(ZeroedRegion {
            name: name.to_owned(),
            offset,
            len,
        });
    }
    Ok(report)
}

// ── Replay ──────────────────────────────────────────────────────────────────

fn parent_components(path: &str) -> Option<Vec<&str>> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    match components.split_last() {
        Some((_, parent)) if !parent.is_empty() => Some(parent.to_vec()),
        _ => None,
    }
}

/// Rebuild `users.txt` at its bootstrap inode under an intact root.
fn restore_users(ctx: &mut FsContext<'_>) -> Result<()> {
    let mut root = ctx.root()?;
    if lookup(ctx.dev, &ctx.layout, &root, USERS_FILE)?.is_some() {
        remove_entry(ctx.dev, &ctx.layout, &root, USERS_FILE)?;
    }
    let mut old = ctx.inode(InodeNumber::USERS)?;
    if old.is_valid() {
        if let Err(err) = free_inode_blocks(ctx.dev, &ctx.layout, &mut ctx.sb, &mut old) {
            warn!(error = %err, "blocks of the damaged users.txt were not freed");
        }
    }
    claim_inode(ctx.dev, &ctx.layout, &mut ctx.sb, InodeNumber::USERS)?;

    let mut users = Inode::new_file(ROOT_UID, ROOT_GID, Permissions::DEFAULT_FILE, FsContext::now());
    write_content(
        ctx.dev,
        &ctx.layout,
        &mut ctx.sb,
        &mut users,
        UsersFile::BOOTSTRAP.as_bytes(),
    )?;
    ctx.put_inode(InodeNumber::USERS, &users)?;
    add_entry(
        ctx.dev,
        &ctx.layout,
        &mut ctx.sb,
        &mut root,
        USERS_FILE,
        InodeNumber::USERS,
    )?;
    ctx.put_inode(InodeNumber::ROOT, &root)
}

/// Write `content` to `path`, creating the file when it is missing.
fn replay_content(ctx: &mut FsContext<'_>, path: &str, content: &[u8]) -> Result<()> {
    match ctx.resolve(path) {
        Ok((ino, mut inode)) if inode.is_file() => {
            replace_content(ctx.dev, &ctx.layout, &mut ctx.sb, &mut inode, content)?;
            inode.mtime = FsContext::now();
            ctx.put_inode(ino, &inode)
        }
        Ok(_) => Err(VdiskError::InvalidArgument(format!("{path} is a directory"))),
        Err(VdiskError::NotFound(_)) => ctx.mkfile(Actor::ROOT, path, content, true).map(|_| ()),
        Err(err) => Err(err),
    }
}

fn note_failure(report: &mut RecoveryReport, entry: &JournalEntry, err: &VdiskError) {
    warn!(seq = entry.count, op = %entry.op, path = %entry.path, error = %err, "replay step failed");
    report.failures.push(ReplayFailure {
        seq: entry.count,
        op: entry.op.clone(),
        path: entry.path.clone(),
        error: err.to_string(),
    });
}

pub(crate) fn recover(ctx: &mut FsContext<'_>) -> Result<RecoveryReport> {
    let entries = ctx.journal()?.entries(ctx.dev)?;
    ctx.begin_replay();
    let mut report = RecoveryReport {
        entries: entries.len(),
        ..RecoveryReport::default()
    };

    // Phase 0: every later step resolves paths from the root.
    let root_ok = ctx.inode(InodeNumber::ROOT).is_ok_and(|root| root.is_dir());
    if root_ok {
        if ctx.load_users().is_err() {
            restore_users(ctx)?;
            info!("users.txt recreated");
        }
    } else {
        init_bitmaps(ctx.dev, &ctx.layout)?;
        sync_counts(ctx.dev, &ctx.layout, &mut ctx.sb)?;
        bootstrap(ctx)?;
        report.bootstrapped = true;
        info!("root directory recreated");
    }

    let ops: Vec<Option<JournalOp>> = entries
        .iter()
        .map(|entry| JournalOp::from_tag(&entry.op))
        .collect();

    // Phase 1.
    for (entry, op) in entries.iter().zip(&ops) {
        if *op != Some(JournalOp::Mkdir) {
            continue;
        }
        if entry.path.trim_matches('/').is_empty() {
            report.replayed += 1;
            continue;
        }
        match ctx.mkdir(Actor::ROOT, &entry.path, true) {
            Ok(_) | Err(VdiskError::AlreadyExists(_)) => report.replayed += 1,
            Err(err) => note_failure(&mut report, entry, &err),
        }
    }

    // Phase 2.
    for (entry, op) in entries.iter().zip(&ops) {
        if *op != Some(JournalOp::Mkfile) {
            continue;
        }
        if let Some(parent) = parent_components(&entry.path) {
            if let Err(err) = ctx.ensure_dirs(Actor::ROOT, &parent, true) {
                note_failure(&mut report, entry, &err);
            }
        }
    }

    // Phase 3.
    for (entry, op) in entries.iter().zip(&ops) {
        match op {
            Some(JournalOp::Mkfile | JournalOp::Edit) => {
                match replay_content(ctx, &entry.path, entry.content.as_bytes()) {
                    Ok(()) => report.replayed += 1,
                    Err(err) => note_failure(&mut report, entry, &err),
                }
            }
            Some(JournalOp::Mkdir) => {}
            Some(_) => report.skipped += 1,
            None => note_failure(
                &mut report,
                entry,
                &VdiskError::Corruption {
                    offset: 0,
                    detail: format!("unknown journal operation {:?}", entry.op),
                },
            ),
        }
    }

    sync_counts(ctx.dev, &ctx.layout, &mut ctx.sb)?;
    ctx.save_superblock()?;
    Ok(report)
}
