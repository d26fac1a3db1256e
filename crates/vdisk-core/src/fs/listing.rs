//! `ls`, `tree` and `find`.

use std::collections::HashSet;
use vdisk_dir::list_entries;
use vdisk_error::Result;
use vdisk_ondisk::Inode;
use vdisk_types::InodeNumber;

use super::context::FsContext;
use super::path::{child_path, split_path};
use super::{EntryInfo, TreeNode};
use crate::perms::{can_read, require_read};
use crate::session::Actor;

/// Case-insensitive glob match supporting `*` and `?`.
pub(crate) fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    let name: Vec<char> = name.chars().map(|c| c.to_ascii_lowercase()).collect();
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

fn display_name(path: &str) -> &str {
    split_path(path)
        .ok()
        .and_then(|components| components.last().copied())
        .unwrap_or("/")
}

impl FsContext<'_> {
    pub(crate) fn ls(&self, actor: Actor, path: &str) -> Result<Vec<EntryInfo>> {
        let (ino, inode) = self.resolve(path)?;
        require_read(&inode, actor, path)?;
        if inode.is_file() {
            return Ok(vec![EntryInfo::new(display_name(path), ino, &inode)]);
        }
        let mut out = Vec::new();
        for entry in list_entries(self.dev, &self.layout, &inode)? {
            let Some(child) = InodeNumber::from_slot(entry.inode) else {
                continue;
            };
            out.push(EntryInfo::new(&entry.name, child, &self.live_inode(child)?));
        }
        Ok(out)
    }

    /// Directories the caller cannot read appear without children.
    fn tree_node(
        &self,
        actor: Actor,
        name: &str,
        ino: InodeNumber,
        inode: &Inode,
        visited: &mut HashSet<InodeNumber>,
    ) -> Result<TreeNode> {
        let mut node = TreeNode {
            entry: EntryInfo::new(name, ino, inode),
            children: Vec::new(),
        };
        if !visited.insert(ino) || !inode.is_dir() || !can_read(inode, actor) {
            return Ok(node);
        }
        for entry in list_entries(self.dev, &self.layout, inode)? {
            let Some(child) = InodeNumber::from_slot(entry.inode) else {
                continue;
            };
            if visited.contains(&child) {
                continue;
            }
            let child_inode = self.live_inode(child)?;
            node.children
                .push(self.tree_node(actor, &entry.name, child, &child_inode, visited)?);
        }
        Ok(node)
    }

    pub(crate) fn tree(&self, actor: Actor, path: &str) -> Result<TreeNode> {
        let (ino, inode) = self.resolve(path)?;
        require_read(&inode, actor, path)?;
        self.tree_node(actor, display_name(path), ino, &inode, &mut HashSet::new())
    }

    pub(crate) fn find(&self, actor: Actor, path: &str, pattern: &str) -> Result<Vec<String>> {
        let tree = self.tree(actor, path)?;
        let mut out = Vec::new();
        collect_matches(&tree, path, pattern, &mut out);
        Ok(out)
    }
}

fn collect_matches(node: &TreeNode, path: &str, pattern: &str, out: &mut Vec<String>) {
    if wildcard_match(pattern, &node.entry.name) {
        out.push(path.to_owned());
    }
    for child in &node.children {
        collect_matches(child, &child_path(path, &child.entry.name), pattern, out);
    }
}
