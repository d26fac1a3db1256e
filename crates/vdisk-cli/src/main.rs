#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use vdisk::{
    DiskOptions, DiskRegistry, EntryInfo, FileContent, Filesystem, FormatOptions, InodeNumber,
    MountId, MountTable, MountTableConfig, PartitionRequest, Session, TreeNode, disk_report,
    fdisk_create, fdisk_delete, fdisk_resize, mkdisk, parse_delete_mode, parse_fit,
    parse_partition_kind, parse_unit, rmdisk,
};

/// Bitmap characters per line in `rep bm_inode` / `rep bm_block`.
const BITMAP_ROW: usize = 20;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let json = take_switch(&mut args, "--json");
    let registry = match env::var_os("VDISK_REGISTRY") {
        Some(file) => DiskRegistry::open(PathBuf::from(file)).context("open disk registry")?,
        None => DiskRegistry::in_memory(),
    };
    let mut shell = Shell::new(registry, json);

    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };
    match command.as_str() {
        "exec" => {
            let Some(script) = args.get(1) else {
                bail!("exec requires a script path");
            };
            let text = std::fs::read_to_string(script)
                .with_context(|| format!("failed to read script {script}"))?;
            shell.run_script(&text)
        }
        "shell" => {
            for line in io::stdin().lock().lines() {
                let line = line.context("read stdin")?;
                if let Err(error) = shell.run_line(&line) {
                    eprintln!("error: {error:#}");
                }
            }
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => shell.execute(&args),
    }
}

fn print_usage() {
    println!("vdisk-cli\n");
    println!("USAGE:");
    println!("  vdisk-cli [--json] <command> [-flag=value ...]");
    println!("  vdisk-cli [--json] exec <script>");
    println!("  vdisk-cli [--json] shell");
    println!();
    println!("Mounts and logins live for one process; use exec or shell to chain them.");
    println!("Set VDISK_REGISTRY to a JSON file to remember created disks.");
    println!();
    println!("COMMANDS:");
    println!("  mkdisk -size=N [-unit=K|M] [-fit=FF|BF|WF] -path=P");
    println!("  rmdisk -path=P");
    println!("  fdisk -path=P -name=N -size=N [-unit=B|K|M] [-type=P|E|L] [-fit=FF|BF|WF]");
    println!("  fdisk -path=P -name=N -delete=fast|full");
    println!("  fdisk -path=P -name=N -add=N [-unit=B|K|M]");
    println!("  mount -path=P -name=N | unmount -id=I | mounted | disks");
    println!("  mkfs -id=I [-fs=2fs|3fs]");
    println!("  login -user=U -pass=P -id=I | logout");
    println!("  mkgrp -name=G | rmgrp -name=G | mkusr -user=U -pass=P -grp=G");
    println!("  rmusr -user=U | chgrp -user=U -grp=G");
    println!("  mkdir -path=P [-p] | mkfile -path=P [-r] [-size=N] [-cont=HOSTFILE]");
    println!("  cat -file=P | edit -path=P -cont=HOSTFILE | rename -path=P -name=N");
    println!("  remove -path=P | copy -path=P -dest=D | move -path=P -dest=D");
    println!("  chmod -path=P -ugo=NNN [-r] | chown -path=P -user=U [-r]");
    println!("  ls [-path=P] | tree [-path=P] | find -path=P -name=PATTERN");
    println!("  journaling -id=I | loss -id=I | recovery -id=I");
    println!("  rep -name=mbr|disk -path=P");
    println!("  rep -name=sb|bm_inode|bm_block|inode|journaling -id=I");
    println!("  rep -name=file|ls|tree -path_file_ls=P");
}

fn take_switch(args: &mut Vec<String>, switch: &str) -> bool {
    let before = args.len();
    args.retain(|arg| arg != switch);
    args.len() != before
}

// ── Script lines ────────────────────────────────────────────────────────────

/// Split a script line into words. Double quotes group words; `#` at the
/// start of a word begins a comment.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            '#' if !quoted && !started => break,
            c if c.is_whitespace() && !quoted => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        tokens.push(current);
    }
    tokens
}

/// `-key=value` and `-switch` arguments; keys are case-insensitive.
#[derive(Debug, Default)]
struct Flags {
    values: BTreeMap<String, String>,
}

impl Flags {
    fn parse(tokens: &[String]) -> Result<Self> {
        let mut values = BTreeMap::new();
        for token in tokens {
            let Some(body) = token.strip_prefix('-') else {
                bail!("unexpected argument {token:?}");
            };
            let body = body.trim_start_matches('-');
            let (key, value) = body.split_once('=').unwrap_or((body, ""));
            if key.is_empty() {
                bail!("unexpected argument {token:?}");
            }
            values.insert(key.to_ascii_lowercase(), value.to_owned());
        }
        Ok(Self { values })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .filter(|value| !value.is_empty())
            .with_context(|| format!("missing -{key}"))
    }

    fn number<T: FromStr>(&self, key: &str) -> Result<T> {
        let text = self.require(key)?;
        text.parse()
            .ok()
            .with_context(|| format!("-{key}={text} is not a valid number"))
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        self.require(key).map(PathBuf::from)
    }
}

// ── Shell state ─────────────────────────────────────────────────────────────

struct Shell {
    disks: DiskRegistry,
    mounts: MountTable,
    session: Option<Session>,
    json: bool,
}

impl Shell {
    fn new(disks: DiskRegistry, json: bool) -> Self {
        Self {
            disks,
            mounts: MountTable::new(MountTableConfig::default()),
            session: None,
            json,
        }
    }

    /// Run every line, reporting failures as they happen.
    fn run_script(&mut self, text: &str) -> Result<()> {
        let mut failed = 0;
        let mut total = 0;
        for (number, line) in text.lines().enumerate() {
            match self.run_line(line) {
                Ok(true) => total += 1,
                Ok(false) => {}
                Err(error) => {
                    total += 1;
                    failed += 1;
                    eprintln!("error: line {}: {error:#}", number + 1);
                }
            }
        }
        if failed > 0 {
            bail!("{failed} of {total} commands failed");
        }
        Ok(())
    }

    /// Returns whether the line held a command.
    fn run_line(&mut self, line: &str) -> Result<bool> {
        let tokens = tokenize(line);
        if tokens.is_empty() {
            return Ok(false);
        }
        if !self.json {
            println!("> {}", line.trim());
        }
        self.execute(&tokens)?;
        Ok(true)
    }

    fn execute(&mut self, tokens: &[String]) -> Result<()> {
        let Some((command, rest)) = tokens.split_first() else {
            return Ok(());
        };
        let flags = Flags::parse(rest)?;
        let command = command.to_ascii_lowercase();
        match command.as_str() {
            "mkdisk" => self.mkdisk(&flags),
            "rmdisk" => self.rmdisk(&flags),
            "disks" => self.emit(&self.disks.list(), |disks| {
                disks
                    .iter()
                    .map(|d| format!("{}  {} bytes", d.path.display(), d.size))
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
            "fdisk" => self.fdisk(&flags),
            "mount" => self.mount(&flags),
            "unmount" => self.unmount(&flags),
            "mounted" => self.emit(&self.mounts.list(), |mounts| {
                mounts
                    .iter()
                    .map(|m| format!("{}  {} {}", m.id, m.disk_path.display(), m.partition))
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
            "mkfs" => self.mkfs(&flags),
            "login" => self.login(&flags),
            "logout" => self.logout(),
            "mkgrp" | "rmgrp" | "mkusr" | "rmusr" | "chgrp" => self.accounts(&command, &flags),
            "mkdir" | "mkfile" | "cat" | "edit" | "rename" | "remove" | "rm" | "copy"
            | "move" | "chmod" | "chown" => self.files(&command, &flags),
            "ls" | "tree" | "find" => self.listing(&command, &flags),
            "journaling" | "loss" | "recovery" => self.journal(&command, &flags),
            "rep" => self.report(&flags),
            other => bail!("unknown command: {other}"),
        }
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("serialize output")?
            );
        } else {
            let text = text(value);
            if !text.is_empty() {
                println!("{text}");
            }
        }
        Ok(())
    }

    fn message(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.emit(&serde_json::json!({ "message": text }), |_| text.clone())
    }

    fn session(&self) -> Result<(&Session, Filesystem)> {
        let session = self.session.as_ref().context("no user is logged in")?;
        let fs = self.mounts.filesystem(&session.mount_id)?;
        Ok((session, fs))
    }

    fn mounted_fs(&self, flags: &Flags) -> Result<Filesystem> {
        let id = MountId::new(flags.require("id")?);
        Ok(self.mounts.filesystem(&id)?)
    }

    // ── Disks and partitions ────────────────────────────────────────────────

    fn mkdisk(&self, flags: &Flags) -> Result<()> {
        let path = flags.path("path")?;
        let options = DiskOptions {
            size: flags.number("size")?,
            unit: flags.get("unit").map(parse_unit).transpose()?.unwrap_or_default(),
            fit: flags.get("fit").map(parse_fit).transpose()?.unwrap_or_default(),
        };
        let mbr = mkdisk(&self.disks, &path, &options)
            .with_context(|| format!("mkdisk {}", path.display()))?;
        self.emit(&mbr, |mbr| {
            format!("disk {} created: {} bytes", path.display(), mbr.size)
        })
    }

    fn rmdisk(&self, flags: &Flags) -> Result<()> {
        let path = flags.path("path")?;
        rmdisk(&self.disks, &self.mounts, &path)
            .with_context(|| format!("rmdisk {}", path.display()))?;
        self.message(format!("disk {} removed", path.display()))
    }

    fn fdisk(&self, flags: &Flags) -> Result<()> {
        let path = flags.path("path")?;
        let name = flags.require("name")?;
        let unit = flags.get("unit").map(parse_unit).transpose()?.unwrap_or_default();

        if let Some(mode) = flags.get("delete") {
            fdisk_delete(&path, name, parse_delete_mode(mode)?)
                .with_context(|| format!("delete partition {name}"))?;
            return self.message(format!("partition {name} deleted"));
        }
        if flags.has("add") {
            let amount: i64 = flags.number("add")?;
            let size = fdisk_resize(&path, name, amount, unit)
                .with_context(|| format!("resize partition {name}"))?;
            return self.message(format!("partition {name} is now {size} bytes"));
        }

        let request = PartitionRequest {
            name: name.to_owned(),
            size: flags.number("size")?,
            unit,
            kind: flags
                .get("type")
                .map(parse_partition_kind)
                .transpose()?
                .unwrap_or_default(),
            fit: flags.get("fit").map(parse_fit).transpose()?.unwrap_or_default(),
        };
        let location = fdisk_create(&path, &request)
            .with_context(|| format!("create partition {name}"))?;
        self.emit(&location, |location| {
            format!(
                "partition {name} created: {} bytes at offset {}",
                location.size(),
                location.start()
            )
        })
    }

    fn mount(&self, flags: &Flags) -> Result<()> {
        let path = flags.path("path")?;
        let name = flags.require("name")?;
        let id = self
            .mounts
            .mount(&path, name)
            .with_context(|| format!("mount {name} of {}", path.display()))?;
        self.emit(&id, |id| format!("{name} mounted as {id}"))
    }

    fn unmount(&mut self, flags: &Flags) -> Result<()> {
        let id = MountId::new(flags.require("id")?);
        let info = self.mounts.unmount(&id)?;
        if self.session.as_ref().is_some_and(|s| s.mount_id == id) {
            if let Some(session) = self.session.take() {
                session.logout();
            }
        }
        self.emit(&info, |info| format!("{} unmounted", info.id))
    }

    fn mkfs(&self, flags: &Flags) -> Result<()> {
        let fs = self.mounted_fs(flags)?;
        let journaled = match flags.get("fs").map(str::to_ascii_lowercase).as_deref() {
            None | Some("2fs") => false,
            Some("3fs") => true,
            Some(other) => bail!("unknown filesystem type {other}; use 2fs or 3fs"),
        };
        let sb = fs.format(FormatOptions { journaled })?;
        self.emit(&sb, |sb| {
            format!(
                "{} formatted as ext{}: {} inodes, {} blocks",
                fs.mount_id(),
                sb.fs_type,
                sb.inodes_count + sb.free_inodes_count,
                sb.blocks_count + sb.free_blocks_count
            )
        })
    }

    // ── Users and groups ────────────────────────────────────────────────────

    fn login(&mut self, flags: &Flags) -> Result<()> {
        if let Some(session) = &self.session {
            bail!("{} is already logged in; logout first", session.user);
        }
        let fs = self.mounted_fs(flags)?;
        let user = flags.require("user")?;
        let session = fs.login(user, flags.require("pass")?)?;
        self.emit(&session, |s| format!("logged in as {} ({})", s.user, s.group))?;
        self.session = Some(session);
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        let session = self.session.take().context("no user is logged in")?;
        let user = session.user.clone();
        session.logout();
        self.message(format!("{user} logged out"))
    }

    fn accounts(&self, command: &str, flags: &Flags) -> Result<()> {
        let (session, fs) = self.session()?;
        let text = match command {
            "mkgrp" => {
                let name = flags.require("name")?;
                let gid = fs.mkgrp(session, name)?;
                format!("group {name} created with id {gid}")
            }
            "rmgrp" => {
                let name = flags.require("name")?;
                fs.rmgrp(session, name)?;
                format!("group {name} removed")
            }
            "mkusr" => {
                let user = flags.require("user")?;
                let uid = fs.mkusr(session, user, flags.require("pass")?, flags.require("grp")?)?;
                format!("user {user} created with id {uid}")
            }
            "rmusr" => {
                let user = flags.require("user")?;
                fs.rmusr(session, user)?;
                format!("user {user} removed")
            }
            _ => {
                let user = flags.require("user")?;
                let group = flags.require("grp")?;
                fs.chgrp(session, user, group)?;
                format!("user {user} moved to group {group}")
            }
        };
        self.message(text)
    }

    // ── Files and directories ───────────────────────────────────────────────

    fn files(&self, command: &str, flags: &Flags) -> Result<()> {
        let (session, fs) = self.session()?;
        match command {
            "mkdir" => {
                let path = flags.require("path")?;
                let ino = fs.mkdir(session, path, flags.has("p"))?;
                self.emit(&ino, |ino| format!("directory {path} created (inode {})", ino.0))
            }
            "mkfile" => {
                let path = flags.require("path")?;
                let content = match flags.get("cont") {
                    Some(host) if !host.is_empty() => FileContent::Bytes(read_host_file(host)?),
                    _ if flags.has("size") => FileContent::Zeroed(flags.number("size")?),
                    _ => FileContent::Bytes(Vec::new()),
                };
                let ino = fs.mkfile(session, path, content, flags.has("r"))?;
                self.emit(&ino, |ino| format!("file {path} created (inode {})", ino.0))
            }
            "cat" => {
                let path = flags.require("file")?;
                let bytes = fs.cat(session, path)?;
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.emit(&serde_json::json!({ "path": path, "content": text }), |_| {
                    text.clone()
                })
            }
            "edit" => {
                let path = flags.require("path")?;
                let content = read_host_file(flags.require("cont")?)?;
                fs.edit(session, path, &content)?;
                self.message(format!("{path} updated"))
            }
            "rename" => {
                let path = flags.require("path")?;
                let name = flags.require("name")?;
                fs.rename(session, path, name)?;
                self.message(format!("{path} renamed to {name}"))
            }
            "remove" | "rm" => {
                let path = flags.require("path")?;
                fs.remove(session, path)?;
                self.message(format!("{path} removed"))
            }
            "copy" => {
                let path = flags.require("path")?;
                let report = fs.copy(session, path, flags.require("dest")?)?;
                self.emit(&report, |report| {
                    let mut lines = vec![format!(
                        "{} entries copied, {} skipped",
                        report.copied.len(),
                        report.skipped.len()
                    )];
                    lines.extend(report.skipped.iter().map(|p| format!("  skipped {p}")));
                    lines.join("\n")
                })
            }
            "move" => {
                let path = flags.require("path")?;
                let dest = flags.require("dest")?;
                fs.mv(session, path, dest)?;
                self.message(format!("{path} moved into {dest}"))
            }
            "chmod" => {
                let path = flags.require("path")?;
                let changed = fs.chmod(session, path, flags.require("ugo")?, flags.has("r"))?;
                self.message(format!("permissions changed on {changed} entries"))
            }
            _ => {
                let path = flags.require("path")?;
                let changed = fs.chown(session, path, flags.require("user")?, flags.has("r"))?;
                self.message(format!("owner changed on {changed} entries"))
            }
        }
    }

    fn listing(&self, command: &str, flags: &Flags) -> Result<()> {
        let (session, fs) = self.session()?;
        let path = flags.get("path").filter(|p| !p.is_empty()).unwrap_or("/");
        match command {
            "ls" => self.emit(&fs.ls(session, path)?, |entries| render_entries(entries)),
            "tree" => self.emit(&fs.tree(session, path)?, |tree| render_tree(tree)),
            _ => {
                let matches = fs.find(session, path, flags.require("name")?)?;
                self.emit(&matches, |matches| matches.join("\n"))
            }
        }
    }

    // ── Journal ─────────────────────────────────────────────────────────────

    fn journal(&self, command: &str, flags: &Flags) -> Result<()> {
        let fs = self.mounted_fs(flags)?;
        match command {
            "journaling" => self.emit(&fs.journaling()?, |entries| {
                entries
                    .iter()
                    .map(|e| format!("{:>4}  {:<8} {:<32} {:?}", e.count, e.op, e.path, e.content))
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
            "loss" => self.emit(&fs.loss()?, ToString::to_string),
            _ => self.emit(&fs.recovery()?, ToString::to_string),
        }
    }

    // ── Reports ─────────────────────────────────────────────────────────────

    fn report(&self, flags: &Flags) -> Result<()> {
        let name = flags.require("name")?.to_ascii_lowercase();
        match name.as_str() {
            "mbr" | "disk" => {
                let path = flags.path("path")?;
                let layout = disk_report(&path)?;
                self.emit(&layout, |layout| {
                    let mut lines = vec![format!(
                        "disk {}: {} bytes, signature {}",
                        path.display(),
                        layout.mbr.size,
                        layout.mbr.signature
                    )];
                    for part in layout.mbr.partitions.iter().filter(|p| p.is_used()) {
                        lines.push(format!(
                            "  {} {:<16} start {:>10} size {:>10}{}",
                            char::from(part.kind),
                            part.name,
                            part.start,
                            part.size,
                            if part.is_mounted() { "  mounted" } else { "" }
                        ));
                    }
                    for node in layout.logical.iter().filter(|n| n.ebr.is_used()) {
                        lines.push(format!(
                            "  L {:<16} start {:>10} size {:>10}",
                            node.ebr.name, node.ebr.start, node.ebr.size
                        ));
                    }
                    lines.join("\n")
                })
            }
            "sb" => {
                let fs = self.mounted_fs(flags)?;
                self.emit(&fs.superblock()?, |sb| format!("{sb:#?}"))
            }
            "bm_inode" | "bm_block" => {
                let fs = self.mounted_fs(flags)?;
                let bits = if name == "bm_inode" {
                    fs.inode_bitmap()?
                } else {
                    fs.block_bitmap()?
                };
                let text = String::from_utf8_lossy(&bits).into_owned();
                self.emit(&text, |text| {
                    text.as_bytes()
                        .chunks(BITMAP_ROW)
                        .map(|row| String::from_utf8_lossy(row).into_owned())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            "inode" => {
                let fs = self.mounted_fs(flags)?;
                let mut inodes = Vec::new();
                for (index, mark) in fs.inode_bitmap()?.iter().enumerate() {
                    if *mark != b'1' {
                        continue;
                    }
                    let ino = InodeNumber(u32::try_from(index).context("inode index")?);
                    inodes.push((ino, fs.inode(ino)?));
                }
                self.emit(&inodes, |inodes| {
                    inodes
                        .iter()
                        .map(|(ino, inode)| format!("inode {}: {inode:?}", ino.0))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            "journaling" => self.journal("journaling", flags),
            "file" => {
                let (session, fs) = self.session()?;
                let path = flags.require("path_file_ls")?;
                let text = String::from_utf8_lossy(&fs.cat(session, path)?).into_owned();
                self.emit(&serde_json::json!({ "path": path, "content": text }), |_| {
                    format!("{path}\n{text}")
                })
            }
            "ls" | "tree" => {
                let (session, fs) = self.session()?;
                let path = flags.require("path_file_ls")?;
                if name == "ls" {
                    self.emit(&fs.ls(session, path)?, |entries| render_entries(entries))
                } else {
                    self.emit(&fs.tree(session, path)?, |tree| render_tree(tree))
                }
            }
            other => bail!("unknown report: {other}"),
        }
    }
}

fn read_host_file(path: &str) -> Result<Vec<u8>> {
    std::fs::read(Path::new(path)).with_context(|| format!("failed to read {path}"))
}

fn render_entries(entries: &[EntryInfo]) -> String {
    entries
        .iter()
        .map(|e| {
            format!(
                "{:<4} {} {:>4} {:>4} {:>8}  {}",
                e.file_type, e.perm, e.uid, e.gid, e.size, e.name
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_tree(tree: &TreeNode) -> String {
    fn walk(node: &TreeNode, depth: usize, out: &mut Vec<String>) {
        out.push(format!("{}{}", "  ".repeat(depth), node.entry.name));
        for child in &node.children {
            walk(child, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    walk(tree, 0, &mut out);
    out.join("\n")
}
