//! Registry of disk images created through `mkdisk`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vdisk_error::{Result, VdiskError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub created: f32,
}

impl DiskInfo {
    #[must_use]
    pub fn new(path: &Path, size: u64, created: f32) -> Self {
        Self {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            size,
            created,
        }
    }
}

/// Known disks keyed by path, optionally persisted as JSON.
#[derive(Debug)]
pub struct DiskRegistry {
    disks: Mutex<BTreeMap<PathBuf, DiskInfo>>,
    file: Option<PathBuf>,
}

impl DiskRegistry {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            disks: Mutex::new(BTreeMap::new()),
            file: None,
        }
    }

    /// Load the registry stored at `file`, starting empty if it is absent.
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let disks = match std::fs::read(&file) {
            Ok(bytes) => {
                let list: Vec<DiskInfo> = serde_json::from_slice(&bytes).map_err(|err| {
                    VdiskError::Parse(format!("disk registry {}: {err}", file.display()))
                })?;
                list.into_iter()
                    .map(|info| (info.path.clone(), info))
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(file = %file.display(), disks = disks.len(), "disk registry loaded");
        Ok(Self {
            disks: Mutex::new(disks),
            file: Some(file),
        })
    }

    pub fn register(&self, info: DiskInfo) -> Result<()> {
        let mut disks = self.disks.lock();
        disks.insert(info.path.clone(), info);
        self.persist(&disks)
    }

    /// Drop `path`; returns whether it was registered.
    pub fn unregister(&self, path: &Path) -> Result<bool> {
        let mut disks = self.disks.lock();
        let removed = disks.remove(path).is_some();
        if removed {
            self.persist(&disks)?;
        }
        Ok(removed)
    }

    #[must_use]
    pub fn list(&self) -> Vec<DiskInfo> {
        self.disks.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.disks.lock().contains_key(path)
    }

    fn persist(&self, disks: &BTreeMap<PathBuf, DiskInfo>) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let list: Vec<&DiskInfo> = disks.values().collect();
        let json = serde_json::to_vec_pretty(&list)
            .map_err(|err| VdiskError::Parse(format!("disk registry: {err}")))?;
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(file, json).inspect_err(|err| {
            warn!(file = %file.display(), error = %err, "disk registry not saved");
        })?;
        Ok(())
    }
}
