//! Logged-in identity.

use serde::{Deserialize, Serialize};
use tracing::info;
use vdisk_types::{ROOT_GID, ROOT_UID};

use crate::mount::MountId;

/// The uid/gid pair permission checks run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub uid: i32,
    pub gid: i32,
}

impl Actor {
    /// The bootstrap `root` user in the `root` group.
    pub const ROOT: Self = Self {
        uid: ROOT_UID,
        gid: ROOT_GID,
    };

    #[must_use]
    pub fn is_root(self) -> bool {
        self.uid == ROOT_UID
    }

    #[must_use]
    pub fn in_root_group(self) -> bool {
        self.gid == ROOT_GID
    }
}

/// A user logged into one mounted partition.
///
/// Sessions are plain values: the front end keeps the current one and passes
/// it into each call. Nothing in the engine holds a global "current user".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub mount_id: MountId,
    pub user: String,
    pub group: String,
    pub uid: i32,
    pub gid: i32,
}

impl Session {
    #[must_use]
    pub fn actor(&self) -> Actor {
        Actor {
            uid: self.uid,
            gid: self.gid,
        }
    }

    #[must_use]
    pub fn is_root_group(&self) -> bool {
        self.actor().in_root_group() || self.group.eq_ignore_ascii_case("root")
    }

    /// End the session.
    pub fn logout(self) {
        info!(user = %self.user, mount_id = %self.mount_id, "logout");
    }
}
