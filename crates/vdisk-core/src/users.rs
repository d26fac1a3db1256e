//! The `users.txt` credential store.
//!
//! One record per line: `gid,G,group` or `uid,U,group,user,password`.
//! Removing a record rewrites its id to `0`; ids are never reused.

use serde::{Deserialize, Serialize};
use std::fmt;
use vdisk_error::{Result, VdiskError};

/// Longest user, group or password accepted.
pub const MAX_NAME_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UserRecord {
    Group {
        id: i32,
        name: String,
    },
    User {
        id: i32,
        group: String,
        name: String,
        password: String,
    },
}

impl UserRecord {
    #[must_use]
    pub fn id(&self) -> i32 {
        match self {
            Self::Group { id, .. } | Self::User { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.id() != 0
    }
}

/// Parsed `users.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsersFile {
    pub records: Vec<UserRecord>,
}

fn malformed(line: &str, reason: &str) -> VdiskError {
    VdiskError::Corruption {
        offset: 0,
        detail: format!("users.txt record {line:?}: {reason}"),
    }
}

fn validate(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(VdiskError::InvalidArgument(format!(
            "{what} must be 1 to {MAX_NAME_LEN} characters"
        )));
    }
    if value.contains([',', '\n']) {
        return Err(VdiskError::InvalidArgument(format!(
            "{what} cannot contain commas or newlines"
        )));
    }
    Ok(())
}

impl UsersFile {
    /// Content written by `mkfs`.
    pub const BOOTSTRAP: &'static str = "1,G,root\n1,U,root,root,123\n";

    pub fn parse(text: &str) -> Result<Self> {
        let mut records = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let id = fields
                .first()
                .and_then(|f| f.parse::<i32>().ok())
                .ok_or_else(|| malformed(line, "bad id"))?;
            let record = match fields.get(1).copied() {
                Some("G") if fields.len() == 3 => UserRecord::Group {
                    id,
                    name: fields[2].to_owned(),
                },
                Some("U") if fields.len() == 5 => UserRecord::User {
                    id,
                    group: fields[2].to_owned(),
                    name: fields[3].to_owned(),
                    password: fields[4].to_owned(),
                },
                _ => return Err(malformed(line, "unknown record type")),
            };
            records.push(record);
        }
        Ok(Self { records })
    }

    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Id of an active group.
    #[must_use]
    pub fn group_id(&self, name: &str) -> Option<i32> {
        self.records.iter().find_map(|r| match r {
            UserRecord::Group { id, name: n } if *id != 0 && n == name => Some(*id),
            _ => None,
        })
    }

    /// `(uid, group, password)` of an active user.
    #[must_use]
    pub fn user(&self, name: &str) -> Option<(i32, &str, &str)> {
        self.records.iter().find_map(|r| match r {
            UserRecord::User {
                id,
                group,
                name: n,
                password,
            } if *id != 0 && n == name => Some((*id, group.as_str(), password.as_str())),
            _ => None,
        })
    }

    fn count_groups(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, UserRecord::Group { .. }))
            .count()
    }

    fn count_users(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, UserRecord::User { .. }))
            .count()
    }

    fn next_id(count: usize) -> Result<i32> {
        i32::try_from(count + 1)
            .map_err(|_| VdiskError::CapacityExceeded("too many users.txt records".into()))
    }

    pub fn add_group(&mut self, name: &str) -> Result<i32> {
        validate("group name", name)?;
        if self.group_id(name).is_some() {
            return Err(VdiskError::AlreadyExists(format!("group {name}")));
        }
        let id = Self::next_id(self.count_groups())?;
        self.records.push(UserRecord::Group {
            id,
            name: name.to_owned(),
        });
        Ok(id)
    }

    pub fn remove_group(&mut self, name: &str) -> Result<()> {
        if name == "root" {
            return Err(VdiskError::InvalidArgument("the root group cannot be removed".into()));
        }
        let record = self
            .records
            .iter_mut()
            .find(|r| matches!(r, UserRecord::Group { id, name: n } if *id != 0 && n == name))
            .ok_or_else(|| VdiskError::NotFound(format!("group {name}")))?;
        if let UserRecord::Group { id, .. } = record {
            *id = 0;
        }
        Ok(())
    }

    pub fn add_user(&mut self, name: &str, password: &str, group: &str) -> Result<i32> {
        validate("user name", name)?;
        validate("password", password)?;
        validate("group name", group)?;
        if self.group_id(group).is_none() {
            return Err(VdiskError::NotFound(format!("group {group}")));
        }
        if self.user(name).is_some() {
            return Err(VdiskError::AlreadyExists(format!("user {name}")));
        }
        let id = Self::next_id(self.count_users())?;
        self.records.push(UserRecord::User {
            id,
            group: group.to_owned(),
            name: name.to_owned(),
            password: password.to_owned(),
        });
        Ok(id)
    }

    fn active_user_mut(&mut self, name: &str) -> Result<&mut UserRecord> {
        self.records
            .iter_mut()
            .find(|r| matches!(r, UserRecord::User { id, name: n, .. } if *id != 0 && n == name))
            .ok_or_else(|| VdiskError::NotFound(format!("user {name}")))
    }

    pub fn remove_user(&mut self, name: &str) -> Result<()> {
        if name == "root" {
            return Err(VdiskError::InvalidArgument("the root user cannot be removed".into()));
        }
        if let UserRecord::User { id, .. } = self.active_user_mut(name)? {
            *id = 0;
        }
        Ok(())
    }

    pub fn set_user_group(&mut self, name: &str, group: &str) -> Result<()> {
        if self.group_id(group).is_none() {
            return Err(VdiskError::NotFound(format!("group {group}")));
        }
        if let UserRecord::User { group: current, .. } = self.active_user_mut(name)? {
            group.clone_into(current);
        }
        Ok(())
    }
}

impl fmt::Display for UsersFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            match record {
                UserRecord::Group { id, name } => writeln!(f, "{id},G,{name}")?,
                UserRecord::User {
                    id,
                    group,
                    name,
                    password,
                } => writeln!(f, "{id},U,{group},{name},{password}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_content_parses() {
        let users = UsersFile::parse(UsersFile::BOOTSTRAP).unwrap();
        assert_eq!(users.group_id("root"), Some(1));
        assert_eq!(users.user("root"), Some((1, "root", "123")));
        assert_eq!(users.render(), UsersFile::BOOTSTRAP);
    }

    #[test]
    fn groups_and_users_lifecycle() {
        let mut users = UsersFile::parse(UsersFile::BOOTSTRAP).unwrap();
        assert_eq!(users.add_group("staff").unwrap(), 2);
        assert!(matches!(users.add_group("staff"), Err(VdiskError::AlreadyExists(_))));
        assert_eq!(users.add_user("ana", "pw", "staff").unwrap(), 2);
        assert!(matches!(
            users.add_user("bob", "pw", "ghosts"),
            Err(VdiskError::NotFound(_))
        ));

        users.set_user_group("ana", "root").unwrap();
        assert_eq!(users.user("ana"), Some((2, "root", "pw")));

        users.remove_user("ana").unwrap();
        assert_eq!(users.user("ana"), None);
        users.remove_group("staff").unwrap();
        assert_eq!(users.group_id("staff"), None);
        // Removed records keep their slot with id 0; new ids keep counting.
        assert_eq!(users.add_group("ops").unwrap(), 3);
        assert!(users.render().contains("0,G,staff\n"));
        assert!(users.render().contains("0,U,root,ana,pw\n"));
    }

    #[test]
    fn names_are_validated() {
        let mut users = UsersFile::parse(UsersFile::BOOTSTRAP).unwrap();
        assert!(matches!(
            users.add_group("elevenchars"),
            Err(VdiskError::InvalidArgument(_))
        ));
        assert!(users.add_group("a,b").is_err());
        assert!(users.remove_group("root").is_err());
        assert!(users.remove_user("root").is_err());
    }

    #[test]
    fn malformed_lines_are_corruption() {
        assert!(matches!(
            UsersFile::parse("x,G,root\n"),
            Err(VdiskError::Corruption { .. })
        ));
        assert!(UsersFile::parse("1,Q,thing\n").is_err());
    }
}
