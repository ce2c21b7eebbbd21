// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User and group lookup seam.
//!
//! The controller only needs uid resolution and group membership to
//! derive capabilities; the real directory (NSS, LDAP, ...) lives outside
//! the core. [`EtcAccounts`] reads the flat passwd/group files and caches
//! lookups; [`FakeAccounts`] backs the tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

/// A resolved user with primary and supplementary group ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

pub trait Accounts: Send + Sync {
    /// Resolve a uid. `None` when the user does not exist.
    fn user(&self, uid: u32) -> Option<UserInfo>;

    /// Resolve a group name to its gid.
    fn group_id(&self, name: &str) -> Option<u32>;
}

/// Accounts backed by passwd/group files, with a per-uid cache.
pub struct EtcAccounts {
    passwd_path: PathBuf,
    group_path: PathBuf,
    cache: Mutex<HashMap<u32, Option<UserInfo>>>,
}

impl EtcAccounts {
    pub fn new() -> EtcAccounts {
        Self::with_paths("/etc/passwd".into(), "/etc/group".into())
    }

    pub fn with_paths(passwd_path: PathBuf, group_path: PathBuf) -> EtcAccounts {
        EtcAccounts {
            passwd_path,
            group_path,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, uid: u32) -> Option<UserInfo> {
        let passwd = std::fs::read_to_string(&self.passwd_path).ok()?;
        let (name, gid) = passwd.lines().find_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let _pw = fields.next()?;
            let entry_uid: u32 = fields.next()?.parse().ok()?;
            let gid: u32 = fields.next()?.parse().ok()?;
            (entry_uid == uid).then(|| (name.to_string(), gid))
        })?;

        let mut groups = vec![gid];
        if let Ok(group_file) = std::fs::read_to_string(&self.group_path) {
            for line in group_file.lines() {
                let mut fields = line.split(':');
                let _group_name = fields.next();
                let _pw = fields.next();
                let Some(entry_gid) = fields.next().and_then(|g| g.parse::<u32>().ok()) else {
                    continue;
                };
                let members = fields.next().unwrap_or("");
                if members.split(',').any(|m| m == name) && !groups.contains(&entry_gid) {
                    groups.push(entry_gid);
                }
            }
        }

        Some(UserInfo {
            name,
            uid,
            gid,
            groups,
        })
    }
}

impl Default for EtcAccounts {
    fn default() -> Self {
        Self::new()
    }
}

impl Accounts for EtcAccounts {
    fn user(&self, uid: u32) -> Option<UserInfo> {
        let mut cache = self.cache.lock();
        cache.entry(uid).or_insert_with(|| self.lookup(uid)).clone()
    }

    fn group_id(&self, name: &str) -> Option<u32> {
        let group_file = std::fs::read_to_string(&self.group_path).ok()?;
        group_file.lines().find_map(|line| {
            let mut fields = line.split(':');
            let entry_name = fields.next()?;
            let _pw = fields.next()?;
            let gid = fields.next()?.parse().ok()?;
            (entry_name == name).then_some(gid)
        })
    }
}

/// In-memory accounts for tests.
#[derive(Default)]
pub struct FakeAccounts {
    users: HashMap<u32, UserInfo>,
    groups: HashMap<String, u32>,
}

impl FakeAccounts {
    pub fn new() -> FakeAccounts {
        FakeAccounts::default()
    }

    pub fn add_user(&mut self, uid: u32, name: &str, gid: u32, groups: &[u32]) -> &mut Self {
        let mut all = vec![gid];
        all.extend(groups.iter().copied().filter(|g| *g != gid));
        self.users.insert(
            uid,
            UserInfo {
                name: name.to_string(),
                uid,
                gid,
                groups: all,
            },
        );
        self
    }

    pub fn add_group(&mut self, name: &str, gid: u32) -> &mut Self {
        self.groups.insert(name.to_string(), gid);
        self
    }
}

impl Accounts for FakeAccounts {
    fn user(&self, uid: u32) -> Option<UserInfo> {
        self.users.get(&uid).cloned()
    }

    fn group_id(&self, name: &str) -> Option<u32> {
        self.groups.get(name).copied()
    }
}

#[cfg(test)]
#[path = "accounts_tests.rs"]
mod tests;
