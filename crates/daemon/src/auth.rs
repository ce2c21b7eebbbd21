// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Capability checks for clients and challenge/response auth for agents.

use crate::accounts::Accounts;
use crate::config::Config;
use gq_core::Queue;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Client capability bits derived from configured groups.
pub const PERM_READ: u8 = 0x01;
pub const PERM_WRITE: u8 = 0x02;
pub const PERM_SETUID: u8 = 0x04;
pub const PERM_QUEUE: u8 = 0x08;

/// Per-queue ACL bits.
pub const QUEUE_PERM_SUBMIT: u8 = 0x01;
pub const QUEUE_PERM_ADMIN: u8 = 0x02;

/// Agent auth responses must carry a timestamp within this window.
pub const MAX_AUTH_TIME_SECS: u64 = 300;

/// Hash the secret file's bytes into the HMAC key.
pub fn load_secret_hash(path: &Path) -> io::Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.into())
}

/// HMAC-SHA256 over the `:`-joined parts, hex-encoded.
pub fn hmac_hex(key: &[u8], parts: &[&str]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return String::new();
    };
    mac.update(parts.join(":").as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().fold(String::new(), |mut out, b| {
        out.push_str(&format!("{b:02x}"));
        out
    })
}

/// Verify a presented HMAC; comparison ignores hex case.
pub fn verify_hmac(key: &[u8], parts: &[&str], presented: &str) -> bool {
    let expected = hmac_hex(key, parts);
    !expected.is_empty() && expected.eq_ignore_ascii_case(presented)
}

/// A fresh random nonce for the agent challenge.
pub fn generate_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Derive a client's capability bits from its group memberships.
/// Uid 0 holds every capability.
pub fn client_perms(accounts: &dyn Accounts, config: &Config, uid: u32) -> u8 {
    if uid == 0 {
        return PERM_READ | PERM_WRITE | PERM_SETUID | PERM_QUEUE;
    }
    let Some(user) = accounts.user(uid) else {
        return 0;
    };

    let mut perms = 0;
    let member_of = |names: &[String]| {
        names
            .iter()
            .filter_map(|name| accounts.group_id(name))
            .any(|gid| user.groups.contains(&gid))
    };
    if member_of(&config.read_groups) {
        perms |= PERM_READ;
    }
    if member_of(&config.write_groups) {
        perms |= PERM_WRITE;
    }
    if member_of(&config.setuid_groups) {
        perms |= PERM_SETUID;
    }
    if member_of(&config.queue_groups) {
        perms |= PERM_QUEUE;
    }
    perms
}

/// Rebuild a queue's per-gid permission map from the configured ACLs.
/// Called when a queue is created and for every queue at startup.
pub fn apply_queue_acls(accounts: &dyn Accounts, config: &Config, queue: &mut Queue) {
    queue.permissions.clear();
    for acl in &config.queue_acls {
        let Ok(pattern) = glob::Pattern::new(&acl.expr) else {
            continue;
        };
        if !pattern.matches(&queue.name) {
            continue;
        }
        for group in &acl.groups {
            let Some(gid) = accounts.group_id(group) else {
                continue;
            };
            let entry = queue.permissions.entry(gid).or_insert(0);
            if acl.allow {
                *entry |= acl.perms;
            } else {
                *entry &= !acl.perms;
            }
        }
    }
}

/// Check a queue-scoped permission for a user.
///
/// Root and global queue admins bypass. Queues without any ACL entries
/// are unrestricted.
pub fn check_queue_acl(
    accounts: &dyn Accounts,
    queue: &Queue,
    uid: u32,
    needed: u8,
    global_perms: u8,
) -> bool {
    if uid == 0 || global_perms & PERM_QUEUE != 0 {
        return true;
    }
    if queue.permissions.is_empty() {
        return true;
    }
    let Some(user) = accounts.user(uid) else {
        return false;
    };
    let mut perms = 0;
    for gid in &user.groups {
        if let Some(bits) = queue.permissions.get(gid) {
            perms |= bits;
            if perms & needed == needed {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
