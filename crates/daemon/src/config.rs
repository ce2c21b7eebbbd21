// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Controller configuration.
//!
//! The config file is `key value` lines with `#` comments. Unknown keys
//! are skipped with a warning so old controllers tolerate new files.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Default config file location.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/gridq/gridq.conf";

const DEFAULT_STATE_DIR: &str = "/var/spool/gridq/state";
const DEFAULT_CLIENT_SOCKET: &str = "/var/run/gridq/gridq.socket";
const DEFAULT_AGENT_SOCKET: &str = "/var/run/gridq/agent.socket";
const DEFAULT_BACKGROUND_SAVE_MS: u64 = 30_000;
const DEFAULT_EVENT_FREQ_MS: u64 = 100;
const DEFAULT_SCHED_FREQ_MS: u64 = 500;
const DEFAULT_SCHED_MAX: u32 = 250;
const DEFAULT_MAX_JOBID: u32 = 9_999_999;
const DEFAULT_MAX_CLEAN: u32 = 50;
const DEFAULT_FLUSH_DEFER_MS: u64 = 1000;
const DEFAULT_EMAIL_FREQ_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("{path} line {line}: {message}")]
    Invalid {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Per-queue ACL rule: queues matching `expr` grant (or revoke) `perms`
/// to members of `groups`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAcl {
    pub expr: String,
    pub groups: Vec<String>,
    pub allow: bool,
    pub perms: u8,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub background_save_ms: u64,
    pub event_freq_ms: u64,
    pub sched_freq_ms: u64,
    pub sched_max: u32,
    /// Global concurrent running limit; 0 means unlimited.
    pub max_run_jobs: u32,
    pub max_jobid: u32,
    pub max_clean_job: u32,
    pub client_socket: PathBuf,
    pub agent_socket: PathBuf,
    pub logfile: Option<PathBuf>,
    pub flush_defer: bool,
    pub flush_defer_ms: u64,
    pub email_freq_ms: u64,
    pub read_groups: Vec<String>,
    pub write_groups: Vec<String>,
    pub setuid_groups: Vec<String>,
    pub queue_groups: Vec<String>,
    /// File whose bytes hash into the agent shared secret. Absent
    /// disables agent authentication.
    pub secret_file: Option<PathBuf>,
    /// Hostnames allowed to connect as agents, in addition to hosts
    /// named by queues.
    pub agent_nodes: Vec<String>,
    pub queue_acls: Vec<QueueAcl>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_dir: DEFAULT_STATE_DIR.into(),
            background_save_ms: DEFAULT_BACKGROUND_SAVE_MS,
            event_freq_ms: DEFAULT_EVENT_FREQ_MS,
            sched_freq_ms: DEFAULT_SCHED_FREQ_MS,
            sched_max: DEFAULT_SCHED_MAX,
            max_run_jobs: 0,
            max_jobid: DEFAULT_MAX_JOBID,
            max_clean_job: DEFAULT_MAX_CLEAN,
            client_socket: DEFAULT_CLIENT_SOCKET.into(),
            agent_socket: DEFAULT_AGENT_SOCKET.into(),
            logfile: None,
            flush_defer: true,
            flush_defer_ms: DEFAULT_FLUSH_DEFER_MS,
            email_freq_ms: DEFAULT_EMAIL_FREQ_MS,
            read_groups: Vec::new(),
            write_groups: Vec::new(),
            setuid_groups: Vec::new(),
            queue_groups: Vec::new(),
            secret_file: None,
            agent_nodes: Vec::new(),
            queue_acls: Vec::new(),
        }
    }
}

fn split_groups(value: &str) -> Vec<String> {
    value
        .split([' ', ','])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "on" | "1"
    )
}

/// Parse a `queue_acl` value: `expr:group[,group]:allow|deny:perms`
/// where perms is a combination of `s` (submit) and `a` (admin).
fn parse_queue_acl(value: &str) -> Option<QueueAcl> {
    let mut parts = value.splitn(4, ':');
    let expr = parts.next()?.trim();
    let groups = split_groups(parts.next()?);
    let allow = match parts.next()?.trim() {
        "allow" => true,
        "deny" => false,
        _ => return None,
    };
    let mut perms = 0u8;
    for c in parts.next()?.trim().chars() {
        match c {
            's' => perms |= crate::auth::QUEUE_PERM_SUBMIT,
            'a' => perms |= crate::auth::QUEUE_PERM_ADMIN,
            _ => return None,
        }
    }
    if expr.is_empty() || groups.is_empty() || perms == 0 {
        return None;
    }
    Some(QueueAcl {
        expr: expr.to_string(),
        groups,
        allow,
        perms,
    })
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    pub fn parse(path: &Path, contents: &str) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        for (line_no, raw) in contents.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((k, v)) => (k.trim(), v.trim()),
                None => {
                    warn!(line = line_no + 1, "skipping config line without a value");
                    continue;
                }
            };

            let invalid = |message: String| ConfigError::Invalid {
                path: path.to_owned(),
                line: line_no + 1,
                message,
            };
            let number = |value: &str| -> Result<u64, ConfigError> {
                value
                    .parse()
                    .map_err(|_| invalid(format!("bad numeric value {value:?} for {key}")))
            };

            match key {
                "state_dir" => config.state_dir = value.into(),
                "background_save_ms" => config.background_save_ms = number(value)?,
                "event_freq" => config.event_freq_ms = number(value)?,
                "sched_freq" => config.sched_freq_ms = number(value)?,
                "sched_max" => config.sched_max = number(value)? as u32,
                "max_system_jobs" => config.max_run_jobs = number(value)? as u32,
                "max_jobid" => config.max_jobid = number(value)? as u32,
                "max_clean_job" => config.max_clean_job = number(value)? as u32,
                "client_listen_socket" => config.client_socket = value.into(),
                "agent_listen_socket" => config.agent_socket = value.into(),
                "logfile" => config.logfile = Some(value.into()),
                "flush_defer" => config.flush_defer = parse_bool(value),
                "flush_defer_ms" => config.flush_defer_ms = number(value)?,
                "email_freq_ms" => config.email_freq_ms = number(value)?,
                "read_group" => config.read_groups = split_groups(value),
                "write_group" => config.write_groups = split_groups(value),
                "setuid_group" => config.setuid_groups = split_groups(value),
                "queue_group" => config.queue_groups = split_groups(value),
                "secret_file" => config.secret_file = Some(value.into()),
                "agent_node" => config.agent_nodes.push(value.to_string()),
                "queue_acl" => match parse_queue_acl(value) {
                    Some(acl) => config.queue_acls.push(acl),
                    None => return Err(invalid(format!("bad queue_acl {value:?}"))),
                },
                _ => {
                    warn!(key, line = line_no + 1, "skipping unknown config key");
                }
            }
        }

        if config.max_jobid == 0 {
            return Err(ConfigError::Invalid {
                path: path.to_owned(),
                line: 0,
                message: "max_jobid must be at least 1".into(),
            });
        }

        Ok(config)
    }

    /// Whether `host` may connect as an agent: either listed explicitly
    /// or referenced by a queue.
    pub fn allows_agent(&self, host: &str, queue_hosts: &[String]) -> bool {
        self.agent_nodes.iter().any(|n| n == host) || queue_hosts.iter().any(|h| h == host)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
