// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job record, state bitflags, and scheduling bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dense numeric job identifier, allocated from `1..=max_jobid`.
pub type JobId = u32;

/// Default job priority when a submission does not specify one.
pub const DEFAULT_JOB_PRIORITY: u8 = 100;

/// Job states.
///
/// Each state has a distinct bit so a [`StateMask`] can match sets of
/// states in filters, but a job is always in exactly one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Pending,
    Deferred,
    Holding,
    Completed,
    Exited,
    Unknown,
}

impl JobState {
    /// Bit value used in masks and in persisted STATE fields.
    pub const fn bits(self) -> u32 {
        match self {
            JobState::Running => 0x01,
            JobState::Pending => 0x02,
            JobState::Deferred => 0x04,
            JobState::Holding => 0x08,
            JobState::Completed => 0x10,
            JobState::Exited => 0x20,
            JobState::Unknown => 0x40,
        }
    }

    /// Decode a persisted STATE value. Exactly one bit must be set.
    pub fn from_bits(bits: u32) -> Option<JobState> {
        match bits {
            0x01 => Some(JobState::Running),
            0x02 => Some(JobState::Pending),
            0x04 => Some(JobState::Deferred),
            0x08 => Some(JobState::Holding),
            0x10 => Some(JobState::Completed),
            0x20 => Some(JobState::Exited),
            0x40 => Some(JobState::Unknown),
            _ => None,
        }
    }

    /// Completed and Exited jobs never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Exited)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Running => "running",
            JobState::Pending => "pending",
            JobState::Deferred => "deferred",
            JobState::Holding => "holding",
            JobState::Completed => "completed",
            JobState::Exited => "exited",
            JobState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A set of job states, used by `get_job` filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateMask(pub u32);

impl StateMask {
    pub const ALL: StateMask = StateMask(0x7f);

    pub fn contains(self, state: JobState) -> bool {
        self.0 & state.bits() != 0
    }

    pub fn with(self, state: JobState) -> StateMask {
        StateMask(self.0 | state.bits())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<JobState> for StateMask {
    fn from(state: JobState) -> Self {
        StateMask(state.bits())
    }
}

/// Internal bookkeeping flags, never persisted to object files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InternalFlags(u8);

impl InternalFlags {
    /// Object is deleted and will be reclaimed once flushed.
    pub const DELETED: InternalFlags = InternalFlags(0x01);
    /// Object is being written to disk by an in-flight save.
    pub const FLUSHING: InternalFlags = InternalFlags(0x02);
    /// A start message has been dispatched but not yet confirmed.
    pub const STARTED: InternalFlags = InternalFlags(0x04);

    pub fn contains(self, flag: InternalFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: InternalFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: InternalFlags) {
        self.0 &= !flag.0;
    }
}

/// Why a pending job was not dispatched this scheduling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendReason {
    QueueStopped,
    QueueFull,
    SystemFull,
    WaitingStart,
    WaitingRes,
    AgentDisconnected,
    AgentStarting,
}

impl fmt::Display for PendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PendReason::QueueStopped => "Queue stopped",
            PendReason::QueueFull => "Queue limit reached",
            PendReason::SystemFull => "System job limit reached",
            PendReason::WaitingStart => "Waiting on start confirmation",
            PendReason::WaitingRes => "Waiting on resources",
            PendReason::AgentDisconnected => "Agent is disconnected",
            PendReason::AgentStarting => "Agent is starting",
        };
        write!(f, "{s}")
    }
}

/// A named resource requirement on a job. `count` units are consumed while
/// the job is running or started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub name: String,
    pub count: u32,
}

impl ResourceRequest {
    /// Parse the wire form `name` or `name:count`.
    pub fn parse(s: &str) -> Option<ResourceRequest> {
        let (name, count) = match s.split_once(':') {
            Some((name, count)) => (name, count.parse().ok()?),
            None => (s, 1),
        };
        if name.is_empty() || count == 0 {
            return None;
        }
        Some(ResourceRequest {
            name: name.to_string(),
            count,
        })
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.count)
    }
}

/// Process resource usage reported by an agent at job completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rusage {
    pub utime_sec: u64,
    pub utime_usec: u64,
    pub stime_sec: u64,
    pub stime_usec: u64,
    pub maxrss: u64,
    pub minflt: u64,
    pub majflt: u64,
    pub inblock: u64,
    pub oublock: u64,
    pub nvcsw: u64,
    pub nivcsw: u64,
}

/// A batch job.
///
/// Timestamps are epoch seconds with 0 meaning unset, matching the
/// persisted object file format.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub jobid: JobId,
    pub name: String,
    /// Owning queue, by name. Always references a live queue while the job
    /// is not deleted.
    pub queue: String,
    pub submitter_uid: u32,
    pub run_uid: u32,
    pub shell: Option<String>,
    pub pre_cmd: Option<String>,
    pub post_cmd: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub nice: i32,
    pub priority: u8,
    pub state: JobState,
    pub internal: InternalFlags,
    pub pend_reason: Option<PendReason>,
    pub fail_reason: i32,
    pub exit_code: i32,
    pub signal: i32,
    pub submit_time: u64,
    pub defer_time: u64,
    pub start_time: u64,
    pub finish_time: u64,
    pub tags: BTreeMap<String, String>,
    pub resources: Vec<ResourceRequest>,
    /// Pid assigned by the agent while running, 0 otherwise.
    pub pid: i32,
    pub rusage: Rusage,
    /// Incremented on every mutation.
    pub revision: u64,
    pub dirty: bool,
}

impl Job {
    pub fn is_deleted(&self) -> bool {
        self.internal.contains(InternalFlags::DELETED)
    }

    pub fn is_started(&self) -> bool {
        self.internal.contains(InternalFlags::STARTED)
    }

    /// A job occupies a queue slot while running or dispatched.
    pub fn is_active(&self) -> bool {
        self.state == JobState::Running || self.is_started()
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
