// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Journaled command vocabulary.
//!
//! Every durable mutation is described by one [`Command`]. Live dispatch
//! validates a request, appends the command to the journal, then applies it
//! to the object store; recovery replays the same commands through the same
//! apply path.

use crate::job::{
    InternalFlags, Job, JobId, JobState, ResourceRequest, Rusage, StateMask, DEFAULT_JOB_PRIORITY,
};
use crate::queue::{Queue, QueueFlags, QueueStats, DEFAULT_QUEUE_LIMIT, DEFAULT_QUEUE_PRIORITY};
use crate::resource::Resource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Fully-materialized job creation record.
///
/// The jobid, initial state, and submit time are assigned at dispatch so
/// replay reproduces the job exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub jobid: JobId,
    pub name: String,
    pub queue: String,
    pub submitter_uid: u32,
    pub run_uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_cmd: Option<String>,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub nice: i32,
    pub priority: u8,
    pub state: JobState,
    pub submit_time: u64,
    #[serde(default)]
    pub defer_time: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRequest>,
}

impl JobSpec {
    pub fn materialize(&self) -> Job {
        Job {
            jobid: self.jobid,
            name: self.name.clone(),
            queue: self.queue.clone(),
            submitter_uid: self.submitter_uid,
            run_uid: self.run_uid,
            shell: self.shell.clone(),
            pre_cmd: self.pre_cmd.clone(),
            post_cmd: self.post_cmd.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            nice: self.nice,
            priority: self.priority,
            state: self.state,
            internal: InternalFlags::default(),
            pend_reason: None,
            fail_reason: 0,
            exit_code: 0,
            signal: 0,
            submit_time: self.submit_time,
            defer_time: self.defer_time,
            start_time: 0,
            finish_time: 0,
            tags: self.tags.clone(),
            resources: self.resources.clone(),
            pid: 0,
            rusage: Rusage::default(),
            revision: 0,
            dirty: false,
        }
    }
}

impl Default for JobSpec {
    fn default() -> Self {
        JobSpec {
            jobid: 0,
            name: String::new(),
            queue: String::new(),
            submitter_uid: 0,
            run_uid: 0,
            shell: None,
            pre_cmd: None,
            post_cmd: None,
            args: Vec::new(),
            env: Vec::new(),
            stdout: None,
            stderr: None,
            nice: 0,
            priority: DEFAULT_JOB_PRIORITY,
            state: JobState::Pending,
            submit_time: 0,
            defer_time: 0,
            tags: BTreeMap::new(),
            resources: Vec::new(),
        }
    }
}

/// Queue creation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub host: String,
    pub job_limit: u32,
    pub priority: u8,
    #[serde(default)]
    pub default_queue: bool,
}

impl QueueSpec {
    pub fn materialize(&self) -> Queue {
        Queue {
            name: self.name.clone(),
            description: self.description.clone(),
            host: self.host.clone(),
            agent: None,
            job_limit: self.job_limit,
            priority: self.priority,
            flags: QueueFlags::default(),
            default_queue: self.default_queue,
            permissions: HashMap::new(),
            stats: QueueStats::default(),
            active_count: 0,
            pending_start: 0,
            internal: InternalFlags::default(),
            revision: 0,
            dirty: false,
        }
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        QueueSpec {
            name: String::new(),
            description: String::new(),
            host: String::new(),
            job_limit: DEFAULT_QUEUE_LIMIT,
            priority: DEFAULT_QUEUE_PRIORITY,
            default_queue: false,
        }
    }
}

/// Resource creation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub count: u32,
}

impl ResourceSpec {
    pub fn materialize(&self) -> Resource {
        Resource {
            name: self.name.clone(),
            count: self.count,
            in_use: 0,
            internal: InternalFlags::default(),
            revision: 0,
            dirty: false,
        }
    }
}

/// Field updates for `mod_job`. Unset fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nice: Option<i32>,
    /// `Some(true)` holds a pending job; `Some(false)` releases a held one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<ResourceRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl JobDelta {
    pub fn is_empty(&self) -> bool {
        self == &JobDelta::default()
    }
}

/// Field updates for `mod_queue`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_queue: Option<bool>,
}

impl QueueDelta {
    pub fn is_empty(&self) -> bool {
        self == &QueueDelta::default()
    }
}

/// Field updates for `mod_resource`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl ResourceDelta {
    pub fn is_empty(&self) -> bool {
        self.count.is_none()
    }
}

/// Selection criteria for `get_job`. A jobid short-circuits everything
/// else; otherwise all present fields must match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobid: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// `key` for presence or `key=value` for equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// A durable state mutation, exactly as written to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    AddJob { spec: JobSpec },
    ModJob { jobid: JobId, delta: JobDelta },
    DelJob { jobid: JobId },
    AddQueue { spec: QueueSpec },
    ModQueue { name: String, delta: QueueDelta },
    DelQueue { name: String },
    AddResource { spec: ResourceSpec },
    ModResource { name: String, delta: ResourceDelta },
    DelResource { name: String },
    /// Deferred job released to Pending by the timer or scheduler.
    ReleaseDeferred { jobid: JobId },
    /// Agent confirmed the job process has started.
    JobStarted {
        jobid: JobId,
        pid: i32,
        start_time: u64,
    },
    /// Agent reported the job process has finished.
    JobCompleted {
        jobid: JobId,
        exit_code: i32,
        signal: i32,
        #[serde(default)]
        fail_reason: i32,
        finish_time: u64,
        rusage: Rusage,
    },
    /// The agent owning this job vanished without reporting completion.
    MarkUnknown { jobid: JobId },
}

impl Command {
    /// Command-name column of the journal record.
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddJob { .. } => "ADD_JOB",
            Command::ModJob { .. } => "MOD_JOB",
            Command::DelJob { .. } => "DEL_JOB",
            Command::AddQueue { .. } => "ADD_QUEUE",
            Command::ModQueue { .. } => "MOD_QUEUE",
            Command::DelQueue { .. } => "DEL_QUEUE",
            Command::AddResource { .. } => "ADD_RESOURCE",
            Command::ModResource { .. } => "MOD_RESOURCE",
            Command::DelResource { .. } => "DEL_RESOURCE",
            Command::ReleaseDeferred { .. } => "RELEASE_DEFERRED",
            Command::JobStarted { .. } => "JOB_STARTED",
            Command::JobCompleted { .. } => "JOB_COMPLETED",
            Command::MarkUnknown { .. } => "MARK_UNKNOWN",
        }
    }

    /// Jobid column of the journal record, 0 when not job-scoped.
    pub fn jobid(&self) -> JobId {
        match self {
            Command::AddJob { spec } => spec.jobid,
            Command::ModJob { jobid, .. }
            | Command::DelJob { jobid }
            | Command::ReleaseDeferred { jobid }
            | Command::JobStarted { jobid, .. }
            | Command::JobCompleted { jobid, .. }
            | Command::MarkUnknown { jobid } => *jobid,
            _ => 0,
        }
    }
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
