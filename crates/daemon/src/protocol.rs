// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for client and agent communication.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. Unknown
//! fields within a known frame are ignored, so mixed versions coexist.

use gq_core::{
    ErrorKind, Job, JobDelta, JobFilter, JobId, JobState, Queue, QueueDelta, Resource,
    ResourceDelta, Rusage,
};
use gq_storage::ServerStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[path = "protocol_wire.rs"]
mod wire;
pub use wire::{
    decode, encode, read_frame, read_message, write_frame, write_message, ProtocolError,
    DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

/// A job submission as sent by clients. The controller assigns the jobid
/// and submit time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobSubmission {
    pub name: String,
    /// Target queue; the default queue when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// User to run as; the submitting uid when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_uid: Option<u32>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default)]
    pub hold: bool,
    #[serde(default)]
    pub defer_time: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Resource requirements in `name` or `name:count` form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

/// Which job fields a `get_job` response carries. Zero means all fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnFields(pub u32);

impl ReturnFields {
    pub const ALL: ReturnFields = ReturnFields(0);
    pub const JOBID: u32 = 0x01;
    pub const NAME: u32 = 0x02;
    pub const QUEUE: u32 = 0x04;
    pub const STATE: u32 = 0x08;

    fn wants(self, bit: u32) -> bool {
        self.0 == 0 || self.0 & bit != 0
    }

    fn wants_all(self) -> bool {
        self.0 == 0
    }
}

/// Request from a client to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Health check ping
    Ping,

    /// Version handshake
    Hello { version: String },

    AddJob {
        submit: JobSubmission,
    },
    GetJob {
        #[serde(default)]
        filter: JobFilter,
        #[serde(default)]
        fields: ReturnFields,
    },
    ModJob {
        jobid: JobId,
        #[serde(default)]
        delta: JobDelta,
        /// Signal to deliver to the running process; an action, not a
        /// stored field.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    DelJob {
        jobid: JobId,
    },

    AddQueue {
        name: String,
        host: String,
        #[serde(default)]
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_limit: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<u8>,
        #[serde(default)]
        default_queue: bool,
    },
    GetQueue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ModQueue {
        name: String,
        delta: QueueDelta,
    },
    DelQueue {
        name: String,
    },

    AddResource {
        name: String,
        count: u32,
    },
    GetResource {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ModResource {
        name: String,
        delta: ResourceDelta,
    },
    DelResource {
        name: String,
    },

    /// Server-wide statistics
    Stats,
}

/// Response from the controller. Every request gets exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Ok,
    Pong,
    Hello {
        version: String,
    },
    JobId {
        jobid: JobId,
    },
    Jobs {
        jobs: Vec<JobInfo>,
    },
    Queues {
        queues: Vec<QueueInfo>,
    },
    Resources {
        resources: Vec<ResourceInfo>,
    },
    Stats {
        stats: StatsInfo,
    },
    Error {
        kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Response {
    pub fn error(kind: ErrorKind) -> Response {
        Response::Error {
            kind,
            message: None,
        }
    }

    pub fn error_msg(kind: ErrorKind, message: impl Into<String>) -> Response {
        Response::Error {
            kind,
            message: Some(message.into()),
        }
    }
}

/// Job fields returned to clients. Everything beyond the jobid is
/// optional so a field mask can trim the frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobInfo {
    pub jobid: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pend_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nice: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter_uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl JobInfo {
    pub fn from_job(job: &Job, fields: ReturnFields) -> JobInfo {
        let mut info = JobInfo {
            jobid: job.jobid,
            ..JobInfo::default()
        };
        if fields.wants(ReturnFields::NAME) {
            info.name = Some(job.name.clone());
        }
        if fields.wants(ReturnFields::QUEUE) {
            info.queue = Some(job.queue.clone());
        }
        if fields.wants(ReturnFields::STATE) {
            info.state = Some(job.state);
            info.pend_reason = job.pend_reason.map(|r| r.to_string());
        }
        if fields.wants_all() {
            info.priority = Some(job.priority);
            info.nice = Some(job.nice);
            info.submitter_uid = Some(job.submitter_uid);
            info.run_uid = Some(job.run_uid);
            info.args = Some(job.args.clone());
            info.submit_time = Some(job.submit_time);
            info.defer_time = (job.defer_time != 0).then_some(job.defer_time);
            info.start_time = (job.start_time != 0).then_some(job.start_time);
            info.finish_time = (job.finish_time != 0).then_some(job.finish_time);
            info.exit_code = job.state.is_terminal().then_some(job.exit_code);
            info.signal = (job.signal != 0).then_some(job.signal);
            info.pid = (job.pid > 0).then_some(job.pid);
            info.tags = (!job.tags.is_empty()).then(|| job.tags.clone());
            info.resources = (!job.resources.is_empty())
                .then(|| job.resources.iter().map(|r| r.to_string()).collect());
            info.revision = Some(job.revision);
        }
        info
    }
}

/// Queue fields returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub description: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub job_limit: u32,
    pub priority: u8,
    pub open: bool,
    pub started: bool,
    pub default_queue: bool,
    pub running: u32,
    pub pending: u32,
    pub deferred: u32,
    pub holding: u32,
    pub completed: u32,
    pub exited: u32,
    pub unknown: u32,
    pub active: u32,
    pub revision: u64,
}

impl QueueInfo {
    pub fn from_queue(queue: &Queue) -> QueueInfo {
        QueueInfo {
            name: queue.name.clone(),
            description: queue.description.clone(),
            host: queue.host.clone(),
            agent: queue.agent.clone(),
            job_limit: queue.job_limit,
            priority: queue.priority,
            open: queue.is_open(),
            started: queue.is_started(),
            default_queue: queue.default_queue,
            running: queue.stats.running,
            pending: queue.stats.pending,
            deferred: queue.stats.deferred,
            holding: queue.stats.holding,
            completed: queue.stats.completed,
            exited: queue.stats.exited,
            unknown: queue.stats.unknown,
            active: queue.active_count,
            revision: queue.revision,
        }
    }
}

/// Resource fields returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    pub count: u32,
    pub in_use: u32,
    pub revision: u64,
}

impl ResourceInfo {
    pub fn from_resource(resource: &Resource) -> ResourceInfo {
        ResourceInfo {
            name: resource.name.clone(),
            count: resource.count,
            in_use: resource.in_use,
            revision: resource.revision,
        }
    }
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsInfo {
    pub running: u32,
    pub pending: u32,
    pub deferred: u32,
    pub holding: u32,
    pub completed: u32,
    pub exited: u32,
    pub unknown: u32,
    pub total_submitted: u64,
    pub total_started: u64,
    pub total_completed: u64,
    pub total_exited: u64,
    pub total_deleted: u64,
}

impl StatsInfo {
    pub fn from_stats(stats: &ServerStats) -> StatsInfo {
        StatsInfo {
            running: stats.current.running,
            pending: stats.current.pending,
            deferred: stats.current.deferred,
            holding: stats.current.holding,
            completed: stats.current.completed,
            exited: stats.current.exited,
            unknown: stats.current.unknown,
            total_submitted: stats.total.submitted,
            total_started: stats.total.started,
            total_completed: stats.total.completed,
            total_exited: stats.total.exited,
            total_deleted: stats.total.deleted,
        }
    }
}

/// One job the agent tracks, reported during reconciliation. The agent is
/// authoritative for everything in here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconRecord {
    pub jobid: JobId,
    #[serde(default)]
    pub start_time: u64,
    #[serde(default)]
    pub finish_time: u64,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub signal: i32,
    #[serde(default)]
    pub rusage: Rusage,
}

/// Message from an agent to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    /// First message on every agent connection.
    Login { node: String },

    /// Answer to an auth challenge.
    AuthResp {
        nonce: String,
        datetime: u64,
        hmac: String,
    },

    /// Reconciliation: every job the agent currently tracks.
    Recon { jobs: Vec<ReconRecord> },

    JobStarted {
        jobid: JobId,
        pid: i32,
        start_time: u64,
    },

    JobCompleted {
        jobid: JobId,
        exit_code: i32,
        #[serde(default)]
        signal: i32,
        /// The process could not be launched at all.
        #[serde(default)]
        failed_start: bool,
        finish_time: u64,
        #[serde(default)]
        rusage: Rusage,
    },

    /// A remote client tunnels through this agent.
    ProxyConn { pid: i32, uid: u32 },
    /// One framed client request, JSON-encoded.
    ProxyData { pid: i32, data: String },
    ProxyClose { pid: i32 },
}

/// Message from the controller to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerMessage {
    AuthChallenge {
        nonce: String,
    },

    /// Request reconciliation. Carries a timestamp + HMAC over
    /// `(client_nonce, datetime)` when a secret is configured, so the
    /// agent can verify the controller too.
    ReconRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        datetime: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hmac: Option<String>,
    },

    ReconComplete,

    StartJob {
        jobid: JobId,
        name: String,
        queue: String,
        uid: u32,
        nice: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pre_cmd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        post_cmd: Option<String>,
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        env: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },

    StopJob {
        jobid: JobId,
        signal: i32,
    },

    /// One framed client response for a proxied request.
    ProxyData { pid: i32, data: String },
    ProxyClose { pid: i32 },
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
