// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue record and per-queue statistics.

use crate::job::{InternalFlags, JobState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default per-queue concurrent job limit.
pub const DEFAULT_QUEUE_LIMIT: u32 = 1;
/// Default queue priority.
pub const DEFAULT_QUEUE_PRIORITY: u8 = 100;

/// Queue state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueFlags(u8);

impl QueueFlags {
    /// Jobs on this queue may be dispatched. Set while an agent is bound.
    pub const STARTED: QueueFlags = QueueFlags(0x01);
    /// Jobs may be submitted to this queue.
    pub const OPEN: QueueFlags = QueueFlags(0x02);

    pub fn contains(self, flag: QueueFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: QueueFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: QueueFlags) {
        self.0 &= !flag.0;
    }
}

impl Default for QueueFlags {
    fn default() -> Self {
        QueueFlags::OPEN
    }
}

/// Per-state job counters, maintained on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub running: u32,
    pub pending: u32,
    pub deferred: u32,
    pub holding: u32,
    pub completed: u32,
    pub exited: u32,
    pub unknown: u32,
}

impl QueueStats {
    pub fn counter_mut(&mut self, state: JobState) -> &mut u32 {
        match state {
            JobState::Running => &mut self.running,
            JobState::Pending => &mut self.pending,
            JobState::Deferred => &mut self.deferred,
            JobState::Holding => &mut self.holding,
            JobState::Completed => &mut self.completed,
            JobState::Exited => &mut self.exited,
            JobState::Unknown => &mut self.unknown,
        }
    }

    pub fn total(&self) -> u32 {
        self.running
            + self.pending
            + self.deferred
            + self.holding
            + self.completed
            + self.exited
            + self.unknown
    }
}

/// A job queue bound to a single execution host.
#[derive(Debug, Clone, PartialEq)]
pub struct Queue {
    pub name: String,
    pub description: String,
    /// Exact hostname; `"localhost"` resolves to the controller's own
    /// hostname at agent bind time.
    pub host: String,
    /// Hostname of the bound agent, while one is connected.
    pub agent: Option<String>,
    pub job_limit: u32,
    pub priority: u8,
    pub flags: QueueFlags,
    pub default_queue: bool,
    /// Per-gid permission bits derived from configured queue ACLs.
    pub permissions: HashMap<u32, u8>,
    pub stats: QueueStats,
    /// Jobs currently running or dispatched on this queue.
    pub active_count: u32,
    /// Scheduler scratch, seeded from `active_count` each tick.
    pub pending_start: u32,
    pub internal: InternalFlags,
    pub revision: u64,
    pub dirty: bool,
}

impl Queue {
    pub fn is_deleted(&self) -> bool {
        self.internal.contains(InternalFlags::DELETED)
    }

    pub fn is_started(&self) -> bool {
        self.flags.contains(QueueFlags::STARTED)
    }

    pub fn is_open(&self) -> bool {
        self.flags.contains(QueueFlags::OPEN)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
