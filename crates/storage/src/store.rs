// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory object tables and the command apply path.
//!
//! The [`ObjectStore`] owns all jobs, queues, and resources. Durable
//! mutations go through [`ObjectStore::apply`], which is fed by live
//! command dispatch and by journal replay alike, so both produce the same
//! state. Scheduler scratch (pend reasons, Started flags, `pending_start`,
//! `active_count`, resource `in_use`) is mutated directly and is not
//! durable.

use gq_core::{
    Command, InternalFlags, Job, JobFilter, JobId, JobState, Queue, QueueFlags, QueueStats,
    Resource,
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Errors from applying a command. Live dispatch validates commands before
/// journaling them, so these surface mainly when replaying a journal
/// against unexpected state.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("job {0} not found")]
    NoJob(JobId),
    #[error("queue {0:?} not found")]
    NoQueue(String),
    #[error("resource {0:?} not found")]
    NoResource(String),
    #[error("jobid {0} already exists")]
    JobExists(JobId),
    #[error("queue {0:?} already exists")]
    QueueExists(String),
    #[error("resource {0:?} already exists")]
    ResourceExists(String),
}

/// Monotonic lifetime counters. Rebuilt from terminal job states at
/// recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Totals {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub exited: u64,
    pub deleted: u64,
    pub unknown: u64,
}

/// Server-wide statistics: current per-state counters plus totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub current: QueueStats,
    pub total: Totals,
}

/// An object reclaimed by a cleanup sweep; the caller unlinks its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupItem {
    Job(JobId),
    Queue(String),
    Resource(String),
}

pub struct ObjectStore {
    jobs: HashMap<JobId, Job>,
    queues: HashMap<String, Queue>,
    resources: HashMap<String, Resource>,
    stats: ServerStats,
    max_jobid: JobId,
    start_jobid: JobId,
    dirty_jobs: u32,
    dirty_queues: u32,
    dirty_resources: u32,
    /// Set whenever a job state changes; consumed by housekeeping.
    candidate_recalc: bool,
}

impl ObjectStore {
    pub fn new(max_jobid: JobId) -> ObjectStore {
        ObjectStore {
            jobs: HashMap::new(),
            queues: HashMap::new(),
            resources: HashMap::new(),
            stats: ServerStats::default(),
            max_jobid,
            start_jobid: 0,
            dirty_jobs: 0,
            dirty_queues: 0,
            dirty_resources: 0,
            candidate_recalc: false,
        }
    }

    pub fn job(&self, jobid: JobId) -> Option<&Job> {
        self.jobs.get(&jobid)
    }

    pub fn job_mut(&mut self, jobid: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&jobid)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn queue_mut(&mut self, name: &str) -> Option<&mut Queue> {
        self.queues.get_mut(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    pub fn queues_mut(&mut self) -> impl Iterator<Item = &mut Queue> {
        self.queues.values_mut()
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn default_queue(&self) -> Option<&Queue> {
        self.queues
            .values()
            .find(|q| q.default_queue && !q.is_deleted())
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty_jobs + self.dirty_queues + self.dirty_resources > 0
    }

    /// Consume the "a job state changed" flag.
    pub fn take_candidate_recalc(&mut self) -> bool {
        std::mem::take(&mut self.candidate_recalc)
    }

    /// Next free jobid from the rotating cursor, or `None` when the id
    /// space is exhausted. Deleted-but-unflushed jobs still occupy their id.
    pub fn next_jobid(&mut self) -> Option<JobId> {
        let mut id = self.start_jobid;
        for _ in 0..self.max_jobid {
            id = if id >= self.max_jobid { 1 } else { id + 1 };
            if !self.jobs.contains_key(&id) {
                self.start_jobid = id;
                return Some(id);
            }
        }
        None
    }

    /// True if any non-deleted job is on the queue.
    pub fn queue_has_jobs(&self, name: &str) -> bool {
        self.jobs
            .values()
            .any(|j| !j.is_deleted() && j.queue == name)
    }

    /// True if any non-deleted job requires the resource.
    pub fn resource_has_jobs(&self, name: &str) -> bool {
        self.jobs
            .values()
            .any(|j| !j.is_deleted() && j.resources.iter().any(|r| r.name == name))
    }

    /// Select non-deleted jobs matching a filter, ordered by jobid.
    pub fn get_jobs(&self, filter: &JobFilter) -> Vec<&Job> {
        if let Some(jobid) = filter.jobid {
            return self
                .jobs
                .get(&jobid)
                .filter(|j| !j.is_deleted())
                .into_iter()
                .collect();
        }

        let mut matched: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| !j.is_deleted())
            .filter(|j| filter.name.as_deref().is_none_or(|n| j.name == n))
            .filter(|j| filter.queue.as_deref().is_none_or(|q| j.queue == q))
            .filter(|j| filter.state.is_none_or(|mask| mask.contains(j.state)))
            .filter(|j| filter.uid.is_none_or(|uid| j.submitter_uid == uid))
            .filter(|j| {
                filter.tag.as_deref().is_none_or(|tag| match tag.split_once('=') {
                    Some((k, v)) => j.tags.get(k).map(|t| t == v).unwrap_or(false),
                    None => j.tags.contains_key(tag),
                })
            })
            .filter(|j| {
                filter
                    .resource
                    .as_deref()
                    .is_none_or(|r| j.resources.iter().any(|req| req.name == r))
            })
            .collect();
        matched.sort_by_key(|j| j.jobid);
        matched
    }

    fn touch_job(&mut self, jobid: JobId) {
        if let Some(job) = self.jobs.get_mut(&jobid) {
            job.revision += 1;
            if !job.dirty {
                job.dirty = true;
                self.dirty_jobs += 1;
            }
        }
    }

    fn touch_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.get_mut(name) {
            queue.revision += 1;
            if !queue.dirty {
                queue.dirty = true;
                self.dirty_queues += 1;
            }
        }
    }

    fn touch_resource(&mut self, name: &str) {
        if let Some(resource) = self.resources.get_mut(name) {
            resource.revision += 1;
            if !resource.dirty {
                resource.dirty = true;
                self.dirty_resources += 1;
            }
        }
    }

    /// The revision the entity named by `cmd` will carry after apply;
    /// recorded in the journal line ahead of the mutation.
    pub fn next_revision(&self, cmd: &Command) -> u64 {
        match cmd {
            Command::AddJob { .. } | Command::AddQueue { .. } | Command::AddResource { .. } => 1,
            Command::ModJob { jobid, .. }
            | Command::DelJob { jobid }
            | Command::ReleaseDeferred { jobid }
            | Command::JobStarted { jobid, .. }
            | Command::JobCompleted { jobid, .. }
            | Command::MarkUnknown { jobid } => {
                self.jobs.get(jobid).map(|j| j.revision + 1).unwrap_or(0)
            }
            Command::ModQueue { name, .. } | Command::DelQueue { name } => {
                self.queues.get(name).map(|q| q.revision + 1).unwrap_or(0)
            }
            Command::ModResource { name, .. } | Command::DelResource { name } => self
                .resources
                .get(name)
                .map(|r| r.revision + 1)
                .unwrap_or(0),
        }
    }

    /// Move a job to a new state, keeping per-queue and global counters in
    /// step with the transition.
    pub fn change_job_state(
        &mut self,
        jobid: JobId,
        new_state: JobState,
        dirty: bool,
    ) -> Result<(), ApplyError> {
        let job = self.jobs.get_mut(&jobid).ok_or(ApplyError::NoJob(jobid))?;
        let old_state = job.state;
        let queue_name = job.queue.clone();
        job.state = new_state;

        if let Some(queue) = self.queues.get_mut(&queue_name) {
            let old = queue.stats.counter_mut(old_state);
            *old = old.saturating_sub(1);
            *queue.stats.counter_mut(new_state) += 1;
        }
        let old = self.stats.current.counter_mut(old_state);
        *old = old.saturating_sub(1);
        *self.stats.current.counter_mut(new_state) += 1;

        if dirty {
            self.touch_job(jobid);
        }
        self.candidate_recalc = true;
        Ok(())
    }

    /// Apply one durable mutation. This is the only path that changes
    /// persisted object contents.
    pub fn apply(&mut self, cmd: &Command) -> Result<(), ApplyError> {
        match cmd {
            Command::AddJob { spec } => {
                if self.jobs.contains_key(&spec.jobid) {
                    return Err(ApplyError::JobExists(spec.jobid));
                }
                if !self.queues.contains_key(&spec.queue) {
                    return Err(ApplyError::NoQueue(spec.queue.clone()));
                }
                let mut job = spec.materialize();
                job.revision = 1;
                job.dirty = true;
                self.dirty_jobs += 1;

                if let Some(queue) = self.queues.get_mut(&job.queue) {
                    *queue.stats.counter_mut(job.state) += 1;
                }
                *self.stats.current.counter_mut(job.state) += 1;
                self.stats.total.submitted += 1;
                self.candidate_recalc = true;
                self.jobs.insert(spec.jobid, job);
                Ok(())
            }

            Command::ModJob { jobid, delta } => {
                let job = self.jobs.get_mut(jobid).ok_or(ApplyError::NoJob(*jobid))?;

                let mut queue_move = None;
                if let Some(queue) = &delta.queue {
                    if *queue != job.queue {
                        queue_move = Some((job.queue.clone(), queue.clone(), job.state));
                        job.queue = queue.clone();
                    }
                }
                if let Some(name) = &delta.name {
                    job.name = name.clone();
                }
                if let Some(priority) = delta.priority {
                    job.priority = priority;
                }
                if let Some(nice) = delta.nice {
                    job.nice = nice;
                }
                if let Some(env) = &delta.env {
                    job.env = env.clone();
                }
                if let Some(tags) = &delta.tags {
                    job.tags = tags.clone();
                }
                if let Some(resources) = &delta.resources {
                    job.resources = resources.clone();
                }
                if let Some(stdout) = &delta.stdout {
                    job.stdout = Some(stdout.clone());
                }
                if let Some(stderr) = &delta.stderr {
                    job.stderr = Some(stderr.clone());
                }
                if let Some(shell) = &delta.shell {
                    job.shell = Some(shell.clone());
                }

                let mut new_state = None;
                if let Some(defer) = delta.defer_time {
                    job.defer_time = defer;
                    if defer > 0 && matches!(job.state, JobState::Pending | JobState::Holding) {
                        new_state = Some(JobState::Deferred);
                    }
                }
                match delta.hold {
                    Some(true) if matches!(job.state, JobState::Pending | JobState::Deferred) => {
                        new_state = Some(JobState::Holding);
                    }
                    Some(false) if job.state == JobState::Holding => {
                        new_state = Some(JobState::Pending);
                    }
                    _ => {}
                }

                if let Some((old_queue, new_queue, state)) = queue_move {
                    if let Some(queue) = self.queues.get_mut(&old_queue) {
                        let counter = queue.stats.counter_mut(state);
                        *counter = counter.saturating_sub(1);
                    }
                    if let Some(queue) = self.queues.get_mut(&new_queue) {
                        *queue.stats.counter_mut(state) += 1;
                    }
                }
                if let Some(state) = new_state {
                    self.change_job_state(*jobid, state, false)?;
                }
                self.touch_job(*jobid);
                Ok(())
            }

            Command::DelJob { jobid } => {
                let job = self.jobs.get_mut(jobid).ok_or(ApplyError::NoJob(*jobid))?;
                if job.is_deleted() {
                    return Ok(());
                }
                job.internal.insert(InternalFlags::DELETED);
                let state = job.state;
                let queue_name = job.queue.clone();

                if let Some(queue) = self.queues.get_mut(&queue_name) {
                    let counter = queue.stats.counter_mut(state);
                    *counter = counter.saturating_sub(1);
                }
                let counter = self.stats.current.counter_mut(state);
                *counter = counter.saturating_sub(1);
                self.stats.total.deleted += 1;
                self.candidate_recalc = true;
                self.touch_job(*jobid);
                Ok(())
            }

            Command::AddQueue { spec } => {
                if self.queues.contains_key(&spec.name) {
                    return Err(ApplyError::QueueExists(spec.name.clone()));
                }
                if spec.default_queue {
                    self.clear_default_queue();
                }
                let mut queue = spec.materialize();
                queue.revision = 1;
                queue.dirty = true;
                self.dirty_queues += 1;
                self.queues.insert(spec.name.clone(), queue);
                Ok(())
            }

            Command::ModQueue { name, delta } => {
                if !self.queues.contains_key(name) {
                    return Err(ApplyError::NoQueue(name.clone()));
                }
                if delta.default_queue == Some(true) {
                    self.clear_default_queue();
                }
                if let Some(queue) = self.queues.get_mut(name) {
                    if let Some(description) = &delta.description {
                        queue.description = description.clone();
                    }
                    if let Some(host) = &delta.host {
                        queue.host = host.clone();
                    }
                    if let Some(job_limit) = delta.job_limit {
                        queue.job_limit = job_limit;
                    }
                    if let Some(priority) = delta.priority {
                        queue.priority = priority;
                    }
                    if let Some(open) = delta.open {
                        if open {
                            queue.flags.insert(QueueFlags::OPEN);
                        } else {
                            queue.flags.remove(QueueFlags::OPEN);
                        }
                    }
                    if let Some(started) = delta.started {
                        if started {
                            queue.flags.insert(QueueFlags::STARTED);
                        } else {
                            queue.flags.remove(QueueFlags::STARTED);
                        }
                    }
                    if let Some(default_queue) = delta.default_queue {
                        queue.default_queue = default_queue;
                    }
                }
                self.touch_queue(name);
                Ok(())
            }

            Command::DelQueue { name } => {
                let queue = self
                    .queues
                    .get_mut(name)
                    .ok_or_else(|| ApplyError::NoQueue(name.clone()))?;
                queue.internal.insert(InternalFlags::DELETED);
                queue.default_queue = false;
                self.touch_queue(name);
                Ok(())
            }

            Command::AddResource { spec } => {
                if self.resources.contains_key(&spec.name) {
                    return Err(ApplyError::ResourceExists(spec.name.clone()));
                }
                let mut resource = spec.materialize();
                resource.revision = 1;
                resource.dirty = true;
                self.dirty_resources += 1;
                self.resources.insert(spec.name.clone(), resource);
                Ok(())
            }

            Command::ModResource { name, delta } => {
                {
                    let resource = self
                        .resources
                        .get_mut(name)
                        .ok_or_else(|| ApplyError::NoResource(name.clone()))?;
                    if let Some(count) = delta.count {
                        resource.count = count;
                    }
                }
                self.touch_resource(name);
                Ok(())
            }

            Command::DelResource { name } => {
                let resource = self
                    .resources
                    .get_mut(name)
                    .ok_or_else(|| ApplyError::NoResource(name.clone()))?;
                resource.internal.insert(InternalFlags::DELETED);
                self.touch_resource(name);
                Ok(())
            }

            Command::ReleaseDeferred { jobid } => {
                let job = self.jobs.get_mut(jobid).ok_or(ApplyError::NoJob(*jobid))?;
                if job.state != JobState::Deferred {
                    warn!(jobid, state = %job.state, "release of a non-deferred job ignored");
                    return Ok(());
                }
                job.pend_reason = None;
                self.change_job_state(*jobid, JobState::Pending, true)
            }

            Command::JobStarted {
                jobid,
                pid,
                start_time,
            } => {
                let job = self.jobs.get_mut(jobid).ok_or(ApplyError::NoJob(*jobid))?;
                // A dispatched job already holds its queue slot; one
                // confirmed without a dispatch (recon, replay) claims it
                // here.
                let was_active = job.is_active();
                job.internal.remove(InternalFlags::STARTED);
                job.pend_reason = None;
                job.pid = *pid;
                job.start_time = *start_time;
                let queue_name = job.queue.clone();
                if !was_active {
                    if let Some(queue) = self.queues.get_mut(&queue_name) {
                        queue.active_count += 1;
                    }
                }
                self.change_job_state(*jobid, JobState::Running, true)?;
                self.stats.total.started += 1;
                Ok(())
            }

            Command::JobCompleted {
                jobid,
                exit_code,
                signal,
                fail_reason,
                finish_time,
                rusage,
            } => {
                let job = self.jobs.get_mut(jobid).ok_or(ApplyError::NoJob(*jobid))?;
                let was_active = job.is_active();
                if job.is_started() {
                    // Completion without a start confirmation: the job
                    // failed before the agent could report it running.
                    warn!(jobid, "completion received for a job without a start");
                    job.internal.remove(InternalFlags::STARTED);
                }
                job.exit_code = *exit_code;
                job.signal = *signal;
                job.fail_reason = *fail_reason;
                job.pid = 0;
                job.finish_time = *finish_time;
                job.rusage = *rusage;
                job.pend_reason = None;
                let queue_name = job.queue.clone();
                let requests = job.resources.clone();

                if was_active {
                    for req in &requests {
                        if let Some(resource) = self.resources.get_mut(&req.name) {
                            resource.in_use = resource.in_use.saturating_sub(req.count);
                        }
                    }
                    if let Some(queue) = self.queues.get_mut(&queue_name) {
                        queue.active_count = queue.active_count.saturating_sub(1);
                    }
                }

                let final_state = if *exit_code == 0 {
                    JobState::Completed
                } else {
                    JobState::Exited
                };
                self.change_job_state(*jobid, final_state, true)?;
                if *exit_code == 0 {
                    self.stats.total.completed += 1;
                } else {
                    self.stats.total.exited += 1;
                }
                Ok(())
            }

            Command::MarkUnknown { jobid } => {
                let job = self.jobs.get_mut(jobid).ok_or(ApplyError::NoJob(*jobid))?;
                let was_active = job.is_active();
                job.internal.remove(InternalFlags::STARTED);
                job.pend_reason = None;
                let queue_name = job.queue.clone();
                if was_active {
                    if let Some(queue) = self.queues.get_mut(&queue_name) {
                        queue.active_count = queue.active_count.saturating_sub(1);
                    }
                }
                self.change_job_state(*jobid, JobState::Unknown, true)?;
                self.stats.total.unknown += 1;
                Ok(())
            }
        }
    }

    fn clear_default_queue(&mut self) {
        let holders: Vec<String> = self
            .queues
            .values()
            .filter(|q| q.default_queue)
            .map(|q| q.name.clone())
            .collect();
        for name in holders {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.default_queue = false;
            }
            self.touch_queue(&name);
        }
    }

    /// Insert an object loaded from disk. Stats are rebuilt afterwards via
    /// [`ObjectStore::rebuild_stats`].
    pub fn insert_loaded_job(&mut self, job: Job) -> Result<(), ApplyError> {
        if !self.queues.contains_key(&job.queue) {
            return Err(ApplyError::NoQueue(job.queue.clone()));
        }
        if self.jobs.contains_key(&job.jobid) {
            return Err(ApplyError::JobExists(job.jobid));
        }
        self.jobs.insert(job.jobid, job);
        Ok(())
    }

    pub fn insert_loaded_queue(&mut self, queue: Queue) -> Result<(), ApplyError> {
        if self.queues.contains_key(&queue.name) {
            return Err(ApplyError::QueueExists(queue.name.clone()));
        }
        if queue.default_queue {
            self.clear_default_queue();
        }
        self.queues.insert(queue.name.clone(), queue);
        Ok(())
    }

    pub fn insert_loaded_resource(&mut self, resource: Resource) -> Result<(), ApplyError> {
        if self.resources.contains_key(&resource.name) {
            return Err(ApplyError::ResourceExists(resource.name.clone()));
        }
        self.resources.insert(resource.name.clone(), resource);
        Ok(())
    }

    /// Recompute every derived counter from the object tables. Called once
    /// at the end of recovery, after load and journal replay.
    pub fn rebuild_stats(&mut self) {
        self.stats.current = QueueStats::default();
        for queue in self.queues.values_mut() {
            queue.stats = QueueStats::default();
            queue.active_count = 0;
            queue.pending_start = 0;
        }

        let mut totals = Totals::default();
        let mut increments: Vec<(String, JobState, bool)> = Vec::new();
        for job in self.jobs.values() {
            if job.is_deleted() {
                continue;
            }
            increments.push((job.queue.clone(), job.state, job.is_active()));
        }
        for (queue_name, state, active) in increments {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                *queue.stats.counter_mut(state) += 1;
                if active {
                    queue.active_count += 1;
                }
            }
            *self.stats.current.counter_mut(state) += 1;
            totals.submitted += 1;
            match state {
                JobState::Completed => totals.completed += 1,
                JobState::Exited => totals.exited += 1,
                JobState::Unknown => totals.unknown += 1,
                _ => {}
            }
        }
        totals.started = totals.completed + totals.exited + self.stats.current.running as u64;
        self.stats.total = totals;
    }

    /// Move every dirty object into a save plan: the dirty flag is cleared,
    /// Flushing is set, and a clone of the object is returned. Mutations
    /// after this point re-dirty the object for the next save cycle.
    pub fn take_dirty(&mut self) -> (Vec<Job>, Vec<Queue>, Vec<Resource>) {
        let mut jobs = Vec::new();
        for job in self.jobs.values_mut() {
            if job.dirty {
                job.dirty = false;
                job.internal.insert(InternalFlags::FLUSHING);
                jobs.push(job.clone());
            }
        }
        let mut queues = Vec::new();
        for queue in self.queues.values_mut() {
            if queue.dirty {
                queue.dirty = false;
                queue.internal.insert(InternalFlags::FLUSHING);
                queues.push(queue.clone());
            }
        }
        let mut resources = Vec::new();
        for resource in self.resources.values_mut() {
            if resource.dirty {
                resource.dirty = false;
                resource.internal.insert(InternalFlags::FLUSHING);
                resources.push(resource.clone());
            }
        }
        self.dirty_jobs = 0;
        self.dirty_queues = 0;
        self.dirty_resources = 0;
        jobs.sort_by_key(|j| j.jobid);
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        (jobs, queues, resources)
    }

    /// Clear the Flushing flag after a save completes.
    pub fn clear_flushing(&mut self, jobs: &[JobId], queues: &[String], resources: &[String]) {
        for jobid in jobs {
            if let Some(job) = self.jobs.get_mut(jobid) {
                job.internal.remove(InternalFlags::FLUSHING);
            }
        }
        for name in queues {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.internal.remove(InternalFlags::FLUSHING);
            }
        }
        for name in resources {
            if let Some(resource) = self.resources.get_mut(name) {
                resource.internal.remove(InternalFlags::FLUSHING);
            }
        }
    }

    /// Reclaim up to `max` deleted objects that are neither dirty nor
    /// flushing. Jobs are swept first so queues and resources they
    /// referenced become reclaimable on later sweeps.
    pub fn cleanup(&mut self, max: u32) -> Vec<CleanupItem> {
        let max = if max == 0 { 10 } else { max } as usize;
        let mut items = Vec::new();

        let reclaimable = |internal: InternalFlags, dirty: bool| {
            internal.contains(InternalFlags::DELETED)
                && !dirty
                && !internal.contains(InternalFlags::FLUSHING)
        };

        let mut jobids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| reclaimable(j.internal, j.dirty))
            .map(|j| j.jobid)
            .collect();
        jobids.sort_unstable();
        for jobid in jobids.into_iter().take(max) {
            self.jobs.remove(&jobid);
            items.push(CleanupItem::Job(jobid));
        }

        if items.len() < max {
            let mut names: Vec<String> = self
                .queues
                .values()
                .filter(|q| reclaimable(q.internal, q.dirty))
                .filter(|q| !self.jobs.values().any(|j| j.queue == q.name))
                .map(|q| q.name.clone())
                .collect();
            names.sort();
            for name in names.into_iter().take(max - items.len()) {
                self.queues.remove(&name);
                items.push(CleanupItem::Queue(name));
            }
        }

        if items.len() < max {
            let mut names: Vec<String> = self
                .resources
                .values()
                .filter(|r| reclaimable(r.internal, r.dirty))
                .filter(|r| {
                    !self
                        .jobs
                        .values()
                        .any(|j| j.resources.iter().any(|req| req.name == r.name))
                })
                .map(|r| r.name.clone())
                .collect();
            names.sort();
            for name in names.into_iter().take(max - items.len()) {
                self.resources.remove(&name);
                items.push(CleanupItem::Resource(name));
            }
        }

        items
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
