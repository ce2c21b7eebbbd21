// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client command dispatch: validate, journal, apply, respond.
//!
//! Every request produces exactly one response and at most one journal
//! record. Reads never journal. Typed failures come back as error frames;
//! only journal/apply faults propagate (and end the controller).

use crate::auth::{self, PERM_QUEUE, PERM_READ, PERM_SETUID, PERM_WRITE, QUEUE_PERM_SUBMIT};
use crate::engine::{Engine, EngineError};
use crate::protocol::{
    ControllerMessage, JobInfo, JobSubmission, QueueInfo, Request, ResourceInfo, Response,
    ReturnFields, StatsInfo, PROTOCOL_VERSION,
};
use gq_core::{
    Clock, Command, ErrorKind, JobDelta, JobFilter, JobId, JobSpec, JobState, QueueDelta,
    QueueSpec, ResourceDelta, ResourceRequest, ResourceSpec, DEFAULT_JOB_PRIORITY,
};
use gq_core::queue::{DEFAULT_QUEUE_LIMIT, DEFAULT_QUEUE_PRIORITY};
use tracing::{debug, info};

/// Queue and resource names keep to a sane charset and length.
const NAME_MAX: usize = 64;
const NAME_INVALID_CHARS: [char; 4] = ['/', '\\', ' ', '$'];
/// Upper bound on a queue's concurrent job limit.
const QUEUE_MAX_LIMIT: u32 = 1024;

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= NAME_MAX
        && !name.contains(NAME_INVALID_CHARS)
        && name.chars().all(|c| !c.is_control())
}

impl<C: Clock> Engine<C> {
    /// Handle one client request. `Err` is reserved for fatal engine
    /// faults; client-visible failures are `Ok(Response::Error { .. })`.
    pub fn handle_client(&mut self, uid: u32, request: Request) -> Result<Response, EngineError> {
        let perms = auth::client_perms(&*self.accounts, &self.config, uid);
        let need = |bit: u8| -> Option<Response> {
            (perms & bit != bit).then(|| Response::error(ErrorKind::NoPerm))
        };

        match request {
            Request::Ping => Ok(Response::Pong),
            Request::Hello { version } => {
                debug!(client_version = %version, "client handshake");
                Ok(Response::Hello {
                    version: PROTOCOL_VERSION.to_string(),
                })
            }

            Request::AddJob { submit } => {
                if let Some(denied) = need(PERM_WRITE) {
                    return Ok(denied);
                }
                self.add_job(uid, perms, submit)
            }
            Request::GetJob { filter, fields } => {
                if let Some(denied) = need(PERM_READ) {
                    return Ok(denied);
                }
                Ok(self.get_job(&filter, fields))
            }
            Request::ModJob {
                jobid,
                delta,
                signal,
            } => {
                if let Some(denied) = need(PERM_WRITE) {
                    return Ok(denied);
                }
                self.mod_job(uid, jobid, delta, signal)
            }
            Request::DelJob { jobid } => {
                if let Some(denied) = need(PERM_WRITE) {
                    return Ok(denied);
                }
                self.del_job(uid, jobid)
            }

            Request::AddQueue {
                name,
                host,
                description,
                job_limit,
                priority,
                default_queue,
            } => {
                if let Some(denied) = need(PERM_QUEUE) {
                    return Ok(denied);
                }
                self.add_queue(uid, name, host, description, job_limit, priority, default_queue)
            }
            Request::GetQueue { name } => {
                if let Some(denied) = need(PERM_READ) {
                    return Ok(denied);
                }
                Ok(self.get_queue(name.as_deref()))
            }
            Request::ModQueue { name, delta } => {
                if let Some(denied) = need(PERM_QUEUE) {
                    return Ok(denied);
                }
                self.mod_queue(uid, &name, delta)
            }
            Request::DelQueue { name } => {
                if let Some(denied) = need(PERM_QUEUE) {
                    return Ok(denied);
                }
                self.del_queue(uid, &name)
            }

            Request::AddResource { name, count } => {
                if let Some(denied) = need(PERM_QUEUE) {
                    return Ok(denied);
                }
                self.add_resource(uid, &name, count)
            }
            Request::GetResource { name } => {
                if let Some(denied) = need(PERM_READ) {
                    return Ok(denied);
                }
                Ok(self.get_resource(name.as_deref()))
            }
            Request::ModResource { name, delta } => {
                if let Some(denied) = need(PERM_QUEUE) {
                    return Ok(denied);
                }
                self.mod_resource(uid, &name, delta)
            }
            Request::DelResource { name } => {
                if let Some(denied) = need(PERM_QUEUE) {
                    return Ok(denied);
                }
                self.del_resource(uid, &name)
            }

            Request::Stats => {
                if let Some(denied) = need(PERM_READ) {
                    return Ok(denied);
                }
                let store = self.store.lock();
                Ok(Response::Stats {
                    stats: StatsInfo::from_stats(store.stats()),
                })
            }
        }
    }

    fn add_job(
        &mut self,
        uid: u32,
        perms: u8,
        submit: JobSubmission,
    ) -> Result<Response, EngineError> {
        if submit.args.is_empty() {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "no command specified",
            ));
        }
        if submit.name.is_empty() || submit.name.len() > NAME_MAX {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "invalid job name",
            ));
        }

        let run_uid = submit.run_uid.unwrap_or(uid);
        if run_uid == 0 {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "jobs may not run as root",
            ));
        }
        if run_uid != uid && perms & PERM_SETUID == 0 {
            return Ok(Response::error(ErrorKind::NoPerm));
        }
        if self.accounts.user(run_uid).is_none() {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "run user not found",
            ));
        }

        let mut resources = Vec::with_capacity(submit.resources.len());
        for spec in &submit.resources {
            match ResourceRequest::parse(spec) {
                Some(request) => resources.push(request),
                None => {
                    return Ok(Response::error_msg(
                        ErrorKind::InvalidArgument,
                        format!("bad resource request {spec:?}"),
                    ))
                }
            }
        }

        let now_secs = self.clock.epoch_secs();
        let now_ms = self.clock.epoch_ms();

        let mut store = self.store.lock();

        let queue_name = match &submit.queue {
            Some(name) => name.clone(),
            None => match store.default_queue() {
                Some(queue) => queue.name.clone(),
                None => return Ok(Response::error(ErrorKind::NoQueue)),
            },
        };
        let Some(queue) = store.queue(&queue_name).filter(|q| !q.is_deleted()) else {
            return Ok(Response::error(ErrorKind::NoQueue));
        };
        if !queue.is_open() {
            return Ok(Response::error_msg(
                ErrorKind::InvalidState,
                "queue is closed to submissions",
            ));
        }
        if !auth::check_queue_acl(&*self.accounts, queue, uid, QUEUE_PERM_SUBMIT, perms) {
            return Ok(Response::error(ErrorKind::NoPerm));
        }

        for request in &resources {
            if store
                .resource(&request.name)
                .filter(|r| !r.is_deleted())
                .is_none()
            {
                return Ok(Response::error(ErrorKind::NoResource));
            }
        }

        let jobid = match store.next_jobid() {
            Some(jobid) => jobid,
            None => {
                // Id space exhausted: reclaim what we can and retry once.
                let items = store.cleanup(self.config.max_clean_job);
                for item in &items {
                    let _ = match item {
                        gq_storage::CleanupItem::Job(jobid) => gq_storage::remove_object(
                            &gq_storage::job_path(&self.config.state_dir, *jobid),
                        ),
                        gq_storage::CleanupItem::Queue(name) => gq_storage::remove_object(
                            &gq_storage::queue_path(&self.config.state_dir, name),
                        ),
                        gq_storage::CleanupItem::Resource(name) => gq_storage::remove_object(
                            &gq_storage::resource_path(&self.config.state_dir, name),
                        ),
                    };
                }
                match store.next_jobid() {
                    Some(jobid) => jobid,
                    None => {
                        return Ok(Response::error_msg(
                            ErrorKind::OutOfMemory,
                            "no free jobids",
                        ))
                    }
                }
            }
        };

        let state = if submit.defer_time > now_secs {
            JobState::Deferred
        } else if submit.hold {
            JobState::Holding
        } else {
            JobState::Pending
        };

        let spec = JobSpec {
            jobid,
            name: submit.name,
            queue: queue_name,
            submitter_uid: uid,
            run_uid,
            shell: submit.shell,
            pre_cmd: submit.pre_cmd,
            post_cmd: submit.post_cmd,
            args: submit.args,
            env: submit.env,
            stdout: submit.stdout,
            stderr: submit.stderr,
            nice: submit.nice,
            priority: submit.priority.unwrap_or(DEFAULT_JOB_PRIORITY),
            state,
            submit_time: now_secs,
            defer_time: if state == JobState::Deferred {
                submit.defer_time
            } else {
                0
            },
            tags: submit.tags,
            resources,
        };

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::AddJob { spec },
            now_ms,
        )?;
        info!(jobid, uid, "job submitted");
        Ok(Response::JobId { jobid })
    }

    fn get_job(&mut self, filter: &JobFilter, fields: ReturnFields) -> Response {
        let store = self.store.lock();
        let jobs = store.get_jobs(filter);
        if filter.jobid.is_some() && jobs.is_empty() {
            return Response::error(ErrorKind::NoJob);
        }
        Response::Jobs {
            jobs: jobs
                .into_iter()
                .map(|job| JobInfo::from_job(job, fields))
                .collect(),
        }
    }

    fn mod_job(
        &mut self,
        uid: u32,
        jobid: JobId,
        delta: JobDelta,
        signal: Option<i32>,
    ) -> Result<Response, EngineError> {
        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();

        let Some(job) = store.job(jobid).filter(|j| !j.is_deleted()) else {
            return Ok(Response::error(ErrorKind::NoJob));
        };
        let active = job.is_active();
        let queue_name = job.queue.clone();

        // A signal is an action on the running process, not a field edit.
        if let Some(signal) = signal {
            if job.state != JobState::Running {
                return Ok(Response::error_msg(
                    ErrorKind::InvalidState,
                    "job is not running",
                ));
            }
            let Some(host) = store.queue(&queue_name).and_then(|q| q.agent.clone()) else {
                return Ok(Response::error_msg(
                    ErrorKind::InvalidState,
                    "agent is not connected",
                ));
            };
            self.registry
                .send_to(&host, ControllerMessage::StopJob { jobid, signal });
            info!(jobid, signal, "signal forwarded to agent");
        }

        if delta.is_empty() {
            return Ok(if signal.is_some() {
                Response::Ok
            } else {
                Response::error(ErrorKind::NothingToUpdate)
            });
        }

        if active && (delta.hold.is_some() || delta.defer_time.is_some() || delta.queue.is_some())
        {
            return Ok(Response::error_msg(
                ErrorKind::InvalidState,
                "job is active",
            ));
        }
        if let Some(target) = &delta.queue {
            if store.queue(target).filter(|q| !q.is_deleted()).is_none() {
                return Ok(Response::error(ErrorKind::NoQueue));
            }
        }
        if let Some(resources) = &delta.resources {
            for request in resources {
                if store
                    .resource(&request.name)
                    .filter(|r| !r.is_deleted())
                    .is_none()
                {
                    return Ok(Response::error(ErrorKind::NoResource));
                }
            }
        }

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::ModJob { jobid, delta },
            now_ms,
        )?;
        Ok(Response::Ok)
    }

    fn del_job(&mut self, uid: u32, jobid: JobId) -> Result<Response, EngineError> {
        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();

        let Some(job) = store.job(jobid).filter(|j| !j.is_deleted()) else {
            return Ok(Response::error(ErrorKind::NoJob));
        };
        if job.is_active() {
            return Ok(Response::error_msg(
                ErrorKind::InvalidState,
                "running jobs must be stopped before deletion",
            ));
        }

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::DelJob { jobid },
            now_ms,
        )?;
        info!(jobid, uid, "job deleted");
        Ok(Response::Ok)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_queue(
        &mut self,
        uid: u32,
        name: String,
        host: String,
        description: String,
        job_limit: Option<u32>,
        priority: Option<u8>,
        default_queue: bool,
    ) -> Result<Response, EngineError> {
        if !valid_name(&name) {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "invalid queue name",
            ));
        }
        if host.is_empty() {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "queue host is required",
            ));
        }
        let job_limit = job_limit.unwrap_or(DEFAULT_QUEUE_LIMIT);
        if job_limit > QUEUE_MAX_LIMIT {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "job limit too large",
            ));
        }

        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();
        if store.queue(&name).is_some() {
            return Ok(Response::error(ErrorKind::QueueExists));
        }

        let spec = QueueSpec {
            name: name.clone(),
            description,
            host,
            job_limit,
            priority: priority.unwrap_or(DEFAULT_QUEUE_PRIORITY),
            default_queue,
        };
        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::AddQueue { spec },
            now_ms,
        )?;
        if let Some(queue) = store.queue_mut(&name) {
            auth::apply_queue_acls(&*self.accounts, &self.config, queue);
        }
        info!(queue = %name, "queue added");
        Ok(Response::Ok)
    }

    fn get_queue(&mut self, name: Option<&str>) -> Response {
        let store = self.store.lock();
        match name {
            Some(name) => match store.queue(name).filter(|q| !q.is_deleted()) {
                Some(queue) => Response::Queues {
                    queues: vec![QueueInfo::from_queue(queue)],
                },
                None => Response::error(ErrorKind::NoQueue),
            },
            None => {
                let mut queues: Vec<QueueInfo> = store
                    .queues()
                    .filter(|q| !q.is_deleted())
                    .map(QueueInfo::from_queue)
                    .collect();
                queues.sort_by(|a, b| a.name.cmp(&b.name));
                Response::Queues { queues }
            }
        }
    }

    fn mod_queue(
        &mut self,
        uid: u32,
        name: &str,
        delta: QueueDelta,
    ) -> Result<Response, EngineError> {
        if delta.is_empty() {
            return Ok(Response::error(ErrorKind::NothingToUpdate));
        }
        if let Some(limit) = delta.job_limit {
            if limit > QUEUE_MAX_LIMIT {
                return Ok(Response::error_msg(
                    ErrorKind::InvalidArgument,
                    "job limit too large",
                ));
            }
        }

        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();
        if store.queue(name).filter(|q| !q.is_deleted()).is_none() {
            return Ok(Response::error(ErrorKind::NoQueue));
        }

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::ModQueue {
                name: name.to_string(),
                delta,
            },
            now_ms,
        )?;
        Ok(Response::Ok)
    }

    fn del_queue(&mut self, uid: u32, name: &str) -> Result<Response, EngineError> {
        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();

        if store.queue(name).filter(|q| !q.is_deleted()).is_none() {
            return Ok(Response::error(ErrorKind::NoQueue));
        }
        if store.queue_has_jobs(name) {
            return Ok(Response::error(ErrorKind::QueueNotEmpty));
        }

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::DelQueue {
                name: name.to_string(),
            },
            now_ms,
        )?;
        info!(queue = %name, "queue deleted");
        Ok(Response::Ok)
    }

    fn add_resource(&mut self, uid: u32, name: &str, count: u32) -> Result<Response, EngineError> {
        if !valid_name(name) {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "invalid resource name",
            ));
        }
        if count == 0 {
            return Ok(Response::error_msg(
                ErrorKind::InvalidArgument,
                "resource count must be positive",
            ));
        }

        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();
        if store.resource(name).is_some() {
            return Ok(Response::error(ErrorKind::ResourceExists));
        }

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::AddResource {
                spec: ResourceSpec {
                    name: name.to_string(),
                    count,
                },
            },
            now_ms,
        )?;
        info!(resource = %name, count, "resource added");
        Ok(Response::Ok)
    }

    fn get_resource(&mut self, name: Option<&str>) -> Response {
        let store = self.store.lock();
        match name {
            Some(name) => match store.resource(name).filter(|r| !r.is_deleted()) {
                Some(resource) => Response::Resources {
                    resources: vec![ResourceInfo::from_resource(resource)],
                },
                None => Response::error(ErrorKind::NoResource),
            },
            None => {
                let mut resources: Vec<ResourceInfo> = store
                    .resources()
                    .filter(|r| !r.is_deleted())
                    .map(ResourceInfo::from_resource)
                    .collect();
                resources.sort_by(|a, b| a.name.cmp(&b.name));
                Response::Resources { resources }
            }
        }
    }

    fn mod_resource(
        &mut self,
        uid: u32,
        name: &str,
        delta: ResourceDelta,
    ) -> Result<Response, EngineError> {
        if delta.is_empty() {
            return Ok(Response::error(ErrorKind::NothingToUpdate));
        }

        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();
        let Some(resource) = store.resource(name).filter(|r| !r.is_deleted()) else {
            return Ok(Response::error(ErrorKind::NoResource));
        };
        if let Some(count) = delta.count {
            if count < resource.in_use {
                return Ok(Response::error_msg(
                    ErrorKind::InvalidArgument,
                    "count below units in use",
                ));
            }
        }

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::ModResource {
                name: name.to_string(),
                delta,
            },
            now_ms,
        )?;
        Ok(Response::Ok)
    }

    fn del_resource(&mut self, uid: u32, name: &str) -> Result<Response, EngineError> {
        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();

        if store.resource(name).filter(|r| !r.is_deleted()).is_none() {
            return Ok(Response::error(ErrorKind::NoResource));
        }
        if store.resource_has_jobs(name) {
            return Ok(Response::error_msg(
                ErrorKind::InvalidState,
                "resource is required by jobs",
            ));
        }

        Self::commit_locked(
            &mut self.journal,
            &mut store,
            uid,
            &Command::DelResource {
                name: name.to_string(),
            },
            now_ms,
        )?;
        info!(resource = %name, "resource deleted");
        Ok(Response::Ok)
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
