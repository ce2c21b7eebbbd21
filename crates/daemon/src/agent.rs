// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent registry and the agent protocol state machine.
//!
//! One agent per host. The server-side handshake runs
//! `AwaitLogin -> (AwaitAuthResp) -> ReconPending -> Ready`: the login
//! binds queues, an optional HMAC challenge authenticates the agent, and
//! reconciliation replays the agent's view of its jobs before any new
//! dispatches. The agent is authoritative for jobs it owns.

use crate::auth;
use crate::engine::{Engine, EngineError, LoginRefused};
use crate::notify::Notice;
use crate::protocol::{AgentMessage, ControllerMessage, ReconRecord, Request, Response};
use gq_core::{Clock, Command, InternalFlags, JobId, JobState, PendReason, QueueFlags};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Server-side handshake phase for one agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// Challenge sent, waiting for the HMAC response.
    AwaitAuthResp,
    /// Recon requested, waiting for the agent's job records.
    ReconPending,
    /// Handshake complete; lifecycle messages accepted.
    Ready,
}

/// A live, logged-in agent connection.
pub struct AgentHandle {
    pub host: String,
    pub phase: AgentPhase,
    pub authenticated: bool,
    /// Server nonce issued with the auth challenge.
    pub nonce: Option<String>,
    sender: UnboundedSender<ControllerMessage>,
    /// Proxied remote clients keyed by their pid on the agent host.
    proxies: HashMap<i32, u32>,
}

impl AgentHandle {
    pub fn send(&self, msg: ControllerMessage) {
        if self.sender.send(msg).is_err() {
            debug!(host = %self.host, "dropped message to closing agent");
        }
    }
}

/// Authenticated agent connections keyed by hostname.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentHandle>,
}

impl AgentRegistry {
    pub fn new() -> AgentRegistry {
        AgentRegistry::default()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.agents.contains_key(host)
    }

    pub fn get(&self, host: &str) -> Option<&AgentHandle> {
        self.agents.get(host)
    }

    pub fn get_mut(&mut self, host: &str) -> Option<&mut AgentHandle> {
        self.agents.get_mut(host)
    }

    pub fn insert(&mut self, handle: AgentHandle) {
        self.agents.insert(handle.host.clone(), handle);
    }

    pub fn remove(&mut self, host: &str) -> Option<AgentHandle> {
        self.agents.remove(host)
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.agents.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Send to the agent bound to `host`, if connected and ready.
    pub fn send_to(&self, host: &str, msg: ControllerMessage) -> bool {
        match self.agents.get(host) {
            Some(handle) => {
                handle.send(msg);
                true
            }
            None => false,
        }
    }
}

impl<C: Clock> Engine<C> {
    /// Handle the `AGENT_LOGIN` that opens every agent connection.
    ///
    /// Binds the agent to its queues and starts the handshake: an auth
    /// challenge when a secret is configured, otherwise an immediate recon
    /// request.
    pub fn agent_login(
        &mut self,
        host: &str,
        sender: UnboundedSender<ControllerMessage>,
    ) -> Result<(), LoginRefused> {
        let queue_hosts: Vec<String> = {
            let store = self.store.lock();
            store
                .queues()
                .filter(|q| !q.is_deleted())
                .map(|q| {
                    if q.host == "localhost" {
                        self.hostname.clone()
                    } else {
                        q.host.clone()
                    }
                })
                .collect()
        };
        if !self.config.allows_agent(host, &queue_hosts) {
            warn!(host, "refusing agent from unconfigured host");
            return Err(LoginRefused::UnknownHost);
        }
        if self.registry.contains(host) {
            warn!(host, "refusing duplicate agent connection");
            return Err(LoginRefused::AlreadyConnected);
        }

        // Bind matching queues. They are not Started until the recon
        // completes; jobs pending on them show the agent is on its way.
        {
            let hostname = host.to_string();
            let me = self.hostname.clone();
            let mut store = self.store.lock();
            let bound: Vec<String> = store
                .queues_mut()
                .filter(|q| !q.is_deleted())
                .filter_map(|q| {
                    let matches = if q.host == "localhost" {
                        hostname == me
                    } else {
                        q.host == hostname
                    };
                    if matches {
                        q.agent = Some(hostname.clone());
                        Some(q.name.clone())
                    } else {
                        None
                    }
                })
                .collect();
            set_pend_reason_on_queues(&mut store, &bound, PendReason::AgentStarting);
            debug!(host, queues = bound.len(), "bound agent to queues");
        }

        let mut handle = AgentHandle {
            host: host.to_string(),
            phase: AgentPhase::ReconPending,
            authenticated: false,
            nonce: None,
            sender,
            proxies: HashMap::new(),
        };

        if self.secret_hash.is_some() {
            let nonce = auth::generate_nonce();
            handle.send(ControllerMessage::AuthChallenge {
                nonce: nonce.clone(),
            });
            handle.nonce = Some(nonce);
            handle.phase = AgentPhase::AwaitAuthResp;
            info!(host, "agent logged in, challenge sent");
        } else {
            handle.send(ControllerMessage::ReconRequest {
                datetime: None,
                hmac: None,
            });
            info!(host, "agent logged in, recon requested");
        }

        self.registry.insert(handle);
        Ok(())
    }

    /// Handle one message from a logged-in agent.
    ///
    /// Returns `Ok(false)` when the connection must be closed (protocol or
    /// auth failure); fatal errors propagate.
    pub fn agent_message(&mut self, host: &str, msg: AgentMessage) -> Result<bool, EngineError> {
        let Some(phase) = self.registry.get(host).map(|h| h.phase) else {
            warn!(host, "message from unregistered agent");
            return Ok(false);
        };

        match (phase, msg) {
            (AgentPhase::AwaitAuthResp, AgentMessage::AuthResp {
                nonce: client_nonce,
                datetime,
                hmac,
            }) => self.agent_auth_resp(host, &client_nonce, datetime, &hmac),

            (AgentPhase::ReconPending, AgentMessage::Recon { jobs }) => {
                self.agent_recon(host, &jobs)?;
                Ok(true)
            }

            (AgentPhase::Ready, AgentMessage::JobStarted {
                jobid,
                pid,
                start_time,
            }) => {
                self.agent_job_started(jobid, pid, start_time)?;
                Ok(true)
            }

            (AgentPhase::Ready, AgentMessage::JobCompleted {
                jobid,
                exit_code,
                signal,
                failed_start,
                finish_time,
                rusage,
            }) => {
                self.agent_job_completed(jobid, exit_code, signal, failed_start, finish_time, rusage)?;
                Ok(true)
            }

            (AgentPhase::Ready, AgentMessage::ProxyConn { pid, uid }) => {
                if let Some(handle) = self.registry.get_mut(host) {
                    if handle.proxies.insert(pid, uid).is_some() {
                        warn!(host, pid, "replacing existing proxy client");
                    }
                }
                Ok(true)
            }

            (AgentPhase::Ready, AgentMessage::ProxyData { pid, data }) => {
                self.agent_proxy_data(host, pid, &data)?;
                Ok(true)
            }

            (AgentPhase::Ready, AgentMessage::ProxyClose { pid }) => {
                if let Some(handle) = self.registry.get_mut(host) {
                    handle.proxies.remove(&pid);
                }
                Ok(true)
            }

            (_, other) => {
                warn!(host, kind = message_name(&other), ?phase,
                    "unexpected agent message for phase, disconnecting");
                Ok(false)
            }
        }
    }

    /// Verify the HMAC challenge response; on success request the recon.
    fn agent_auth_resp(
        &mut self,
        host: &str,
        client_nonce: &str,
        datetime: u64,
        hmac: &str,
    ) -> Result<bool, EngineError> {
        let Some(secret) = self.secret_hash else {
            warn!(host, "auth response without a configured secret");
            return Ok(false);
        };
        let now = self.clock.epoch_secs();
        if datetime < now || datetime > now + auth::MAX_AUTH_TIME_SECS {
            warn!(
                host,
                datetime, now, "agent auth datetime outside tolerance, disconnecting"
            );
            return Ok(false);
        }

        let server_nonce = self
            .registry
            .get(host)
            .and_then(|h| h.nonce.clone())
            .unwrap_or_default();
        let datetime_str = datetime.to_string();
        if !auth::verify_hmac(&secret, &[&server_nonce, client_nonce, &datetime_str], hmac) {
            warn!(host, "agent auth HMAC incorrect, disconnecting");
            return Ok(false);
        }

        // The agent proved knowledge of the secret; prove ours back on
        // the recon request.
        let now_str = now.to_string();
        let recon_hmac = auth::hmac_hex(&secret, &[client_nonce, &now_str]);
        if let Some(handle) = self.registry.get_mut(host) {
            handle.authenticated = true;
            handle.phase = AgentPhase::ReconPending;
            handle.send(ControllerMessage::ReconRequest {
                datetime: Some(now),
                hmac: Some(recon_hmac),
            });
        }
        info!(host, "agent authenticated, recon requested");
        Ok(true)
    }

    /// Apply the agent's reconciliation records.
    ///
    /// A record for a job the controller does not know is fatal: the
    /// journal cannot have been durable before that job was dispatched.
    fn agent_recon(&mut self, host: &str, records: &[ReconRecord]) -> Result<(), EngineError> {
        info!(host, jobs = records.len(), "processing agent recon");

        for record in records {
            let known = {
                let store = self.store.lock();
                store.job(record.jobid).is_some()
            };
            if !known {
                return Err(EngineError::ReconUnknownJob {
                    host: host.to_string(),
                    jobid: record.jobid,
                });
            }

            {
                let mut store = self.store.lock();
                if let Some(job) = store.job_mut(record.jobid) {
                    job.pend_reason = None;
                    if record.start_time > 0 {
                        job.start_time = record.start_time;
                    }
                }
            }

            if record.finish_time > 0 {
                let exit_code = if record.signal > 0 {
                    128 + record.signal
                } else {
                    record.exit_code
                };
                self.commit(
                    0,
                    &Command::JobCompleted {
                        jobid: record.jobid,
                        exit_code,
                        signal: record.signal,
                        fail_reason: 0,
                        finish_time: record.finish_time,
                        rusage: record.rusage,
                    },
                )?;
                self.queue_notice(record.jobid);
            } else if record.pid > 0 {
                self.commit(
                    0,
                    &Command::JobStarted {
                        jobid: record.jobid,
                        pid: record.pid,
                        start_time: record.start_time,
                    },
                )?;
                if self.recovery_mode {
                    self.reclaim_resources(record.jobid);
                }
            }
        }

        // The reconciled state must be durable before new work flows.
        self.journal_mut().flush()?;

        let bound = self.bound_queues(host);
        {
            let mut store = self.store.lock();
            for name in &bound {
                if let Some(queue) = store.queue_mut(name) {
                    queue.flags.insert(QueueFlags::STARTED);
                }
            }
            clear_pend_reason_on_queues(&mut store, &bound, PendReason::AgentStarting);
        }

        if let Some(handle) = self.registry.get_mut(host) {
            handle.phase = AgentPhase::Ready;
            handle.send(ControllerMessage::ReconComplete);
        }
        info!(host, queues = bound.len(), "agent ready");
        Ok(())
    }

    /// `JOB_STARTED`: the agent confirmed the process is running.
    fn agent_job_started(&mut self, jobid: JobId, pid: i32, start_time: u64) -> Result<(), EngineError> {
        let known = {
            let store = self.store.lock();
            store.job(jobid).is_some_and(|j| !j.is_deleted())
        };
        if !known {
            warn!(jobid, "job start for unknown job");
            return Ok(());
        }
        self.commit(0, &Command::JobStarted {
            jobid,
            pid,
            start_time,
        })?;
        if self.recovery_mode {
            self.reclaim_resources(jobid);
        }
        debug!(jobid, pid, "job started");
        Ok(())
    }

    /// `JOB_COMPLETED`: record the exit and release held resources.
    fn agent_job_completed(
        &mut self,
        jobid: JobId,
        exit_code: i32,
        signal: i32,
        failed_start: bool,
        finish_time: u64,
        rusage: gq_core::Rusage,
    ) -> Result<(), EngineError> {
        let known = {
            let store = self.store.lock();
            store.job(jobid).is_some_and(|j| !j.is_deleted())
        };
        if !known {
            warn!(jobid, "job completion for unknown job");
            return Ok(());
        }

        let (final_exit, fail_reason) = if failed_start {
            (255, exit_code)
        } else if signal > 0 {
            (128 + signal, 0)
        } else {
            (exit_code, 0)
        };

        self.commit(
            0,
            &Command::JobCompleted {
                jobid,
                exit_code: final_exit,
                signal,
                fail_reason,
                finish_time,
                rusage,
            },
        )?;
        self.queue_notice(jobid);
        info!(
            jobid,
            exit_code = final_exit,
            "job {}",
            if final_exit == 0 { "completed" } else { "exited" }
        );
        Ok(())
    }

    /// A proxied client frame: decode one request, run it under the
    /// proxied uid, tunnel the response back.
    fn agent_proxy_data(&mut self, host: &str, pid: i32, data: &str) -> Result<(), EngineError> {
        let Some(uid) = self
            .registry
            .get(host)
            .and_then(|h| h.proxies.get(&pid).copied())
        else {
            warn!(host, pid, "proxy data without a proxy connection");
            return Ok(());
        };

        let response = match serde_json::from_str::<Request>(data) {
            Ok(request) => self.handle_client(uid, request)?,
            Err(e) => {
                warn!(host, pid, error = %e, "undecodable proxied request");
                Response::error(gq_core::ErrorKind::InvalidResponse)
            }
        };

        let payload = serde_json::to_string(&response).unwrap_or_else(|_| String::from("{}"));
        self.registry.send_to(
            host,
            ControllerMessage::ProxyData {
                pid,
                data: payload,
            },
        );
        Ok(())
    }

    /// The agent vanished: every job it owned becomes Unknown, its queues
    /// stop, and waiting jobs learn why they wait.
    pub fn agent_disconnected(&mut self, host: &str) -> Result<(), EngineError> {
        if self.registry.remove(host).is_none() {
            return Ok(());
        }
        info!(host, "agent disconnected");

        let bound = self.bound_queues(host);
        let lost: Vec<JobId> = {
            let store = self.store.lock();
            let mut lost: Vec<JobId> = store
                .jobs()
                .filter(|j| !j.is_deleted() && j.is_active() && bound.contains(&j.queue))
                .map(|j| j.jobid)
                .collect();
            lost.sort_unstable();
            lost
        };
        for jobid in &lost {
            self.commit(0, &Command::MarkUnknown { jobid: *jobid })?;
        }

        {
            let mut store = self.store.lock();
            for name in &bound {
                if let Some(queue) = store.queue_mut(name) {
                    queue.agent = None;
                    queue.flags.remove(QueueFlags::STARTED);
                }
            }
            set_pend_reason_on_queues(&mut store, &bound, PendReason::AgentDisconnected);
        }

        if !lost.is_empty() {
            warn!(host, jobs = lost.len(), "marked orphaned jobs unknown");
        }
        Ok(())
    }

    /// Names of non-deleted queues bound to this agent.
    fn bound_queues(&self, host: &str) -> Vec<String> {
        let store = self.store.lock();
        store
            .queues()
            .filter(|q| !q.is_deleted() && q.agent.as_deref() == Some(host))
            .map(|q| q.name.clone())
            .collect()
    }

    /// Re-derive resource occupancy from an agent-confirmed running job.
    /// Only meaningful while recovering: live dispatches already counted
    /// their units before the start message went out.
    fn reclaim_resources(&mut self, jobid: JobId) {
        let mut store = self.store.lock();
        let requests = match store.job(jobid) {
            Some(job) => job.resources.clone(),
            None => return,
        };
        for request in requests {
            if let Some(resource) = store.resource_mut(&request.name) {
                resource.in_use += request.count;
            }
        }
    }

    /// Queue a completion notice for the notifier drain.
    fn queue_notice(&mut self, jobid: JobId) {
        let store = self.store.lock();
        if let Some(job) = store.job(jobid) {
            self.pending_notices.push(Notice {
                jobid: job.jobid,
                name: job.name.clone(),
                submitter_uid: job.submitter_uid,
                state: job.state,
                exit_code: job.exit_code,
            });
        }
    }
}

fn message_name(msg: &AgentMessage) -> &'static str {
    match msg {
        AgentMessage::Login { .. } => "Login",
        AgentMessage::AuthResp { .. } => "AuthResp",
        AgentMessage::Recon { .. } => "Recon",
        AgentMessage::JobStarted { .. } => "JobStarted",
        AgentMessage::JobCompleted { .. } => "JobCompleted",
        AgentMessage::ProxyConn { .. } => "ProxyConn",
        AgentMessage::ProxyData { .. } => "ProxyData",
        AgentMessage::ProxyClose { .. } => "ProxyClose",
    }
}

/// Set a pend reason on every pending job of the named queues.
fn set_pend_reason_on_queues(
    store: &mut gq_storage::ObjectStore,
    queues: &[String],
    reason: PendReason,
) {
    let jobids: Vec<JobId> = store
        .jobs()
        .filter(|j| {
            !j.is_deleted()
                && j.state == JobState::Pending
                && !j.internal.contains(InternalFlags::STARTED)
                && queues.contains(&j.queue)
        })
        .map(|j| j.jobid)
        .collect();
    for jobid in jobids {
        if let Some(job) = store.job_mut(jobid) {
            job.pend_reason = Some(reason);
        }
    }
}

/// Clear a specific pend reason from pending jobs of the named queues.
fn clear_pend_reason_on_queues(
    store: &mut gq_storage::ObjectStore,
    queues: &[String],
    reason: PendReason,
) {
    let jobids: Vec<JobId> = store
        .jobs()
        .filter(|j| {
            !j.is_deleted() && j.pend_reason == Some(reason) && queues.contains(&j.queue)
        })
        .map(|j| j.jobid)
        .collect();
    for jobid in jobids {
        if let Some(job) = store.job_mut(jobid) {
            job.pend_reason = None;
        }
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
