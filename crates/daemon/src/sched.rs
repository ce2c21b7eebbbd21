// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The scheduling pass.
//!
//! Every tick: release due deferred jobs, build the candidate pool under
//! queue and system admission, sort by priority, admit against resource
//! availability, and dispatch start messages up to the tick budget.

use crate::engine::{Engine, EngineError};
use crate::protocol::ControllerMessage;
use gq_core::{Clock, InternalFlags, Job, JobId, JobState, PendReason};
use tracing::{debug, info};

/// A candidate ordered for dispatch: highest queue priority first, then
/// highest job priority, oldest jobid breaking ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub queue_priority: u8,
    pub job_priority: u8,
    pub jobid: JobId,
}

/// Sort candidates into dispatch order.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.queue_priority
            .cmp(&a.queue_priority)
            .then(b.job_priority.cmp(&a.job_priority))
            .then(a.jobid.cmp(&b.jobid))
    });
}

fn start_message(job: &Job) -> ControllerMessage {
    ControllerMessage::StartJob {
        jobid: job.jobid,
        name: job.name.clone(),
        queue: job.queue.clone(),
        uid: job.run_uid,
        nice: job.nice,
        shell: job.shell.clone(),
        pre_cmd: job.pre_cmd.clone(),
        post_cmd: job.post_cmd.clone(),
        args: job.args.clone(),
        env: job.env.clone(),
        stdout: job.stdout.clone(),
        stderr: job.stderr.clone(),
    }
}

impl<C: Clock> Engine<C> {
    /// One scheduling pass. Returns the jobids dispatched this tick.
    pub fn sched_tick(&mut self) -> Result<Vec<JobId>, EngineError> {
        // The first pass after startup ends recovery: from here on,
        // resource occupancy is controller-owned again.
        if self.recovery_mode {
            self.recovery_mode = false;
            debug!("recovery window closed");
        }

        self.defer_tick()?;

        let sched_max = self.config.sched_max as usize;
        let max_run = self.config.max_run_jobs;
        let mut dispatches: Vec<(String, ControllerMessage)> = Vec::new();
        let mut started: Vec<JobId> = Vec::new();

        {
            let mut store = self.store.lock();

            for queue in store.queues_mut() {
                queue.pending_start = queue.active_count;
            }

            let running = store.stats().current.running;
            let system_full = max_run > 0 && running >= max_run;

            let mut jobids: Vec<JobId> = store
                .jobs()
                .filter(|j| !j.is_deleted())
                .map(|j| j.jobid)
                .collect();
            jobids.sort_unstable();

            let mut candidates: Vec<Candidate> = Vec::new();
            for jobid in jobids {
                let Some(job) = store.job(jobid) else { continue };
                if job.state != JobState::Pending || job.is_started() {
                    continue;
                }
                let job_priority = job.priority;
                let queue_name = job.queue.clone();

                if system_full {
                    if let Some(job) = store.job_mut(jobid) {
                        job.pend_reason = Some(PendReason::SystemFull);
                    }
                    continue;
                }

                let Some(queue) = store.queue(&queue_name) else {
                    continue;
                };
                let queue_priority = queue.priority;
                if !queue.is_started() {
                    // The registry's reasons are more specific than ours;
                    // keep them while an agent is coming or recently went.
                    let keep = matches!(
                        store.job(jobid).and_then(|j| j.pend_reason),
                        Some(PendReason::AgentStarting) | Some(PendReason::AgentDisconnected)
                    );
                    if !keep {
                        if let Some(job) = store.job_mut(jobid) {
                            job.pend_reason = Some(PendReason::QueueStopped);
                        }
                    }
                    continue;
                }
                if queue.pending_start >= queue.job_limit {
                    if let Some(job) = store.job_mut(jobid) {
                        job.pend_reason = Some(PendReason::QueueFull);
                    }
                    continue;
                }

                if let Some(queue) = store.queue_mut(&queue_name) {
                    queue.pending_start += 1;
                }
                if let Some(job) = store.job_mut(jobid) {
                    job.pend_reason = None;
                }
                candidates.push(Candidate {
                    queue_priority,
                    job_priority,
                    jobid,
                });
            }

            sort_candidates(&mut candidates);

            let headroom = if max_run == 0 {
                usize::MAX
            } else {
                max_run.saturating_sub(running) as usize
            };
            let budget = candidates.len().min(sched_max).min(headroom);

            for candidate in candidates {
                if started.len() >= budget {
                    break;
                }
                let jobid = candidate.jobid;
                let Some(job) = store.job(jobid) else { continue };
                let requests = job.resources.clone();
                let queue_name = job.queue.clone();

                // All required resources must be available at once.
                let short = requests
                    .iter()
                    .any(|req| req.count > store.resource(&req.name).map_or(0, |r| r.available()));
                if short {
                    if let Some(job) = store.job_mut(jobid) {
                        job.pend_reason = Some(PendReason::WaitingRes);
                    }
                    continue;
                }

                let Some(agent_host) = store.queue(&queue_name).and_then(|q| q.agent.clone())
                else {
                    if let Some(job) = store.job_mut(jobid) {
                        job.pend_reason = Some(PendReason::AgentDisconnected);
                    }
                    continue;
                };

                // Units are claimed before the start message leaves, so the
                // wire state machine and admission always agree.
                for req in &requests {
                    if let Some(resource) = store.resource_mut(&req.name) {
                        resource.in_use += req.count;
                    }
                }
                if let Some(queue) = store.queue_mut(&queue_name) {
                    queue.active_count += 1;
                }
                let message = match store.job_mut(jobid) {
                    Some(job) => {
                        job.internal.insert(InternalFlags::STARTED);
                        job.pend_reason = Some(PendReason::WaitingStart);
                        start_message(job)
                    }
                    None => continue,
                };

                dispatches.push((agent_host, message));
                started.push(jobid);
            }
        }

        for (host, message) in dispatches {
            if let ControllerMessage::StartJob { jobid, .. } = &message {
                info!(jobid = *jobid, host = %host, "dispatching start");
            }
            self.registry.send_to(&host, message);
        }

        Ok(started)
    }
}

#[cfg(test)]
#[path = "sched_tests.rs"]
mod tests;
