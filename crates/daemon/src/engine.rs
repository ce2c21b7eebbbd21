// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine state and housekeeping ticks.
//!
//! The engine serializes every mutation: client commands, agent lifecycle
//! messages, scheduling, and background-save bookkeeping all run on the
//! engine loop. Durable mutations follow one discipline: validate, append
//! the command to the journal, then apply it to the store.

use crate::accounts::Accounts;
use crate::agent::AgentRegistry;
use crate::auth;
use crate::config::Config;
use crate::notify::{Notice, Notifier};
use crate::protocol::{Request, Response};
use gq_core::{Clock, Command, JobId};
use gq_storage::{
    collect_plan, recover, ApplyError, CleanupItem, Journal, JournalError, ObjectStore, PlanKeys,
    RecoveryError, SaveError, SaveHandle, Saver, SyncMode,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Fatal engine failures. Any of these ends the controller: durability or
/// an invariant has been lost.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("journal failure: {0}")]
    Journal(#[from] JournalError),
    #[error("state apply failure: {0}")]
    Apply(#[from] ApplyError),
    #[error("background save failed: {0}")]
    Save(#[from] SaveError),
    #[error("agent {host} sent recon for unknown job {jobid}; the journal was not durable before dispatch")]
    ReconUnknownJob { host: String, jobid: JobId },
}

/// Startup failures.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),
    #[error("journal failure: {0}")]
    Journal(#[from] JournalError),
    #[error("failed to read secret file: {0}")]
    Secret(std::io::Error),
}

/// Why an agent login was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoginRefused {
    #[error("host is not a configured agent node")]
    UnknownHost,
    #[error("an agent for this host is already connected")]
    AlreadyConnected,
}

/// Messages the listener tasks feed into the engine loop.
pub enum EngineMsg {
    /// A client request; the response goes back over the oneshot.
    Client {
        uid: u32,
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    /// First message of an agent connection.
    AgentLogin {
        host: String,
        sender: mpsc::UnboundedSender<crate::protocol::ControllerMessage>,
        reply: oneshot::Sender<Result<(), LoginRefused>>,
    },
    /// Subsequent agent traffic.
    Agent {
        host: String,
        message: crate::protocol::AgentMessage,
    },
    /// The agent connection dropped.
    AgentGone { host: String },
}

pub struct Engine<C: Clock> {
    pub config: Config,
    pub(crate) store: Arc<Mutex<ObjectStore>>,
    pub(crate) journal: Journal,
    saver: Saver,
    save: Option<(SaveHandle, PlanKeys)>,
    pub(crate) registry: AgentRegistry,
    pub(crate) accounts: Arc<dyn Accounts>,
    notifier: Box<dyn Notifier>,
    pub(crate) pending_notices: Vec<Notice>,
    pub(crate) clock: C,
    pub(crate) hostname: String,
    /// True from startup until the first scheduler tick; while set, agent
    /// recon and start confirmations re-derive resource occupancy.
    pub(crate) recovery_mode: bool,
    pub(crate) secret_hash: Option<[u8; 32]>,
}

impl<C: Clock> Engine<C> {
    /// Recover persisted state and assemble a ready engine.
    pub fn start(
        config: Config,
        clock: C,
        notifier: Box<dyn Notifier>,
        accounts: Arc<dyn Accounts>,
    ) -> Result<Engine<C>, StartupError> {
        let recovered = recover(&config.state_dir, config.max_jobid)?;
        let sync_mode = if config.flush_defer {
            SyncMode::Deferred
        } else {
            SyncMode::Immediate
        };
        let journal = Journal::open(&config.state_dir, sync_mode)?;
        let secret_hash = match &config.secret_file {
            Some(path) => Some(auth::load_secret_hash(path).map_err(StartupError::Secret)?),
            None => None,
        };
        let saver = Saver::new(config.state_dir.clone());

        let mut store = recovered.store;
        for queue in store.queues_mut() {
            auth::apply_queue_acls(&*accounts, &config, queue);
        }

        let hostname = local_hostname();
        info!(
            hostname = %hostname,
            replayed = recovered.replayed,
            auth = secret_hash.is_some(),
            "engine recovered"
        );

        Ok(Engine {
            config,
            store: Arc::new(Mutex::new(store)),
            journal,
            saver,
            save: None,
            registry: AgentRegistry::new(),
            accounts,
            notifier,
            pending_notices: Vec::new(),
            clock,
            hostname,
            recovery_mode: true,
            secret_hash,
        })
    }

    pub fn store(&self) -> Arc<Mutex<ObjectStore>> {
        Arc::clone(&self.store)
    }

    /// Journal a command, then apply it. The store is never mutated before
    /// the journal append has been issued.
    pub(crate) fn commit(&mut self, uid: u32, cmd: &Command) -> Result<(), EngineError> {
        let now_ms = self.clock.epoch_ms();
        let mut store = self.store.lock();
        Self::commit_locked(&mut self.journal, &mut store, uid, cmd, now_ms)
    }

    /// Commit while already holding the store lock.
    pub(crate) fn commit_locked(
        journal: &mut Journal,
        store: &mut ObjectStore,
        uid: u32,
        cmd: &Command,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let revision = store.next_revision(cmd);
        journal.append(uid, revision, cmd, now_ms)?;
        store.apply(cmd)?;
        Ok(())
    }

    pub(crate) fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    /// Release every deferred job whose defer time has passed.
    pub fn defer_tick(&mut self) -> Result<Vec<JobId>, EngineError> {
        let now = self.clock.epoch_secs();
        let due: Vec<JobId> = {
            let store = self.store.lock();
            let mut due: Vec<JobId> = store
                .jobs()
                .filter(|j| {
                    !j.is_deleted()
                        && j.state == gq_core::JobState::Deferred
                        && now >= j.defer_time
                })
                .map(|j| j.jobid)
                .collect();
            due.sort_unstable();
            due
        };
        for jobid in &due {
            self.commit(0, &Command::ReleaseDeferred { jobid: *jobid })?;
        }
        Ok(due)
    }

    /// Start a background save if anything is dirty and none is running.
    pub fn save_tick(&mut self) -> Result<(), EngineError> {
        self.poll_save()?;
        if self.save.is_some() {
            debug!("background save still running");
            return Ok(());
        }

        let marker = self.journal.last_commit();
        let plan = {
            let mut store = self.store.lock();
            collect_plan(&mut store, marker)
        };
        if let Some((plan, keys)) = plan {
            // The record at the marker offset must be durable before the
            // saver may stamp it.
            self.journal.flush()?;
            let handle = self.saver.start(plan);
            self.save = Some((handle, keys));
        }
        Ok(())
    }

    /// Check the in-flight save. Completion clears the Flushing flags; a
    /// failed save is fatal.
    pub fn poll_save(&mut self) -> Result<(), EngineError> {
        let Some((handle, _)) = &self.save else {
            return Ok(());
        };
        let Some(result) = handle.try_wait() else {
            return Ok(());
        };
        let Some((_, keys)) = self.save.take() else {
            return Ok(());
        };
        let outcome = result?;
        let mut store = self.store.lock();
        store.clear_flushing(&keys.jobs, &keys.queues, &keys.resources);
        debug!(
            jobs = outcome.jobs,
            queues = outcome.queues,
            resources = outcome.resources,
            "background save committed"
        );
        Ok(())
    }

    /// Reclaim deleted objects and unlink their state files.
    pub fn cleanup_tick(&mut self) -> Result<(), EngineError> {
        self.poll_save()?;

        let items = {
            let mut store = self.store.lock();
            // When job states are churning, sweep less per pass.
            let max = if store.take_candidate_recalc() {
                self.config.max_clean_job.div_ceil(2)
            } else {
                self.config.max_clean_job
            };
            store.cleanup(max)
        };

        let state_dir = &self.config.state_dir;
        for item in &items {
            let result = match item {
                CleanupItem::Job(jobid) => {
                    gq_storage::remove_object(&gq_storage::job_path(state_dir, *jobid))
                }
                CleanupItem::Queue(name) => {
                    gq_storage::remove_object(&gq_storage::queue_path(state_dir, name))
                }
                CleanupItem::Resource(name) => {
                    gq_storage::remove_object(&gq_storage::resource_path(state_dir, name))
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to unlink reclaimed object file");
            }
        }
        if !items.is_empty() {
            debug!(count = items.len(), "reclaimed deleted objects");
        }
        Ok(())
    }

    /// Deferred-sync flush of the journal.
    pub fn flush_tick(&mut self) -> Result<(), EngineError> {
        if self.journal.needs_flush() {
            self.journal.flush()?;
        }
        Ok(())
    }

    /// Hand queued completion notices to the notifier.
    pub fn notify_tick(&mut self) {
        for notice in self.pending_notices.drain(..) {
            self.notifier.job_finished(&notice);
        }
    }

    /// Graceful shutdown: wait out any in-flight save, then make the
    /// journal durable.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        if let Some((handle, keys)) = self.save.take() {
            let outcome = handle.wait()?;
            let mut store = self.store.lock();
            store.clear_flushing(&keys.jobs, &keys.queues, &keys.resources);
            debug!(jobs = outcome.jobs, "final save drained");
        }
        self.journal.flush()?;
        Ok(())
    }

    /// Hosts with a live agent connection, for introspection and tests.
    pub fn connected_agents(&self) -> Vec<String> {
        self.registry.hosts()
    }

    /// Whether a background save is still running.
    pub fn save_in_flight(&self) -> bool {
        self.save.is_some()
    }
}

/// The controller's own hostname, used to resolve `localhost` queues.
pub fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        let name = name.trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(name) = std::fs::read_to_string(path) {
            let name = name.trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    "localhost".to_string()
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
