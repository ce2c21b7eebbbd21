// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background persistence of dirty objects.
//!
//! Every save cycle clones the dirty objects into an immutable [`SavePlan`]
//! together with the journal position of the last appended record, then a
//! background thread writes the object files (queues and resources before
//! jobs, so recovery never sees a job without its queue) and finally stamps
//! the commit marker into the journal. The plan is taken before any further
//! mutation can occur, so the files reflect exactly the state at the
//! recorded journal offset.
//!
//! At most one save runs at a time. A failed save is fatal to the
//! controller: the commit marker can no longer be trusted to advance.

use crate::journal::{self, Marker};
use crate::objfile::{self, ObjFileError};
use crate::store::ObjectStore;
use gq_core::{InternalFlags, Job, JobId, Queue, Resource};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::debug;

/// Errors from a background save.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("object file error: {0}")]
    Obj(#[from] ObjFileError),
    #[error("journal marker error: {0}")]
    Journal(#[from] journal::JournalError),
    #[error("save thread died")]
    ThreadDied,
}

/// Immutable snapshot of the dirty objects for one save cycle.
pub struct SavePlan {
    pub jobs: Vec<Job>,
    pub queues: Vec<Queue>,
    pub resources: Vec<Resource>,
    /// Journal position of the last record applied before the plan was
    /// taken; stamped with `*` once every object file is durable.
    pub marker: Option<Marker>,
}

/// Keys of the objects captured in a plan, used to clear the Flushing
/// flags once the save completes.
#[derive(Debug, Clone, Default)]
pub struct PlanKeys {
    pub jobs: Vec<JobId>,
    pub queues: Vec<String>,
    pub resources: Vec<String>,
}

/// Result of a completed save.
#[derive(Debug, Clone, Copy)]
pub struct SaveOutcome {
    pub jobs: usize,
    pub queues: usize,
    pub resources: usize,
}

/// Build a [`SavePlan`] from the store's dirty objects, or `None` when
/// nothing is dirty. Clears dirty flags and sets Flushing as a side effect.
pub fn collect_plan(store: &mut ObjectStore, marker: Option<Marker>) -> Option<(SavePlan, PlanKeys)> {
    if !store.has_dirty() {
        return None;
    }
    let (jobs, queues, resources) = store.take_dirty();
    let keys = PlanKeys {
        jobs: jobs.iter().map(|j| j.jobid).collect(),
        queues: queues.iter().map(|q| q.name.clone()).collect(),
        resources: resources.iter().map(|r| r.name.clone()).collect(),
    };
    Some((
        SavePlan {
            jobs,
            queues,
            resources,
            marker,
        },
        keys,
    ))
}

/// Handle to an in-flight background save.
pub struct SaveHandle {
    receiver: mpsc::Receiver<Result<SaveOutcome, SaveError>>,
    // NOTE(lifetime): keep thread alive
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl SaveHandle {
    /// Check for completion without blocking.
    pub fn try_wait(&self) -> Option<Result<SaveOutcome, SaveError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(SaveError::ThreadDied)),
        }
    }

    /// Block until the save finishes (shutdown path).
    pub fn wait(self) -> Result<SaveOutcome, SaveError> {
        self.receiver.recv().unwrap_or(Err(SaveError::ThreadDied))
    }
}

/// Writes save plans on a background thread.
pub struct Saver {
    state_dir: PathBuf,
}

impl Saver {
    pub fn new(state_dir: PathBuf) -> Saver {
        Saver { state_dir }
    }

    /// Start writing a plan in the background.
    pub fn start(&self, plan: SavePlan) -> SaveHandle {
        let state_dir = self.state_dir.clone();
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = write_plan(&state_dir, &plan);
            let _ = tx.send(result);
        });

        SaveHandle {
            receiver: rx,
            handle,
        }
    }

    /// Write a plan synchronously (shutdown path).
    pub fn save_sync(&self, plan: SavePlan) -> Result<SaveOutcome, SaveError> {
        write_plan(&self.state_dir, &plan)
    }
}

/// Persist every object in the plan, then stamp the commit marker.
///
/// Deleted objects have their files removed instead of rewritten; a crash
/// before the marker is covered by journal replay of the delete command.
fn write_plan(state_dir: &Path, plan: &SavePlan) -> Result<SaveOutcome, SaveError> {
    for queue in &plan.queues {
        if queue.internal.contains(InternalFlags::DELETED) {
            objfile::remove_object(&objfile::queue_path(state_dir, &queue.name))?;
        } else {
            objfile::save_queue(state_dir, queue)?;
        }
    }
    for resource in &plan.resources {
        if resource.internal.contains(InternalFlags::DELETED) {
            objfile::remove_object(&objfile::resource_path(state_dir, &resource.name))?;
        } else {
            objfile::save_resource(state_dir, resource)?;
        }
    }
    for job in &plan.jobs {
        if job.internal.contains(InternalFlags::DELETED) {
            objfile::remove_object(&objfile::job_path(state_dir, job.jobid))?;
        } else {
            objfile::save_job(state_dir, job)?;
        }
    }

    if let Some(marker) = &plan.marker {
        journal::write_marker(state_dir, marker)?;
    }

    debug!(
        jobs = plan.jobs.len(),
        queues = plan.queues.len(),
        resources = plan.resources.len(),
        "background save complete"
    );

    Ok(SaveOutcome {
        jobs: plan.jobs.len(),
        queues: plan.queues.len(),
        resources: plan.resources.len(),
    })
}

#[cfg(test)]
#[path = "saver_tests.rs"]
mod tests;
