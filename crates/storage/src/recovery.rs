// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup recovery: load object files, then replay the journal suffix.

use crate::journal::{self, JournalError};
use crate::objfile::{self, ObjFileError};
use crate::store::ObjectStore;
use gq_core::JobId;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Fatal recovery failures. Anything that would leave the store violating
/// an invariant (a job without its queue, unreadable object files) aborts
/// startup.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("object file error: {0}")]
    Obj(#[from] ObjFileError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("loading {path}: {source}")]
    Load {
        path: String,
        source: crate::store::ApplyError,
    },
    #[error("glob error: {0}")]
    Glob(#[from] glob::PatternError),
}

/// Result of recovery.
pub struct Recovered {
    pub store: ObjectStore,
    /// Journal records replayed on top of the loaded object files.
    pub replayed: usize,
}

fn globbed(dir: &Path, pattern: &str) -> Result<Vec<std::path::PathBuf>, RecoveryError> {
    let full = dir.join(pattern);
    let mut paths = Vec::new();
    for entry in glob::glob(&full.to_string_lossy())? {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => warn!(error = %e, "skipping unreadable state file"),
        }
    }
    paths.sort();
    Ok(paths)
}

/// Load persisted objects and replay the unpersisted journal suffix.
///
/// Queues load first, then resources, then jobs, so referential checks can
/// run as objects arrive. Replay feeds each command back through the same
/// apply path used by live dispatch; replay errors are logged and skipped
/// unless they indicate an invariant violation (handled inside apply).
pub fn recover(state_dir: &Path, max_jobid: JobId) -> Result<Recovered, RecoveryError> {
    fs::create_dir_all(state_dir.join("jobs"))?;
    fs::create_dir_all(state_dir.join("queues"))?;
    fs::create_dir_all(state_dir.join("resources"))?;

    let mut store = ObjectStore::new(max_jobid);

    let queue_files = globbed(state_dir, "queues/*.queue")?;
    for path in &queue_files {
        let queue = objfile::load_queue(path)?;
        store
            .insert_loaded_queue(queue)
            .map_err(|source| RecoveryError::Load {
                path: path.display().to_string(),
                source,
            })?;
    }
    info!(count = queue_files.len(), "loaded queues");

    let resource_files = globbed(state_dir, "resources/*.resource")?;
    for path in &resource_files {
        let resource = objfile::load_resource(path)?;
        store
            .insert_loaded_resource(resource)
            .map_err(|source| RecoveryError::Load {
                path: path.display().to_string(),
                source,
            })?;
    }
    info!(count = resource_files.len(), "loaded resources");

    let job_files = globbed(state_dir, "jobs/*/*.job")?;
    for path in &job_files {
        let job = objfile::load_job(path)?;
        // A job referencing a missing queue is fatal: the queue save is
        // ordered before the job save, so this never happens in a
        // well-formed state directory.
        store
            .insert_loaded_job(job)
            .map_err(|source| RecoveryError::Load {
                path: path.display().to_string(),
                source,
            })?;
    }
    info!(count = job_files.len(), "loaded jobs");

    let pending = journal::read_unpersisted(state_dir)?;
    let mut replayed = 0;
    for cmd in &pending {
        match store.apply(cmd) {
            Ok(()) => replayed += 1,
            Err(e) => {
                // Replay is tolerant: the command may describe state that
                // was already persisted by a completed save.
                warn!(command = cmd.name(), jobid = cmd.jobid(), error = %e,
                    "journal replay skipped a command");
            }
        }
    }
    info!(replayed, "journal replay finished");

    store.rebuild_stats();

    Ok(Recovered { store, replayed })
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
