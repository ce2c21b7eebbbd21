// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! gq-storage: durable state for the gridq controller.
//!
//! The controller's state lives in three layers:
//! - [`ObjectStore`]: in-memory tables of jobs, queues, and resources.
//! - [`Journal`]: append-only write-ahead log of mutation commands.
//! - per-object state files written by the background [`Saver`], with a
//!   commit marker stamped back into the journal once a save is durable.

mod journal;
mod objfile;
mod recovery;
mod saver;
mod store;

pub use journal::{read_unpersisted, write_marker, Journal, JournalError, Marker, SyncMode};
pub use objfile::{
    job_path, load_job, load_queue, load_resource, queue_path, remove_object, resource_path,
    save_job, save_queue, save_resource, ObjFileError,
};
pub use recovery::{recover, Recovered, RecoveryError};
pub use saver::{collect_plan, PlanKeys, SaveError, SaveHandle, SaveOutcome, SavePlan, Saver};
pub use store::{ApplyError, CleanupItem, ObjectStore, ServerStats, Totals};
