//! Deferred submission specs.

use crate::prelude::*;
use gq_core::{Clock, JobState};
use std::time::Duration;

/// A submission deferred into the future stays Deferred until the release
/// event fires, then dispatches on the next tick.
#[test]
fn deferred_job_runs_after_its_time() {
    let mut c = controller();
    c.add_queue("q1", 1);
    let mut agent = c.connect_ready_agent();

    let release_at = c.clock.epoch_secs() + 2;
    let jobid = c.submit_with("later", |s| s.defer_time = release_at);
    assert_eq!(c.job_state(jobid), JobState::Deferred);

    // Before the defer time nothing moves.
    assert!(c.engine.defer_tick().unwrap().is_empty());
    assert!(c.engine.sched_tick().unwrap().is_empty());
    assert_eq!(c.job_state(jobid), JobState::Deferred);

    // Past the defer time the release event frees it...
    c.clock.advance(Duration::from_secs(2));
    assert_eq!(c.engine.defer_tick().unwrap(), vec![jobid]);
    assert_eq!(c.job_state(jobid), JobState::Pending);

    // ...and the next tick dispatches it.
    assert_eq!(c.engine.sched_tick().unwrap(), vec![jobid]);
    assert_eq!(agent.expect_start(), jobid);
}

/// A defer time already in the past submits straight to Pending.
#[test]
fn past_defer_time_is_immediately_pending() {
    let mut c = controller();
    c.add_queue("q1", 1);

    let jobid = c.submit_with("now", |s| s.defer_time = 1);
    assert_eq!(c.job_state(jobid), JobState::Pending);
}
