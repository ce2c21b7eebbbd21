//! Resource admission specs.

use crate::prelude::*;
use gq_core::{JobState, PendReason};

/// Two jobs over a one-unit resource: the second waits until the first
/// releases its units.
#[test]
fn resource_gates_concurrent_jobs() {
    let mut c = controller();
    c.add_queue("q1", 4);
    c.add_resource("R", 1);
    let mut agent = c.connect_ready_agent();

    let first = c.submit_with("a", |s| s.resources = vec!["R:1".into()]);
    let second = c.submit_with("b", |s| s.resources = vec!["R:1".into()]);

    let started = c.engine.sched_tick().unwrap();
    assert_eq!(started, vec![first]);
    {
        let store = c.engine.store();
        let store = store.lock();
        assert_eq!(store.resource("R").unwrap().in_use, 1);
        assert_eq!(
            store.job(second).unwrap().pend_reason,
            Some(PendReason::WaitingRes)
        );
    }

    agent.expect_start();
    agent.job_started(&mut c, first, 11);
    agent.job_completed(&mut c, first, 0);

    {
        let store = c.engine.store();
        assert_eq!(store.lock().resource("R").unwrap().in_use, 0);
    }

    let started = c.engine.sched_tick().unwrap();
    assert_eq!(started, vec![second]);
    assert_eq!(agent.expect_start(), second);
    let store = c.engine.store();
    assert_eq!(store.lock().resource("R").unwrap().in_use, 1);
}

/// Units are claimed at dispatch, before the start confirmation, so a
/// tick can never oversubscribe a resource.
#[test]
fn units_claimed_before_start_confirmation() {
    let mut c = controller();
    c.add_queue("q1", 8);
    c.add_resource("R", 3);
    let mut agent = c.connect_ready_agent();

    let a = c.submit_with("a", |s| s.resources = vec!["R:2".into()]);
    let b = c.submit_with("b", |s| s.resources = vec!["R:2".into()]);

    let started = c.engine.sched_tick().unwrap();
    assert_eq!(started, vec![a]);
    assert_eq!(agent.expect_start(), a);
    assert_eq!(c.job_state(b), JobState::Pending);

    let store = c.engine.store();
    let store = store.lock();
    assert_eq!(store.resource("R").unwrap().in_use, 2);
}
