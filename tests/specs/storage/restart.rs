//! Restart and recovery specs.

use crate::prelude::*;
use gq_core::{JobFilter, JobState};
use gq_daemon::protocol::{Request, Response, ReturnFields};

/// Stop after a completed run, restart, and find the same state: the
/// completed job with its revision, and the totals.
#[test]
fn restart_preserves_completed_job() {
    let mut c = controller();
    c.add_queue("q1", 1);
    let mut agent = c.connect_ready_agent();
    let jobid = c.submit("j");

    c.engine.sched_tick().unwrap();
    agent.expect_start();
    agent.job_started(&mut c, jobid, 4242);
    agent.job_completed(&mut c, jobid, 0);

    let revision = {
        let store = c.engine.store();
        let revision = store.lock().job(jobid).unwrap().revision;
        revision
    };

    // Persist everything, then stop.
    c.checkpoint();
    c.engine.shutdown().unwrap();

    let mut c = restart(c);
    {
        let store = c.engine.store();
        let store = store.lock();
        let job = store.job(jobid).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.revision, revision);
        assert_eq!(store.stats().total.completed, 1);
    }

    // The marker preceded no unreplayed records.
    assert!(gq_storage::read_unpersisted(&c.engine.config.state_dir)
        .unwrap()
        .is_empty());

    // Clients still see the job.
    let response = c.request(
        ALICE,
        Request::GetJob {
            filter: JobFilter {
                jobid: Some(jobid),
                ..JobFilter::default()
            },
            fields: ReturnFields::ALL,
        },
    );
    assert!(matches!(response, Response::Jobs { .. }));
}

/// Kill the controller before any save: the journal alone rebuilds the
/// same state.
#[test]
fn crash_without_save_recovers_from_journal() {
    let mut c = controller();
    c.add_queue("q1", 2);
    let mut agent = c.connect_ready_agent();
    let done = c.submit("done");
    let waiting = c.submit("waiting");

    c.engine.sched_tick().unwrap();
    agent.expect_start();
    agent.job_started(&mut c, done, 1);
    agent.job_completed(&mut c, done, 0);

    // No checkpoint, no graceful shutdown: drop the engine cold.
    let c = restart(c);

    let store = c.engine.store();
    let store = store.lock();
    assert_eq!(store.job(done).unwrap().state, JobState::Completed);
    assert_eq!(store.job(waiting).unwrap().state, JobState::Pending);
    assert_eq!(store.stats().current.pending, 1);
    assert_eq!(store.stats().total.completed, 1);
    let queue = store.queue("q1").unwrap();
    assert_eq!(queue.stats.completed, 1);
    // No agent yet after restart.
    assert!(queue.agent.is_none());
    assert!(!queue.is_started());
}

/// A job lost mid-flight across a restart comes back Running once the
/// agent reconnects and reconciles, and its resources are re-derived.
#[test]
fn restart_then_recon_restores_running_job() {
    let mut c = controller();
    c.add_queue("q1", 2);
    c.add_resource("R", 2);
    let mut agent = c.connect_ready_agent();
    let jobid = c.submit_with("inflight", |s| s.resources = vec!["R:2".into()]);

    c.engine.sched_tick().unwrap();
    agent.expect_start();
    agent.job_started(&mut c, jobid, 321);

    c.checkpoint();
    let mut c = restart(c);

    // After the restart the units are unclaimed until the agent returns.
    {
        let store = c.engine.store();
        assert_eq!(store.lock().resource("R").unwrap().in_use, 0);
    }

    let mut agent = c.connect_agent();
    let _req = agent.recv();
    agent.recon(
        &mut c,
        vec![gq_daemon::protocol::ReconRecord {
            jobid,
            start_time: 10,
            finish_time: 0,
            pid: 321,
            exit_code: 0,
            signal: 0,
            rusage: gq_core::Rusage::default(),
        }],
    );

    let store = c.engine.store();
    let store = store.lock();
    assert_eq!(store.job(jobid).unwrap().state, JobState::Running);
    assert_eq!(store.resource("R").unwrap().in_use, 2);
}

/// Two restarts in a row do not disturb anything.
#[test]
fn repeated_restarts_are_stable() {
    let mut c = controller();
    c.add_queue("q1", 1);
    let jobid = c.submit("steady");
    c.checkpoint();

    let c = restart(c);
    let c = restart(c);

    let store = c.engine.store();
    let store = store.lock();
    assert_eq!(store.job(jobid).unwrap().state, JobState::Pending);
    assert_eq!(store.stats().current.pending, 1);
}
