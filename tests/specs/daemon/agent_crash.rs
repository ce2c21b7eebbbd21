//! Agent failure and reconciliation specs.

use crate::prelude::*;
use gq_core::{JobState, Rusage};
use gq_daemon::protocol::ReconRecord;

/// Losing the agent marks its running work Unknown without releasing
/// resources; the agent is authoritative until it reconnects.
#[test]
fn agent_crash_marks_work_unknown() {
    let mut c = controller();
    c.add_queue("q1", 2);
    c.add_resource("R", 1);
    let mut agent = c.connect_ready_agent();

    let jobid = c.submit_with("held", |s| s.resources = vec!["R:1".into()]);
    c.engine.sched_tick().unwrap();
    agent.expect_start();
    agent.job_started(&mut c, jobid, 77);

    agent.disconnect(&mut c);

    let store = c.engine.store();
    let store = store.lock();
    let job = store.job(jobid).unwrap();
    assert_eq!(job.state, JobState::Unknown);
    assert!(!job.is_started());

    let queue = store.queue("q1").unwrap();
    assert!(queue.agent.is_none());
    assert!(!queue.is_started());

    // Units stay claimed until the agent reports back.
    assert_eq!(store.resource("R").unwrap().in_use, 1);
}

/// On reconnect the agent's recon resolves the Unknown job with its real
/// outcome.
#[test]
fn reconnect_recon_resolves_unknown_jobs() {
    let mut c = controller();
    c.add_queue("q1", 2);
    let mut agent = c.connect_ready_agent();

    let jobid = c.submit("flaky");
    c.engine.sched_tick().unwrap();
    agent.expect_start();
    agent.job_started(&mut c, jobid, 5);
    agent.disconnect(&mut c);
    assert_eq!(c.job_state(jobid), JobState::Unknown);

    let mut agent = c.connect_agent();
    match agent.recv() {
        Some(gq_daemon::protocol::ControllerMessage::ReconRequest { .. }) => {}
        other => panic!("expected recon request, got {other:?}"),
    }
    agent.recon(
        &mut c,
        vec![ReconRecord {
            jobid,
            start_time: 5,
            finish_time: 20,
            pid: 0,
            exit_code: 0,
            signal: 0,
            rusage: Rusage::default(),
        }],
    );

    assert_eq!(c.job_state(jobid), JobState::Completed);
}

/// A recon mentioning a job the controller never journaled is an
/// invariant violation and fatal.
#[test]
fn recon_for_unjournaled_job_is_fatal() {
    let mut c = controller();
    c.add_queue("q1", 2);
    let mut agent = c.connect_agent();
    let _req = agent.recv();

    let result = c.engine.agent_message(
        "node1",
        gq_daemon::protocol::AgentMessage::Recon {
            jobs: vec![ReconRecord {
                jobid: 31337,
                start_time: 1,
                finish_time: 0,
                pid: 9,
                exit_code: 0,
                signal: 0,
                rusage: Rusage::default(),
            }],
        },
    );
    assert!(result.is_err());
}
