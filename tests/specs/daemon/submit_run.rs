//! Submit-and-run lifecycle specs.

use crate::prelude::*;
use gq_core::{JobFilter, JobState};
use gq_daemon::protocol::{Request, Response, ReturnFields};

/// One job through the whole happy path: submit, dispatch, start
/// confirmation, completion.
#[test]
fn submits_and_runs_one_job() {
    let mut c = controller();
    c.add_queue("q1", 1);
    let mut agent = c.connect_ready_agent();

    let jobid = c.submit("j");
    assert_eq!(jobid, 1);
    assert_eq!(c.job_state(jobid), JobState::Pending);

    // One tick dispatches the job to the agent.
    let started = c.engine.sched_tick().unwrap();
    assert_eq!(started, vec![jobid]);
    let dispatched = agent.expect_start();
    assert_eq!(dispatched, jobid);

    // Start confirmation binds the pid.
    agent.job_started(&mut c, jobid, 4242);
    {
        let store = c.engine.store();
        let store = store.lock();
        let job = store.job(jobid).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.pid, 4242);
    }

    // Completion finishes the job and bumps the totals.
    agent.job_completed(&mut c, jobid, 0);
    {
        let store = c.engine.store();
        let store = store.lock();
        let job = store.job(jobid).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code, 0);
        assert_eq!(store.stats().total.completed, 1);
    }
}

#[test]
fn failing_job_exits_with_code() {
    let mut c = controller();
    c.add_queue("q1", 1);
    let mut agent = c.connect_ready_agent();

    let jobid = c.submit("flaky");
    c.engine.sched_tick().unwrap();
    agent.expect_start();
    agent.job_started(&mut c, jobid, 7);
    agent.job_completed(&mut c, jobid, 3);

    let store = c.engine.store();
    let store = store.lock();
    let job = store.job(jobid).unwrap();
    assert_eq!(job.state, JobState::Exited);
    assert_eq!(job.exit_code, 3);
    assert_eq!(store.stats().total.exited, 1);
}

#[test]
fn clients_see_job_progress() {
    let mut c = controller();
    c.add_queue("q1", 1);
    let mut agent = c.connect_ready_agent();
    let jobid = c.submit("watched");

    c.engine.sched_tick().unwrap();
    agent.expect_start();
    agent.job_started(&mut c, jobid, 99);

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
    match response {
        Response::Jobs { jobs } => {
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].state, Some(JobState::Running));
            assert_eq!(jobs[0].pid, Some(99));
        }
        other => panic!("unexpected response {other:?}"),
    }
}

/// Dispatch order within a tick follows the sorted candidate pool, not
/// submission order.
#[test]
fn dispatch_follows_priority_order() {
    let mut c = controller();
    c.add_queue("q1", 4);
    let mut agent = c.connect_ready_agent();

    let low = c.submit_with("low", |s| s.priority = Some(10));
    let high = c.submit_with("high", |s| s.priority = Some(200));

    let started = c.engine.sched_tick().unwrap();
    assert_eq!(started, vec![high, low]);
    assert_eq!(agent.expect_start(), high);
    assert_eq!(agent.expect_start(), low);
}

#[test]
fn second_agent_queue_stays_independent() {
    let mut c = controller_with(|config| config.agent_nodes.push("node2".into()));
    c.add_queue("q1", 1);
    let mut agent = c.connect_ready_agent();

    // q2 lives on a host with no agent; its jobs stay pending.
    let response = c.request(
        0,
        Request::AddQueue {
            name: "q2".into(),
            host: "node2".into(),
            description: String::new(),
            job_limit: Some(1),
            priority: None,
            default_queue: false,
        },
    );
    assert_eq!(response, Response::Ok);

    let on_q1 = c.submit_with("a", |s| s.queue = Some("q1".into()));
    let on_q2 = c.submit_with("b", |s| s.queue = Some("q2".into()));

    let started = c.engine.sched_tick().unwrap();
    assert_eq!(started, vec![on_q1]);
    assert_eq!(agent.expect_start(), on_q1);
    assert_eq!(c.job_state(on_q2), JobState::Pending);
}
