// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::auth::hmac_hex;
use crate::engine::{EngineError, LoginRefused};
use crate::protocol::Response;
use crate::test_helpers::{engine, engine_with, ALICE};
use gq_core::Rusage;
use tokio::sync::mpsc::unbounded_channel;

#[test]
fn login_binds_queues_and_requests_recon() {
    let mut t = engine();
    t.add_queue("batch", "node1", 2);
    let jobid = t.submit("waiting", "batch");

    let mut rx = t.connect_agent_no_recon("node1");

    match rx.try_recv() {
        Ok(ControllerMessage::ReconRequest {
            datetime: None,
            hmac: None,
        }) => {}
        other => panic!("expected plain recon request, got {other:?}"),
    }

    let store = t.engine.store();
    let store = store.lock();
    let queue = store.queue("batch").unwrap();
    assert_eq!(queue.agent.as_deref(), Some("node1"));
    // Not dispatchable until the recon completes.
    assert!(!queue.is_started());
    assert_eq!(
        store.job(jobid).unwrap().pend_reason,
        Some(PendReason::AgentStarting)
    );
}

#[test]
fn unknown_host_is_refused() {
    let mut t = engine();
    let (tx, _rx) = unbounded_channel();
    assert_eq!(
        t.engine.agent_login("stranger", tx),
        Err(LoginRefused::UnknownHost)
    );
}

#[test]
fn queue_host_allows_agent_without_node_entry() {
    let mut t = engine_with(|c| c.agent_nodes.clear());
    t.add_queue("batch", "node7", 1);
    let (tx, _rx) = unbounded_channel();
    assert_eq!(t.engine.agent_login("node7", tx), Ok(()));
}

#[test]
fn second_connection_for_host_is_refused() {
    let mut t = engine();
    t.add_queue("batch", "node1", 2);
    let _rx = t.connect_agent("node1");

    let (tx, _rx2) = unbounded_channel();
    assert_eq!(
        t.engine.agent_login("node1", tx),
        Err(LoginRefused::AlreadyConnected)
    );
}

#[test]
fn empty_recon_completes_handshake() {
    let mut t = engine();
    t.add_queue("batch", "node1", 2);
    let jobid = t.submit("waiting", "batch");

    let _rx = t.connect_agent("node1");

    let store = t.engine.store();
    let store = store.lock();
    assert!(store.queue("batch").unwrap().is_started());
    assert_eq!(store.job(jobid).unwrap().pend_reason, None);
    drop(store);
    assert_eq!(t.engine.connected_agents(), vec!["node1".to_string()]);
}

#[test]
fn challenge_flow_authenticates_agent() {
    let secret = b"the shared secret";
    let mut t = engine_with(|c| {
        let path = c.state_dir.join("secret");
        std::fs::create_dir_all(&c.state_dir).unwrap();
        std::fs::write(&path, secret).unwrap();
        c.secret_file = Some(path);
    });
    t.add_queue("batch", "node1", 2);

    let mut rx = t.connect_agent_no_recon("node1");
    let server_nonce = match rx.try_recv() {
        Ok(ControllerMessage::AuthChallenge { nonce }) => nonce,
        other => panic!("expected challenge, got {other:?}"),
    };

    let key = crate::auth::load_secret_hash(
        t.engine.config.secret_file.as_ref().unwrap(),
    )
    .unwrap();
    let datetime = t.clock.epoch_secs() + 10;
    let datetime_str = datetime.to_string();
    let hmac = hmac_hex(&key, &[&server_nonce, "client-nonce", &datetime_str]);

    let keep = t
        .engine
        .agent_message(
            "node1",
            AgentMessage::AuthResp {
                nonce: "client-nonce".into(),
                datetime,
                hmac,
            },
        )
        .unwrap();
    assert!(keep);

    // The recon request proves the controller knows the secret too.
    match rx.try_recv() {
        Ok(ControllerMessage::ReconRequest {
            datetime: Some(dt),
            hmac: Some(mac),
        }) => {
            let dt_str = dt.to_string();
            assert_eq!(mac, hmac_hex(&key, &["client-nonce", &dt_str]));
        }
        other => panic!("expected authenticated recon request, got {other:?}"),
    }
}

#[test]
fn bad_hmac_disconnects() {
    let mut t = engine_with(|c| {
        let path = c.state_dir.join("secret");
        std::fs::create_dir_all(&c.state_dir).unwrap();
        std::fs::write(&path, b"secret").unwrap();
        c.secret_file = Some(path);
    });
    t.add_queue("batch", "node1", 2);

    let mut rx = t.connect_agent_no_recon("node1");
    let _challenge = rx.try_recv().unwrap();

    let keep = t
        .engine
        .agent_message(
            "node1",
            AgentMessage::AuthResp {
                nonce: "client-nonce".into(),
                datetime: t.clock.epoch_secs() + 10,
                hmac: "deadbeef".into(),
            },
        )
        .unwrap();
    assert!(!keep);
}

#[test]
fn stale_datetime_disconnects() {
    let secret = b"secret";
    let mut t = engine_with(|c| {
        let path = c.state_dir.join("secret");
        std::fs::create_dir_all(&c.state_dir).unwrap();
        std::fs::write(&path, secret).unwrap();
        c.secret_file = Some(path);
    });
    t.add_queue("batch", "node1", 2);

    let mut rx = t.connect_agent_no_recon("node1");
    let server_nonce = match rx.try_recv() {
        Ok(ControllerMessage::AuthChallenge { nonce }) => nonce,
        other => panic!("expected challenge, got {other:?}"),
    };

    let key = crate::auth::load_secret_hash(
        t.engine.config.secret_file.as_ref().unwrap(),
    )
    .unwrap();
    // One second in the past: outside `now <= t <= now + window`.
    let datetime = t.clock.epoch_secs() - 1;
    let datetime_str = datetime.to_string();
    let hmac = hmac_hex(&key, &[&server_nonce, "n", &datetime_str]);

    let keep = t
        .engine
        .agent_message(
            "node1",
            AgentMessage::AuthResp {
                nonce: "n".into(),
                datetime,
                hmac,
            },
        )
        .unwrap();
    assert!(!keep);
}

#[test]
fn recon_restores_running_and_finished_jobs() {
    let mut t = engine();
    t.add_queue("batch", "node1", 4);
    let running = t.submit("running", "batch");
    let finished = t.submit("finished", "batch");

    let mut rx = t.connect_agent_no_recon("node1");
    let _req = rx.try_recv().unwrap();

    t.engine
        .agent_message(
            "node1",
            AgentMessage::Recon {
                jobs: vec![
                    ReconRecord {
                        jobid: running,
                        start_time: 50,
                        finish_time: 0,
                        pid: 77,
                        exit_code: 0,
                        signal: 0,
                        rusage: Rusage::default(),
                    },
                    ReconRecord {
                        jobid: finished,
                        start_time: 40,
                        finish_time: 60,
                        pid: 0,
                        exit_code: 3,
                        signal: 0,
                        rusage: Rusage {
                            maxrss: 512,
                            ..Rusage::default()
                        },
                    },
                ],
            },
        )
        .unwrap();

    match rx.try_recv() {
        Ok(ControllerMessage::ReconComplete) => {}
        other => panic!("expected recon complete, got {other:?}"),
    }

    let store = t.engine.store();
    let store = store.lock();
    let job = store.job(running).unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.pid, 77);
    assert_eq!(job.start_time, 50);

    let job = store.job(finished).unwrap();
    assert_eq!(job.state, JobState::Exited);
    assert_eq!(job.exit_code, 3);
    assert_eq!(job.finish_time, 60);
    assert_eq!(job.rusage.maxrss, 512);
}

#[test]
fn recon_rederives_resource_usage_during_recovery() {
    let mut t = engine();
    t.add_queue("batch", "node1", 4);
    t.add_resource("gpu", 2);
    let jobid = t.submit_with("gpu-job", "batch", |s| s.resources = vec!["gpu:2".into()]);

    assert!(t.engine.recovery_mode);
    let mut rx = t.connect_agent_no_recon("node1");
    let _req = rx.try_recv().unwrap();
    t.engine
        .agent_message(
            "node1",
            AgentMessage::Recon {
                jobs: vec![ReconRecord {
                    jobid,
                    start_time: 5,
                    finish_time: 0,
                    pid: 10,
                    exit_code: 0,
                    signal: 0,
                    rusage: Rusage::default(),
                }],
            },
        )
        .unwrap();

    let store = t.engine.store();
    assert_eq!(store.lock().resource("gpu").unwrap().in_use, 2);
}

#[test]
fn recon_for_unknown_job_is_fatal() {
    let mut t = engine();
    t.add_queue("batch", "node1", 4);

    let mut rx = t.connect_agent_no_recon("node1");
    let _req = rx.try_recv().unwrap();

    let result = t.engine.agent_message(
        "node1",
        AgentMessage::Recon {
            jobs: vec![ReconRecord {
                jobid: 4242,
                start_time: 1,
                finish_time: 0,
                pid: 1,
                exit_code: 0,
                signal: 0,
                rusage: Rusage::default(),
            }],
        },
    );
    assert!(matches!(
        result,
        Err(EngineError::ReconUnknownJob { jobid: 4242, .. })
    ));
}

#[test]
fn lifecycle_messages_before_ready_disconnect() {
    let mut t = engine();
    t.add_queue("batch", "node1", 4);
    let _rx = t.connect_agent_no_recon("node1");

    // JobStarted while still ReconPending is a protocol violation.
    let keep = t
        .engine
        .agent_message(
            "node1",
            AgentMessage::JobStarted {
                jobid: 1,
                pid: 1,
                start_time: 1,
            },
        )
        .unwrap();
    assert!(!keep);
}

#[test]
fn signaled_completion_maps_exit_code() {
    let mut t = engine();
    t.add_queue("batch", "node1", 1);
    let jobid = t.submit("sig", "batch");
    t.connect_agent("node1");
    t.engine.sched_tick().unwrap();
    t.engine
        .agent_message(
            "node1",
            AgentMessage::JobStarted {
                jobid,
                pid: 5,
                start_time: 1,
            },
        )
        .unwrap();
    t.engine
        .agent_message(
            "node1",
            AgentMessage::JobCompleted {
                jobid,
                exit_code: 0,
                signal: 9,
                failed_start: false,
                finish_time: 2,
                rusage: Rusage::default(),
            },
        )
        .unwrap();

    let store = t.engine.store();
    let store = store.lock();
    let job = store.job(jobid).unwrap();
    assert_eq!(job.state, JobState::Exited);
    assert_eq!(job.exit_code, 137);
    assert_eq!(job.signal, 9);
}

#[test]
fn failed_start_maps_fail_reason() {
    let mut t = engine();
    t.add_queue("batch", "node1", 1);
    let jobid = t.submit("noexec", "batch");
    t.connect_agent("node1");
    t.engine.sched_tick().unwrap();
    t.engine
        .agent_message(
            "node1",
            AgentMessage::JobCompleted {
                jobid,
                exit_code: 2,
                signal: 0,
                failed_start: true,
                finish_time: 2,
                rusage: Rusage::default(),
            },
        )
        .unwrap();

    let store = t.engine.store();
    let store = store.lock();
    let job = store.job(jobid).unwrap();
    assert_eq!(job.exit_code, 255);
    assert_eq!(job.fail_reason, 2);
    assert_eq!(job.state, JobState::Exited);
}

#[test]
fn disconnect_marks_jobs_unknown_and_stops_queues() {
    let mut t = engine();
    t.add_queue("batch", "node1", 2);
    t.add_resource("gpu", 1);
    let jobid = t.submit_with("held", "batch", |s| s.resources = vec!["gpu".into()]);

    t.connect_agent("node1");
    t.engine.sched_tick().unwrap();
    t.engine
        .agent_message(
            "node1",
            AgentMessage::JobStarted {
                jobid,
                pid: 31,
                start_time: 4,
            },
        )
        .unwrap();

    t.engine.agent_disconnected("node1").unwrap();

    let store = t.engine.store();
    let store = store.lock();
    let job = store.job(jobid).unwrap();
    assert_eq!(job.state, JobState::Unknown);
    assert!(!job.is_started());

    let queue = store.queue("batch").unwrap();
    assert!(queue.agent.is_none());
    assert!(!queue.is_started());

    // The agent is authoritative: its resources stay claimed until it
    // reconnects and reconciles.
    assert_eq!(store.resource("gpu").unwrap().in_use, 1);
    drop(store);
    assert!(t.engine.connected_agents().is_empty());
}

#[test]
fn disconnect_is_idempotent() {
    let mut t = engine();
    t.add_queue("batch", "node1", 2);
    t.connect_agent("node1");
    t.engine.agent_disconnected("node1").unwrap();
    t.engine.agent_disconnected("node1").unwrap();
}

#[test]
fn reconnect_after_crash_resolves_unknown_job() {
    let mut t = engine();
    t.add_queue("batch", "node1", 2);
    let jobid = t.submit("flaky", "batch");

    t.connect_agent("node1");
    t.engine.sched_tick().unwrap();
    t.engine
        .agent_message(
            "node1",
            AgentMessage::JobStarted {
                jobid,
                pid: 8,
                start_time: 3,
            },
        )
        .unwrap();
    t.engine.agent_disconnected("node1").unwrap();

    // The agent returns knowing how the job ended.
    let mut rx = t.connect_agent_no_recon("node1");
    let _req = rx.try_recv().unwrap();
    t.engine
        .agent_message(
            "node1",
            AgentMessage::Recon {
                jobs: vec![ReconRecord {
                    jobid,
                    start_time: 3,
                    finish_time: 20,
                    pid: 0,
                    exit_code: 0,
                    signal: 0,
                    rusage: Rusage::default(),
                }],
            },
        )
        .unwrap();

    let store = t.engine.store();
    assert_eq!(store.lock().job(jobid).unwrap().state, JobState::Completed);
}

#[test]
fn proxy_tunnels_requests_through_agent() {
    let mut t = engine();
    t.add_queue("batch", "node1", 2);
    let mut rx = t.connect_agent("node1");

    t.engine
        .agent_message("node1", AgentMessage::ProxyConn { pid: 55, uid: ALICE })
        .unwrap();

    let request = crate::protocol::Request::AddJob {
        submit: crate::protocol::JobSubmission {
            name: "proxied".into(),
            queue: Some("batch".into()),
            args: vec!["/bin/true".into()],
            ..Default::default()
        },
    };
    t.engine
        .agent_message(
            "node1",
            AgentMessage::ProxyData {
                pid: 55,
                data: serde_json::to_string(&request).unwrap(),
            },
        )
        .unwrap();

    match rx.try_recv() {
        Ok(ControllerMessage::ProxyData { pid: 55, data }) => {
            let response: Response = serde_json::from_str(&data).unwrap();
            assert!(matches!(response, Response::JobId { .. }));
        }
        other => panic!("expected proxied response, got {other:?}"),
    }

    t.engine
        .agent_message("node1", AgentMessage::ProxyClose { pid: 55 })
        .unwrap();

    // Data for a closed proxy is dropped, not answered.
    t.engine
        .agent_message(
            "node1",
            AgentMessage::ProxyData {
                pid: 55,
                data: "{}".into(),
            },
        )
        .unwrap();
    assert!(rx.try_recv().is_err());
}
