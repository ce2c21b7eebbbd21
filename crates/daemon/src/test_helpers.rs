// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for engine-level tests.

use crate::accounts::FakeAccounts;
use crate::config::Config;
use crate::engine::Engine;
use crate::notify::FakeNotifier;
use crate::protocol::{ControllerMessage, JobSubmission, Request, Response};
use gq_core::{FakeClock, JobId};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub(crate) const ALICE: u32 = 1000;
pub(crate) const BOB: u32 = 1001;
pub(crate) const USERS_GID: u32 = 100;
pub(crate) const STAFF_GID: u32 = 200;

pub(crate) struct TestEngine {
    pub engine: Engine<FakeClock>,
    pub clock: FakeClock,
    pub notifier: FakeNotifier,
    // NOTE(lifetime): keep the state dir alive for the test
    #[allow(dead_code)]
    pub dir: TempDir,
}

pub(crate) fn test_config(dir: &TempDir) -> Config {
    Config {
        state_dir: dir.path().join("state"),
        max_jobid: 1000,
        flush_defer: false,
        read_groups: vec!["users".into()],
        write_groups: vec!["users".into()],
        setuid_groups: vec!["staff".into()],
        queue_groups: vec!["staff".into()],
        agent_nodes: vec!["node1".into(), "node2".into()],
        ..Config::default()
    }
}

pub(crate) fn test_accounts() -> FakeAccounts {
    let mut accounts = FakeAccounts::new();
    accounts
        .add_user(ALICE, "alice", USERS_GID, &[STAFF_GID])
        .add_user(BOB, "bob", USERS_GID, &[])
        .add_group("users", USERS_GID)
        .add_group("staff", STAFF_GID);
    accounts
}

pub(crate) fn engine() -> TestEngine {
    engine_with(|_| {})
}

pub(crate) fn engine_with(tweak: impl FnOnce(&mut Config)) -> TestEngine {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);
    let clock = FakeClock::new();
    let notifier = FakeNotifier::new();
    let engine = Engine::start(
        config,
        clock.clone(),
        Box::new(notifier.clone()),
        Arc::new(test_accounts()),
    )
    .unwrap();
    TestEngine {
        engine,
        clock,
        notifier,
        dir,
    }
}

impl TestEngine {
    /// Add a queue on `host` as root.
    pub fn add_queue(&mut self, name: &str, host: &str, limit: u32) {
        let response = self
            .engine
            .handle_client(
                0,
                Request::AddQueue {
                    name: name.into(),
                    host: host.into(),
                    description: String::new(),
                    job_limit: Some(limit),
                    priority: None,
                    default_queue: true,
                },
            )
            .unwrap();
        assert_eq!(response, Response::Ok);
    }

    pub fn add_resource(&mut self, name: &str, count: u32) {
        let response = self
            .engine
            .handle_client(
                0,
                Request::AddResource {
                    name: name.into(),
                    count,
                },
            )
            .unwrap();
        assert_eq!(response, Response::Ok);
    }

    /// Submit a minimal job as alice; returns the assigned jobid.
    pub fn submit(&mut self, name: &str, queue: &str) -> JobId {
        self.submit_with(name, queue, |_| {})
    }

    pub fn submit_with(
        &mut self,
        name: &str,
        queue: &str,
        tweak: impl FnOnce(&mut JobSubmission),
    ) -> JobId {
        let mut submit = JobSubmission {
            name: name.into(),
            queue: Some(queue.into()),
            args: vec!["/bin/true".into()],
            ..JobSubmission::default()
        };
        tweak(&mut submit);
        match self
            .engine
            .handle_client(ALICE, Request::AddJob { submit })
            .unwrap()
        {
            Response::JobId { jobid } => jobid,
            other => panic!("unexpected submit response: {other:?}"),
        }
    }

    /// Log an agent in and complete an empty reconciliation.
    pub fn connect_agent(&mut self, host: &str) -> UnboundedReceiver<ControllerMessage> {
        let mut rx = self.connect_agent_no_recon(host);
        match rx.try_recv() {
            Ok(ControllerMessage::ReconRequest { .. }) => {}
            other => panic!("expected recon request, got {other:?}"),
        }
        self.engine
            .agent_message(host, crate::protocol::AgentMessage::Recon { jobs: vec![] })
            .unwrap();
        match rx.try_recv() {
            Ok(ControllerMessage::ReconComplete) => {}
            other => panic!("expected recon complete, got {other:?}"),
        }
        rx
    }

    /// Log an agent in but leave the handshake where the engine put it.
    pub fn connect_agent_no_recon(&mut self, host: &str) -> UnboundedReceiver<ControllerMessage> {
        let (tx, rx) = unbounded_channel();
        self.engine.agent_login(host, tx).unwrap();
        rx
    }

    /// Wait for an in-flight background save to finish.
    pub fn finish_save(&mut self) {
        for _ in 0..200 {
            self.engine.poll_save().unwrap();
            if !self.engine.save_in_flight() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("background save did not finish");
    }
}
