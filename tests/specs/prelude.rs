//! Test harness for controller specifications.
//!
//! Builds an engine on a temp state directory with fake clock, accounts,
//! and notifier, plus helpers to play the agent side of the protocol.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use gq_core::{Clock, FakeClock, JobId, JobState};
use gq_daemon::engine::Engine;
use gq_daemon::protocol::{
    AgentMessage, ControllerMessage, JobSubmission, ReconRecord, Request, Response,
};
use gq_daemon::{Config, FakeAccounts, FakeNotifier};
use gq_core::Rusage;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub const ALICE: u32 = 1000;
pub const USERS_GID: u32 = 100;

pub struct Controller {
    pub engine: Engine<FakeClock>,
    pub clock: FakeClock,
    pub notifier: FakeNotifier,
    pub dir: TempDir,
}

pub fn accounts() -> FakeAccounts {
    let mut accounts = FakeAccounts::new();
    accounts
        .add_user(ALICE, "alice", USERS_GID, &[])
        .add_group("users", USERS_GID);
    accounts
}

pub fn config_for(dir: &TempDir) -> Config {
    Config {
        state_dir: dir.path().join("state"),
        max_jobid: 100,
        flush_defer: false,
        read_groups: vec!["users".into()],
        write_groups: vec!["users".into()],
        agent_nodes: vec!["node1".into()],
        ..Config::default()
    }
}

/// Start a controller on a fresh state directory.
pub fn controller() -> Controller {
    controller_with(|_| {})
}

pub fn controller_with(tweak: impl FnOnce(&mut Config)) -> Controller {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(&dir);
    tweak(&mut config);
    start(config, dir)
}

/// Restart a controller over an existing state directory.
pub fn restart(previous: Controller) -> Controller {
    let config = previous.engine.config.clone();
    let dir = previous.dir;
    drop(previous.engine);
    start(config, dir)
}

fn start(config: Config, dir: TempDir) -> Controller {
    let clock = FakeClock::new();
    let notifier = FakeNotifier::new();
    let engine = Engine::start(
        config,
        clock.clone(),
        Box::new(notifier.clone()),
        Arc::new(accounts()),
    )
    .unwrap();
    Controller {
        engine,
        clock,
        notifier,
        dir,
    }
}

impl Controller {
    pub fn request(&mut self, uid: u32, request: Request) -> Response {
        self.engine.handle_client(uid, request).unwrap()
    }

    pub fn add_queue(&mut self, name: &str, limit: u32) {
        let response = self.request(
            0,
            Request::AddQueue {
                name: name.into(),
                host: "node1".into(),
                description: String::new(),
                job_limit: Some(limit),
                priority: None,
                default_queue: true,
            },
        );
        assert_eq!(response, Response::Ok);
    }

    pub fn add_resource(&mut self, name: &str, count: u32) {
        let response = self.request(
            0,
            Request::AddResource {
                name: name.into(),
                count,
            },
        );
        assert_eq!(response, Response::Ok);
    }

    pub fn submit(&mut self, name: &str) -> JobId {
        self.submit_with(name, |_| {})
    }

    pub fn submit_with(&mut self, name: &str, tweak: impl FnOnce(&mut JobSubmission)) -> JobId {
        let mut submit = JobSubmission {
            name: name.into(),
            args: vec!["/bin/echo".into(), "hi".into()],
            ..JobSubmission::default()
        };
        tweak(&mut submit);
        match self.request(ALICE, Request::AddJob { submit }) {
            Response::JobId { jobid } => jobid,
            other => panic!("unexpected submit response: {other:?}"),
        }
    }

    /// Connect an agent and complete an empty reconciliation.
    pub fn connect_ready_agent(&mut self) -> Agent {
        let mut agent = self.connect_agent();
        match agent.rx.try_recv() {
            Ok(ControllerMessage::ReconRequest { .. }) => {}
            other => panic!("expected recon request, got {other:?}"),
        }
        agent.recon(self, vec![]);
        match agent.rx.try_recv() {
            Ok(ControllerMessage::ReconComplete) => {}
            other => panic!("expected recon complete, got {other:?}"),
        }
        agent
    }

    /// Connect an agent; the handshake is left wherever the engine put it.
    pub fn connect_agent(&mut self) -> Agent {
        let (tx, rx) = unbounded_channel();
        self.engine.agent_login("node1", tx).unwrap();
        Agent {
            host: "node1".into(),
            rx,
        }
    }

    pub fn job_state(&self, jobid: JobId) -> JobState {
        let store = self.engine.store();
        let state = store.lock().job(jobid).unwrap().state;
        state
    }

    /// Run a save cycle to completion.
    pub fn checkpoint(&mut self) {
        self.engine.save_tick().unwrap();
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

/// The agent side of one connection.
pub struct Agent {
    pub host: String,
    pub rx: UnboundedReceiver<ControllerMessage>,
}

impl Agent {
    /// Next queued controller message, if any.
    pub fn recv(&mut self) -> Option<ControllerMessage> {
        self.rx.try_recv().ok()
    }

    /// Expect a start message and return its jobid.
    pub fn expect_start(&mut self) -> JobId {
        match self.recv() {
            Some(ControllerMessage::StartJob { jobid, .. }) => jobid,
            other => panic!("expected start message, got {other:?}"),
        }
    }

    pub fn recon(&mut self, controller: &mut Controller, jobs: Vec<ReconRecord>) {
        controller
            .engine
            .agent_message(&self.host, AgentMessage::Recon { jobs })
            .unwrap();
    }

    pub fn job_started(&mut self, controller: &mut Controller, jobid: JobId, pid: i32) {
        controller
            .engine
            .agent_message(
                &self.host,
                AgentMessage::JobStarted {
                    jobid,
                    pid,
                    start_time: controller.clock.epoch_secs(),
                },
            )
            .unwrap();
    }

    pub fn job_completed(&mut self, controller: &mut Controller, jobid: JobId, exit_code: i32) {
        controller
            .engine
            .agent_message(
                &self.host,
                AgentMessage::JobCompleted {
                    jobid,
                    exit_code,
                    signal: 0,
                    failed_start: false,
                    finish_time: controller.clock.epoch_secs(),
                    rusage: Rusage::default(),
                },
            )
            .unwrap();
    }

    /// Drop the connection server-side.
    pub fn disconnect(self, controller: &mut Controller) {
        controller.engine.agent_disconnected(&self.host).unwrap();
    }
}
