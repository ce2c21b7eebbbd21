// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gridq controller daemon (gqd)
//!
//! Single decision loop over client commands, agent traffic, scheduling
//! ticks, and housekeeping; listener tasks feed the loop over a channel.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use gq_core::SystemClock;
use gq_daemon::engine::{Engine, EngineMsg};
use gq_daemon::listener;
use gq_daemon::logging::LogHandle;
use gq_daemon::{Config, EtcAccounts, NoopNotifier};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Cleanup sweep cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_millis(1000);
/// Deferred-job release cadence.
const DEFER_INTERVAL: Duration = Duration::from_millis(750);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_path = PathBuf::from(gq_daemon::config::DEFAULT_CONFIG_FILE);
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("gqd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("gqd {}", env!("CARGO_PKG_VERSION"));
                println!("gridq controller daemon - schedules batch jobs onto execution agents");
                println!();
                println!("USAGE:");
                println!("    gqd [CONFIG]");
                println!();
                println!("CONFIG defaults to {}", gq_daemon::config::DEFAULT_CONFIG_FILE);
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                return Ok(());
            }
            path => config_path = PathBuf::from(path),
        }
    }

    let config = Config::load(&config_path)?;

    // One controller per state directory.
    std::fs::create_dir_all(&config.state_dir)?;
    let lock_path = config.state_dir.join("lock");
    let lock_file = std::fs::File::create(&lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        eprintln!("gqd is already running for {}", config.state_dir.display());
        std::process::exit(1);
    }

    let log = match &config.logfile {
        Some(path) => LogHandle::file(path.clone())?,
        None => LogHandle::stderr(),
    };
    setup_logging(&log);

    info!(config = %config_path.display(), "starting controller");

    let accounts = Arc::new(EtcAccounts::new());
    let mut engine = Engine::start(
        config.clone(),
        SystemClock,
        Box::new(NoopNotifier),
        accounts,
    )?;

    let client_listener = listener::bind_socket(&config.client_socket)?;
    let agent_listener = listener::bind_socket(&config.agent_socket)?;

    let (engine_tx, mut engine_rx) = mpsc::channel::<EngineMsg>(1024);
    tokio::spawn(listener::run_client_listener(
        client_listener,
        engine_tx.clone(),
    ));
    tokio::spawn(listener::run_agent_listener(
        agent_listener,
        engine_tx.clone(),
    ));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    // NOTE: intervals are created outside the loop - select! re-evaluates
    // branches each iteration and a fresh interval would never fire.
    let mut sched = tokio::time::interval(Duration::from_millis(config.sched_freq_ms.max(1)));
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
    let mut save = tokio::time::interval(Duration::from_millis(config.background_save_ms.max(1)));
    let mut flush = tokio::time::interval(Duration::from_millis(config.flush_defer_ms.max(1)));
    let mut defer = tokio::time::interval(DEFER_INTERVAL);
    let mut email = tokio::time::interval(Duration::from_millis(config.email_freq_ms.max(1)));
    let flush_enabled = config.flush_defer;

    info!(
        clients = %config.client_socket.display(),
        agents = %config.agent_socket.display(),
        "controller ready"
    );

    let run = async {
        loop {
            tokio::select! {
                msg = engine_rx.recv() => {
                    match msg {
                        Some(EngineMsg::Client { uid, request, reply }) => {
                            let response = engine.handle_client(uid, request)?;
                            let _ = reply.send(response);
                        }
                        Some(EngineMsg::AgentLogin { host, sender, reply }) => {
                            let result = engine.agent_login(&host, sender);
                            let _ = reply.send(result);
                        }
                        Some(EngineMsg::Agent { host, message }) => {
                            if !engine.agent_message(&host, message)? {
                                engine.agent_disconnected(&host)?;
                            }
                        }
                        Some(EngineMsg::AgentGone { host }) => {
                            engine.agent_disconnected(&host)?;
                        }
                        None => break,
                    }
                }

                _ = sched.tick() => { engine.sched_tick()?; }
                _ = cleanup.tick() => { engine.cleanup_tick()?; }
                _ = save.tick() => { engine.save_tick()?; }
                _ = flush.tick(), if flush_enabled => { engine.flush_tick()?; }
                _ = defer.tick() => { engine.defer_tick()?; }
                _ = email.tick() => { engine.notify_tick(); }

                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reopening logfile");
                    if let Err(e) = log.reopen() {
                        error!(error = %e, "failed to reopen logfile");
                    }
                }
            }
        }
        Ok::<(), gq_daemon::EngineError>(())
    };

    let result = run.await;
    if let Err(e) = &result {
        error!(error = %e, "fatal engine failure");
    }

    engine.shutdown()?;
    info!("controller stopped");

    result?;
    Ok(())
}

fn setup_logging(log: &LogHandle) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log = log.clone();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(move || log.writer()))
        .init();
}
