// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket listeners for clients and agents.
//!
//! Listener tasks own the sockets; every message crosses into the engine
//! loop over a channel so mutations stay strictly serialized. Client
//! connections are request/response and identified by peer credentials;
//! agent connections are long-lived and start with a login frame.

use crate::engine::EngineMsg;
use crate::protocol::{
    self, AgentMessage, ControllerMessage, ProtocolError, Request, DEFAULT_TIMEOUT,
};
use gq_core::ErrorKind;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Remove a stale socket path and bind a fresh listener.
pub fn bind_socket(path: &std::path::Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Accept loop for client connections.
pub async fn run_client_listener(listener: UnixListener, engine_tx: mpsc::Sender<EngineMsg>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let engine_tx = engine_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client_conn(stream, engine_tx).await {
                        match e {
                            ProtocolError::ConnectionClosed => debug!("client disconnected"),
                            ProtocolError::Timeout => warn!("client connection timeout"),
                            _ => warn!(error = %e, "client connection error"),
                        }
                    }
                });
            }
            Err(e) => error!(error = %e, "client accept failed"),
        }
    }
}

/// Serve one client connection: a sequence of request/response frames.
async fn handle_client_conn(
    stream: UnixStream,
    engine_tx: mpsc::Sender<EngineMsg>,
) -> Result<(), ProtocolError> {
    let uid = stream.peer_cred().map(|c| c.uid())?;
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let request: Request = protocol::read_frame(&mut reader, DEFAULT_TIMEOUT).await?;
        debug!(uid, request = ?request, "client request");

        let (reply_tx, reply_rx) = oneshot::channel();
        if engine_tx
            .send(EngineMsg::Client {
                uid,
                request,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            // Engine shut down; report and drop the connection.
            let response = protocol::Response::error(ErrorKind::Disconnect);
            protocol::write_frame(&mut writer, &response, DEFAULT_TIMEOUT).await?;
            return Ok(());
        }

        let response = match reply_rx.await {
            Ok(response) => response,
            Err(_) => protocol::Response::error(ErrorKind::Disconnect),
        };
        protocol::write_frame(&mut writer, &response, DEFAULT_TIMEOUT).await?;
    }
}

/// Accept loop for agent connections.
pub async fn run_agent_listener(listener: UnixListener, engine_tx: mpsc::Sender<EngineMsg>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let engine_tx = engine_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_agent_conn(stream, engine_tx).await {
                        match e {
                            ProtocolError::ConnectionClosed => debug!("agent disconnected"),
                            _ => warn!(error = %e, "agent connection error"),
                        }
                    }
                });
            }
            Err(e) => error!(error = %e, "agent accept failed"),
        }
    }
}

/// Serve one agent connection.
///
/// The first frame must be a login; after registration the reader forwards
/// frames to the engine while a writer task drains outbound messages. The
/// engine signals disconnect by dropping the outbound sender.
async fn handle_agent_conn(
    stream: UnixStream,
    engine_tx: mpsc::Sender<EngineMsg>,
) -> Result<(), ProtocolError> {
    let (mut reader, mut writer) = stream.into_split();

    // Login phase: no other frame is acceptable first.
    let host = match protocol::read_frame(&mut reader, DEFAULT_TIMEOUT).await? {
        AgentMessage::Login { node } => node,
        other => {
            warn!(frame = ?other, "agent sent non-login first frame");
            return Ok(());
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ControllerMessage>();
    let (reply_tx, reply_rx) = oneshot::channel();
    if engine_tx
        .send(EngineMsg::AgentLogin {
            host: host.clone(),
            sender: out_tx,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return Ok(());
    }
    match reply_rx.await {
        Ok(Ok(())) => info!(host = %host, "agent connection accepted"),
        Ok(Err(refused)) => {
            warn!(host = %host, reason = %refused, "agent connection refused");
            return Ok(());
        }
        Err(_) => return Ok(()),
    }

    // Writer task: drains controller messages. When the engine drops the
    // sender (disconnect), wake the reader so the whole connection closes.
    let closed = Arc::new(Notify::new());
    let writer_closed = Arc::clone(&closed);
    let writer_host = host.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = protocol::write_frame(&mut writer, &message, DEFAULT_TIMEOUT).await {
                warn!(host = %writer_host, error = %e, "agent write failed");
                break;
            }
        }
        writer_closed.notify_one();
    });

    // Reader loop: forward frames until the socket or the engine closes.
    let long_wait = std::time::Duration::from_secs(60 * 60 * 24 * 365);
    loop {
        tokio::select! {
            frame = protocol::read_frame::<AgentMessage, _>(&mut reader, long_wait) => {
                match frame {
                    Ok(message) => {
                        if engine_tx
                            .send(EngineMsg::Agent { host: host.clone(), message })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            _ = closed.notified() => break,
        }
    }

    let _ = engine_tx
        .send(EngineMsg::AgentGone { host: host.clone() })
        .await;
    writer_task.abort();
    Ok(())
}
