//! Per-client WebSocket gateway.
//!
//! One gateway instance owns one client connection: it parses the framed
//! JSON message stream, routes each message to the terminal or SSH
//! registry, and drains an outbound frame buffer back onto the socket.
//! When the connection closes, every session the client owns is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::protocol::{ClientMessage, ServerMessage};

/// Capacity of the per-client outbound buffer. When the client cannot keep
/// up, frames are dropped; ordering of delivered frames is preserved per
/// session.
const OUTBOUND_BUFFER: usize = 256;

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// The owning client of a session: an id plus a sender for outbound
/// frames. Sessions hold this instead of the socket itself, so a dropped
/// connection degrades to a sender whose frames go nowhere and can never
/// resurrect writes.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientHandle {
    pub fn new(id: u64, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { id, tx }
    }

    /// Queue a frame for delivery, dropping it when the buffer is full or
    /// the client is gone.
    pub fn send(&self, msg: ServerMessage) {
        if self.tx.try_send(msg).is_err() {
            tracing::trace!(client = self.id, "dropping outbound frame");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Drive one client connection to completion.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let client = ClientHandle::new(client_id, tx);

    let ready = ServerMessage::ConnectionEstablished {
        timestamp: unix_now(),
    };
    if send_frame(&mut ws_tx, &ready).await.is_err() {
        return;
    }
    tracing::info!(client = client_id, "client connected");

    run_client(&state, &client, &mut ws_tx, &mut ws_rx, &mut outbound_rx).await;

    tracing::info!(client = client_id, "client disconnected, closing owned sessions");
    state.terms.close_all_for_client(client_id).await;
    state.ssh.close_all_for_client(client_id);
}

async fn run_client(
    state: &AppState,
    client: &ClientHandle,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
    outbound_rx: &mut mpsc::Receiver<ServerMessage>,
) {
    loop {
        tokio::select! {
            Some(msg) = outbound_rx.recv() => {
                if send_frame(ws_tx, &msg).await.is_err() {
                    break;
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => dispatch(state, client, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound frame");
            Ok(())
        }
    }
}

/// Classify one inbound frame and route it.
pub async fn dispatch(state: &AppState, client: &ClientHandle, text: &str) {
    if text.len() > state.config.max_frame_len {
        client.send(ServerMessage::error(format!(
            "frame exceeds maximum size of {} bytes",
            state.config.max_frame_len
        )));
        return;
    }

    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(client = client.id, error = %e, "malformed frame");
            client.send(ServerMessage::error(
                "invalid frame: expected a JSON object with a 'type' field",
            ));
            return;
        }
    };

    match msg {
        ClientMessage::CreateTerminal {
            cols,
            rows,
            title,
            kube_context,
        } => {
            let cols = cols.unwrap_or(state.config.default_cols);
            let rows = rows.unwrap_or(state.config.default_rows);
            match state
                .terms
                .create_local(client.clone(), cols, rows, title, kube_context)
            {
                Ok(session) => client.send(ServerMessage::TerminalCreated {
                    session_id: session.id,
                    title: session.title,
                    cloned: None,
                    is_sandbox: None,
                    clone_type: None,
                }),
                Err(e) => client.send(ServerMessage::error(e)),
            }
        }

        ClientMessage::CreateSandbox {
            cols,
            rows,
            image,
            title,
        } => {
            // Image pull and container start can take a while; run them off
            // this client's message loop so its other sessions stay live.
            let cols = cols.unwrap_or(state.config.default_cols);
            let rows = rows.unwrap_or(state.config.default_rows);
            let state = state.clone();
            let client = client.clone();
            tokio::spawn(async move {
                match state
                    .terms
                    .create_sandbox(client.clone(), cols, rows, image.clone(), title)
                    .await
                {
                    Ok(session) => {
                        state.images.insert(&image);
                        if client.is_closed() {
                            // Client vanished while we were creating.
                            state.terms.close(&session.id).await;
                        } else {
                            client.send(ServerMessage::TerminalCreated {
                                session_id: session.id,
                                title: session.title,
                                cloned: None,
                                is_sandbox: Some(true),
                                clone_type: None,
                            });
                        }
                    }
                    Err(e) => client.send(ServerMessage::error(e)),
                }
            });
        }

        ClientMessage::CloneTerminal {
            original_session_id,
            clone_type,
            cols,
            rows,
        } => {
            if state.ssh.contains(&original_session_id) {
                let state = state.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    match state.ssh.duplicate(client.clone(), &original_session_id).await {
                        Ok(session) => {
                            if client.is_closed() {
                                state.ssh.close(&session.id);
                            } else {
                                client.send(ServerMessage::SshCreated {
                                    session_id: session.id,
                                    title: session.title,
                                    params: session.params.safe(),
                                    cloned: Some(true),
                                    duplicated: None,
                                    reconnected: None,
                                });
                            }
                        }
                        Err(e) => client.send(ServerMessage::error(e)),
                    }
                });
            } else {
                match state
                    .terms
                    .duplicate(client.clone(), &original_session_id, cols, rows)
                    .await
                {
                    Ok(session) => {
                        let is_sandbox = session.kind.is_sandbox();
                        client.send(ServerMessage::TerminalCreated {
                            session_id: session.id,
                            title: session.title,
                            cloned: Some(true),
                            is_sandbox: is_sandbox.then_some(true),
                            clone_type: Some(clone_type),
                        });
                    }
                    Err(e) => client.send(ServerMessage::error(e)),
                }
            }
        }

        ClientMessage::Input { session_id, data } => {
            state.terms.input(&session_id, Bytes::from(data)).await;
        }

        ClientMessage::Resize {
            session_id,
            cols,
            rows,
        } => {
            state.terms.resize(&session_id, cols, rows);
        }

        ClientMessage::CloseTerminal { session_id } => {
            state.terms.close(&session_id).await;
        }

        ClientMessage::CreateSsh { params, cols, rows } => {
            let cols = cols.unwrap_or(state.config.default_cols);
            let rows = rows.unwrap_or(state.config.default_rows);
            let state = state.clone();
            let client = client.clone();
            tokio::spawn(async move {
                match state.ssh.create(client.clone(), params, cols, rows).await {
                    Ok(session) => {
                        if client.is_closed() {
                            state.ssh.close(&session.id);
                        } else {
                            client.send(ServerMessage::SshCreated {
                                session_id: session.id,
                                title: session.title,
                                params: session.params.safe(),
                                cloned: None,
                                duplicated: None,
                                reconnected: None,
                            });
                        }
                    }
                    Err(e) => client.send(ServerMessage::error(e)),
                }
            });
        }

        ClientMessage::DuplicateSsh { session_id } => {
            let state = state.clone();
            let client = client.clone();
            tokio::spawn(async move {
                match state.ssh.duplicate(client.clone(), &session_id).await {
                    Ok(session) => {
                        if client.is_closed() {
                            state.ssh.close(&session.id);
                        } else {
                            client.send(ServerMessage::SshCreated {
                                session_id: session.id,
                                title: session.title,
                                params: session.params.safe(),
                                cloned: None,
                                duplicated: Some(true),
                                reconnected: None,
                            });
                        }
                    }
                    Err(e) => client.send(ServerMessage::error(e)),
                }
            });
        }

        ClientMessage::ReconnectSsh { session_id } => {
            let state = state.clone();
            let client = client.clone();
            tokio::spawn(async move {
                match state.ssh.reconnect(client.clone(), &session_id).await {
                    Ok(session) => {
                        if client.is_closed() {
                            state.ssh.close(&session.id);
                        } else {
                            client.send(ServerMessage::SshCreated {
                                session_id: session.id,
                                title: session.title,
                                params: session.params.safe(),
                                cloned: None,
                                duplicated: None,
                                reconnected: Some(true),
                            });
                        }
                    }
                    Err(e) => client.send(ServerMessage::error(e)),
                }
            });
        }

        ClientMessage::SshInput { session_id, data } => {
            state.ssh.input(&session_id, Bytes::from(data)).await;
        }

        ClientMessage::SshResize {
            session_id,
            cols,
            rows,
        } => {
            state.ssh.resize(&session_id, cols, rows).await;
        }

        ClientMessage::CloseSsh { session_id } => {
            state.ssh.close(&session_id);
        }

        ClientMessage::Unknown => {
            tracing::debug!(client = client.id, "ignoring unknown message kind");
        }
    }
}
