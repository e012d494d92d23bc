//! Registry of interactive remote shell sessions.
//!
//! Each session owns one shell channel opened on a pooled transport. The
//! channel lives in a dedicated task that routes input commands to the
//! channel and channel output back to the owning client; any channel end
//! (remote close, transport failure, explicit close) drives the same
//! cleanup path, which releases the pooled transport and emits exactly one
//! `ssh_closed` frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;

use super::params::{PoolKey, SshParams};
use super::pool::{SshError, TransportPool};
use crate::decode::Utf8Carry;
use crate::gateway::ClientHandle;
use crate::ids;
use crate::protocol::ServerMessage;
use crate::store::SshParamsStore;

/// Commands routed into a session's channel task.
enum SshCommand {
    Data(Bytes),
    Resize(u16, u16),
    Close,
}

/// One live remote shell session. Clones share the underlying state.
#[derive(Clone)]
pub struct SshSession {
    pub id: String,
    pub title: String,
    pub params: SshParams,
    pub created_at: DateTime<Utc>,
    pub client: ClientHandle,
    /// Distinguishes this incarnation from a later session reusing the same
    /// id (reconnect), so a stale channel task cannot remove its successor.
    nonce: u64,
    cmd_tx: mpsc::Sender<SshCommand>,
    size: Arc<Mutex<(u16, u16)>>,
    last_activity: Arc<Mutex<DateTime<Utc>>>,
}

impl SshSession {
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }
}

/// Public listing entry for the catalog surface.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSessionInfo {
    pub session_id: String,
    pub title: String,
    pub params: super::params::SafeParams,
    pub created_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Clone)]
pub struct SshRegistry {
    inner: Arc<RwLock<HashMap<String, SshSession>>>,
    nonce_seq: Arc<AtomicU64>,
    pool: TransportPool,
    saved: SshParamsStore,
    default_term: String,
}

impl SshRegistry {
    pub fn new(pool: TransportPool, saved: SshParamsStore, default_term: String) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            nonce_seq: Arc::new(AtomicU64::new(0)),
            pool,
            saved,
            default_term,
        }
    }

    pub fn pool(&self) -> &TransportPool {
        &self.pool
    }

    /// Open a new remote shell session. Remembers the parameters for later
    /// reconnects.
    pub async fn create(
        &self,
        client: ClientHandle,
        params: SshParams,
        cols: u16,
        rows: u16,
    ) -> Result<SshSession, SshError> {
        self.open(client, params, cols, rows, None).await
    }

    /// Open a second independent shell channel with a live session's
    /// parameters. The pool key matches, so the transport is reused.
    pub async fn duplicate(
        &self,
        client: ClientHandle,
        session_id: &str,
    ) -> Result<SshSession, SshError> {
        let (params, (cols, rows)) = {
            let inner = self.inner.read();
            let session = inner
                .get(session_id)
                .ok_or_else(|| SshError::Unknown(session_id.to_string()))?;
            (session.params.clone(), session.size())
        };
        self.open(client, params, cols, rows, None).await
    }

    /// Recreate a session from its remembered parameters, retaining the
    /// original identifier.
    pub async fn reconnect(
        &self,
        client: ClientHandle,
        session_id: &str,
    ) -> Result<SshSession, SshError> {
        let params = self
            .saved
            .get(session_id)
            .ok_or_else(|| SshError::Unknown(session_id.to_string()))?;

        // A live session under this id (stale client state) is retired
        // first; its channel task finds its entry gone and stays silent.
        if let Some(old) = self.inner.write().remove(session_id) {
            let _ = old.cmd_tx.try_send(SshCommand::Close);
            self.pool.release(&old.params.pool_key());
            old.client.send(ServerMessage::SshClosed {
                session_id: session_id.to_string(),
            });
        }

        // Geometry is not persisted; clients resize right after reconnecting.
        let (cols, rows) = (80, 30);
        self.open(client, params, cols, rows, Some(session_id.to_string()))
            .await
    }

    async fn open(
        &self,
        client: ClientHandle,
        params: SshParams,
        cols: u16,
        rows: u16,
        forced_id: Option<String>,
    ) -> Result<SshSession, SshError> {
        let id = forced_id.unwrap_or_else(ids::new_session_id);
        let key = params.pool_key();
        let transport = self.pool.acquire(&params).await?;

        // Any failure past this point must hand the reference back.
        let mut channel = match transport.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                self.pool.release(&key);
                return Err(SshError::RemoteOpenFailed(e.to_string()));
            }
        };

        // Both requests ask for a reply: a server that rejects the PTY or
        // the shell must fail the create here, with the transport released,
        // rather than surface later as a spurious close.
        let term = params
            .term
            .clone()
            .unwrap_or_else(|| self.default_term.clone());
        if let Err(e) = channel
            .request_pty(true, &term, cols as u32, rows as u32, 0, 0, &[])
            .await
        {
            self.pool.release(&key);
            return Err(SshError::RemoteOpenFailed(e.to_string()));
        }
        if let Err(e) = await_request_reply(&mut channel, "pty request").await {
            self.pool.release(&key);
            return Err(e);
        }
        if let Err(e) = channel.request_shell(true).await {
            self.pool.release(&key);
            return Err(SshError::RemoteOpenFailed(e.to_string()));
        }
        if let Err(e) = await_request_reply(&mut channel, "shell request").await {
            self.pool.release(&key);
            return Err(e);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let session = SshSession {
            id: id.clone(),
            title: params.title(),
            params: params.clone(),
            created_at: Utc::now(),
            client: client.clone(),
            nonce: self.nonce_seq.fetch_add(1, Ordering::Relaxed),
            cmd_tx,
            size: Arc::new(Mutex::new((cols, rows))),
            last_activity: Arc::new(Mutex::new(Utc::now())),
        };
        let nonce = session.nonce;
        self.inner.write().insert(id.clone(), session.clone());

        // Advisory catalog entry; loss here never fails the create.
        self.saved.insert(&id, params);

        let registry = self.clone();
        let activity = session.last_activity.clone();
        tokio::spawn(async move {
            run_channel(&id, channel, cmd_rx, client, activity).await;
            registry.finish(&id, nonce, &key);
        });

        tracing::info!(session = %session.id, title = %session.title, "ssh session created");
        Ok(session)
    }

    /// Write input bytes to a session's channel. Unknown ids are silently
    /// dropped (the client holds a stale id).
    pub async fn input(&self, session_id: &str, data: Bytes) {
        let session = self.inner.read().get(session_id).cloned();
        let Some(session) = session else { return };
        session.touch();
        let _ = session.cmd_tx.send(SshCommand::Data(data)).await;
    }

    /// Send a window-change and record the new geometry. Unknown ids are
    /// silently dropped.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let session = self.inner.read().get(session_id).cloned();
        let Some(session) = session else { return };
        *session.size.lock() = (cols, rows);
        session.touch();
        let _ = session.cmd_tx.send(SshCommand::Resize(cols, rows)).await;
    }

    /// Request close of a session. Cleanup (pool release, `ssh_closed`
    /// frame, entry removal) runs in the channel task; closing an unknown
    /// id is a no-op.
    pub fn close(&self, session_id: &str) {
        let cmd_tx = self
            .inner
            .read()
            .get(session_id)
            .map(|s| s.cmd_tx.clone());
        if let Some(tx) = cmd_tx {
            let _ = tx.try_send(SshCommand::Close);
        }
    }

    /// Close every session owned by the given client.
    pub fn close_all_for_client(&self, client_id: u64) {
        let ids: Vec<String> = self
            .inner
            .read()
            .values()
            .filter(|s| s.client.id == client_id)
            .map(|s| s.id.clone())
            .collect();
        for id in ids {
            tracing::debug!(session = %id, client = client_id, "closing ssh session for disconnected client");
            self.close(&id);
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Credential-stripped listing for the catalog surface.
    pub fn list(&self) -> Vec<SshSessionInfo> {
        let mut sessions: Vec<SshSessionInfo> = self
            .inner
            .read()
            .values()
            .map(|s| {
                let (cols, rows) = s.size();
                SshSessionInfo {
                    session_id: s.id.clone(),
                    title: s.title.clone(),
                    params: s.params.safe(),
                    created_at: s.created_at,
                    cols,
                    rows,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Tear down bookkeeping for a finished channel task. Only the
    /// incarnation that registered the entry may remove it, and only the
    /// remover emits the close frame.
    fn finish(&self, session_id: &str, nonce: u64, key: &PoolKey) {
        let removed = {
            let mut inner = self.inner.write();
            let same_incarnation =
                matches!(inner.get(session_id), Some(session) if session.nonce == nonce);
            if same_incarnation {
                inner.remove(session_id)
            } else {
                None
            }
        };
        let Some(session) = removed else { return };
        self.pool.release(key);
        self.pool.prune_closed();
        session.client.send(ServerMessage::SshClosed {
            session_id: session_id.to_string(),
        });
        tracing::info!(session = session_id, "ssh session closed");
    }
}

/// Wait for the server's reply to a `want_reply` channel request. SSH
/// orders the reply before any output the request may produce, so
/// nothing meaningful can arrive ahead of it on this channel.
async fn await_request_reply(
    channel: &mut Channel<Msg>,
    what: &str,
) -> Result<(), SshError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(SshError::RemoteOpenFailed(format!(
                    "{what} rejected by server"
                )))
            }
            Some(_) => continue,
            None => {
                return Err(SshError::RemoteOpenFailed(format!(
                    "channel closed during {what}"
                )))
            }
        }
    }
}

/// Drive one shell channel until it ends: input commands flow to the
/// channel, channel output flows to the client in arrival order per
/// stream. Each stream carries its own partial trailing UTF-8 sequence
/// across chunks so multi-byte characters split by the transport are not
/// mangled.
async fn run_channel(
    session_id: &str,
    mut channel: Channel<Msg>,
    mut cmd_rx: mpsc::Receiver<SshCommand>,
    client: ClientHandle,
    activity: Arc<Mutex<DateTime<Utc>>>,
) {
    let mut stdout = Utf8Carry::new();
    let mut stderr = Utf8Carry::new();
    loop {
        // `wait()` is cancel-safe, so the channel borrow is confined to the
        // select arms and writes happen after the arms resolve.
        let cmd = tokio::select! {
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        *activity.lock() = Utc::now();
                        let data = stdout.push(&data);
                        if !data.is_empty() {
                            client.send(ServerMessage::SshData {
                                session_id: session_id.to_string(),
                                data,
                            });
                        }
                        None
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        *activity.lock() = Utc::now();
                        let data = stderr.push(&data);
                        if !data.is_empty() {
                            client.send(ServerMessage::SshData {
                                session_id: session_id.to_string(),
                                data,
                            });
                        }
                        None
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        tracing::debug!(session = session_id, exit_status, "remote shell exited");
                        None
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                    Some(_) => None,
                    None => break,
                }
            }
            cmd = cmd_rx.recv() => Some(cmd.unwrap_or(SshCommand::Close)),
        };

        match cmd {
            Some(SshCommand::Data(bytes)) => {
                if channel.data(&bytes[..]).await.is_err() {
                    break;
                }
            }
            Some(SshCommand::Resize(cols, rows)) => {
                if let Err(e) = channel
                    .window_change(cols as u32, rows as u32, 0, 0)
                    .await
                {
                    tracing::debug!(session = session_id, error = %e, "window change failed");
                }
            }
            Some(SshCommand::Close) => {
                let _ = channel.eof().await;
                break;
            }
            None => {}
        }
    }
}
