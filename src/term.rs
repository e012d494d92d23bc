//! Local and container terminal sessions.
//!
//! Each session owns a pseudo-terminal child (a host shell, or an exec
//! into a session-owned container). The registry mediates I/O between the
//! PTY and the owning client and tracks lifecycle: a session ends on the
//! first of explicit close, child exit, or owning-client disconnect, and
//! emits `terminal_closed` exactly once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::container::{ContainerError, ContainerRuntime};
use crate::cwd;
use crate::decode::Utf8Carry;
use crate::gateway::ClientHandle;
use crate::ids;
use crate::kube;
use crate::protocol::ServerMessage;
use crate::pty::{Pty, PtyError, SpawnCommand};

#[derive(Debug, thiserror::Error)]
pub enum TermError {
    #[error("unknown session: {0}")]
    Unknown(String),

    #[error("failed to spawn terminal: {0}")]
    Spawn(#[from] PtyError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// What backs a session.
#[derive(Debug, Clone)]
pub enum TermKind {
    Local,
    /// An exec into a container. `owns` is true only for the session whose
    /// creation started the container; duplicates share it without taking
    /// ownership, so the container's lifetime is tied to the original.
    Sandbox {
        container: String,
        image: String,
        owns: bool,
    },
}

impl TermKind {
    pub fn is_sandbox(&self) -> bool {
        matches!(self, Self::Sandbox { .. })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Sandbox { .. } => "sandbox",
        }
    }
}

/// Session lifecycle: Starting until the first output, Closing once any
/// close trigger fires, Closed when cleanup is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Closing,
    Closed,
}

impl Lifecycle {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// One terminal session. Clones share the underlying state.
#[derive(Clone)]
pub struct TermSession {
    pub id: String,
    pub kind: TermKind,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub client: ClientHandle,
    pub pid: Option<u32>,
    input_tx: mpsc::Sender<Bytes>,
    pty: Arc<Mutex<Pty>>,
    size: Arc<Mutex<(u16, u16)>>,
    /// Last known working directory (local sessions only; best effort).
    cwd: Arc<Mutex<Option<PathBuf>>>,
    state: Arc<Mutex<Lifecycle>>,
    close_emitted: Arc<AtomicBool>,
    cancelled: CancellationToken,
}

impl TermSession {
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    pub fn state(&self) -> Lifecycle {
        *self.state.lock()
    }

    pub fn tracked_cwd(&self) -> Option<PathBuf> {
        self.cwd.lock().clone()
    }

    /// Hang up the child, escalating to SIGKILL if it lingers.
    fn kill_child(&self) {
        let Some(pid) = self.pid else { return };
        if pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID exceeds i32::MAX, cannot send signal");
            return;
        }
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(pid as i32, libc::SIGHUP);
            }
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            });
        }
    }
}

impl std::fmt::Debug for TermSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("title", &self.title)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Public listing entry for the catalog surface.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermSessionInfo {
    pub session_id: String,
    pub title: String,
    pub kind: &'static str,
    pub state: &'static str,
    pub cols: u16,
    pub rows: u16,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

struct Inner {
    sessions: HashMap<String, TermSession>,
    title_seq: u64,
}

/// Registry of local and container sessions.
#[derive(Clone)]
pub struct TermRegistry {
    inner: Arc<RwLock<Inner>>,
    runtime: Arc<ContainerRuntime>,
    kube_inject_delay: Duration,
    cwd_refresh_delay: Duration,
}

impl TermRegistry {
    pub fn new(
        runtime: Arc<ContainerRuntime>,
        kube_inject_delay: Duration,
        cwd_refresh_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                sessions: HashMap::new(),
                title_seq: 0,
            })),
            runtime,
            kube_inject_delay,
            cwd_refresh_delay,
        }
    }

    /// Spawn the platform default shell in the user's home directory with
    /// the full ambient environment. With a kube context, the child gets a
    /// marker variable and, after a brief delay, two input lines selecting
    /// that context.
    pub fn create_local(
        &self,
        client: ClientHandle,
        cols: u16,
        rows: u16,
        title: Option<String>,
        kube_context: Option<String>,
    ) -> Result<TermSession, TermError> {
        let id = ids::new_session_id();
        let title = title.unwrap_or_else(|| self.next_default_title());
        let home = dirs::home_dir();

        let mut env = HashMap::new();
        if let Some(ref context) = kube_context {
            env.insert(kube::CONTEXT_ENV_VAR.to_string(), context.clone());
        }

        let session = self.spawn_session(
            client,
            id,
            TermKind::Local,
            title,
            cols,
            rows,
            SpawnCommand::Shell {
                cwd: home.clone(),
                env,
            },
            home,
        )?;

        if let Some(context) = kube_context {
            let input_tx = session.input_tx.clone();
            let delay = self.kube_inject_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for line in kube::context_select_lines(&context) {
                    if input_tx.send(Bytes::from(line)).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(session)
    }

    /// Start a fresh container for this session and attach an interactive
    /// shell to it under a PTY.
    pub async fn create_sandbox(
        &self,
        client: ClientHandle,
        cols: u16,
        rows: u16,
        image: String,
        title: Option<String>,
    ) -> Result<TermSession, TermError> {
        let id = ids::new_session_id();
        self.runtime.ensure_image(&image).await?;
        let container = self.runtime.create_container(&id, &image).await?;
        let (program, args) = self.runtime.exec_spec(&container).await?;
        let title = title.unwrap_or_else(|| self.next_default_title());

        let result = self.spawn_session(
            client,
            id,
            TermKind::Sandbox {
                container: container.clone(),
                image,
                owns: true,
            },
            title,
            cols,
            rows,
            SpawnCommand::Program { program, args },
            None,
        );

        if result.is_err() {
            // Release in reverse acquisition order: the exec never came up,
            // so the container must not outlive this failure.
            let runtime = self.runtime.clone();
            tokio::spawn(async move {
                if let Err(e) = runtime.stop(&container).await {
                    tracing::warn!(error = %e, "failed to stop container after spawn failure");
                }
            });
        }
        result
    }

    /// Derive a new session from an existing one. Local sessions inherit
    /// the original's working directory (best effort); container sessions
    /// share the original's container without owning it. Remote sessions
    /// are not handled here.
    pub async fn duplicate(
        &self,
        client: ClientHandle,
        original_id: &str,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<TermSession, TermError> {
        let original = self
            .get(original_id)
            .ok_or_else(|| TermError::Unknown(original_id.to_string()))?;
        let (original_cols, original_rows) = original.size();
        let cols = cols.unwrap_or(original_cols);
        let rows = rows.unwrap_or(original_rows);
        let title = format!("{} (copy)", original.title);
        let id = ids::new_session_id();

        match original.kind.clone() {
            TermKind::Sandbox {
                container, image, ..
            } => {
                let (program, args) = self.runtime.exec_spec(&container).await?;
                self.spawn_session(
                    client,
                    id,
                    TermKind::Sandbox {
                        container,
                        image,
                        owns: false,
                    },
                    title,
                    cols,
                    rows,
                    SpawnCommand::Program { program, args },
                    None,
                )
            }
            TermKind::Local => {
                let detected = match original.pid {
                    Some(pid) => cwd::current_dir(pid).await,
                    None => None,
                };
                let dir = detected
                    .or_else(|| original.tracked_cwd())
                    .or_else(dirs::home_dir);
                self.spawn_session(
                    client,
                    id,
                    TermKind::Local,
                    title,
                    cols,
                    rows,
                    SpawnCommand::Shell {
                        cwd: dir.clone(),
                        env: HashMap::new(),
                    },
                    dir,
                )
            }
        }
    }

    /// Write input to a session's PTY. Unknown ids are silently dropped.
    /// Input that looks like a directory change schedules a deferred
    /// refresh of the tracked working directory.
    pub async fn input(&self, session_id: &str, data: Bytes) {
        let session = self.get(session_id);
        let Some(session) = session else { return };

        if matches!(session.kind, TermKind::Local) {
            if let Ok(text) = std::str::from_utf8(&data) {
                if cwd::looks_like_chdir(text) {
                    self.schedule_cwd_refresh(&session);
                }
            }
        }

        let _ = session.input_tx.send(data).await;
    }

    /// Adjust the PTY geometry and record it. Unknown ids are silently
    /// dropped; degenerate geometry is passed through to the PTY layer.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let session = self.get(session_id);
        let Some(session) = session else { return };
        *session.size.lock() = (cols, rows);
        let result = session.pty.lock().resize(cols, rows);
        if let Err(e) = result {
            tracing::debug!(session = session_id, error = %e, "pty resize failed");
        }
    }

    /// Terminate a session: kill the child, stop its container when it
    /// owns one, remove the entry, and notify the owning client. Returns
    /// false (a no-op) for unknown ids; the close frame is emitted exactly
    /// once per session.
    pub async fn close(&self, session_id: &str) -> bool {
        let removed = self.inner.write().sessions.remove(session_id);
        let Some(session) = removed else { return false };

        *session.state.lock() = Lifecycle::Closing;
        session.cancelled.cancel();
        session.kill_child();

        if let TermKind::Sandbox {
            ref container,
            owns: true,
            ..
        } = session.kind
        {
            if let Err(e) = self.runtime.stop(container).await {
                tracing::warn!(container = %container, error = %e, "container stop failed");
            }
        }

        *session.state.lock() = Lifecycle::Closed;
        if !session.close_emitted.swap(true, Ordering::SeqCst) {
            session.client.send(ServerMessage::TerminalClosed {
                session_id: session_id.to_string(),
            });
        }
        tracing::info!(session = session_id, "terminal session closed");
        true
    }

    /// Close every session owned by the given client.
    pub async fn close_all_for_client(&self, client_id: u64) {
        let ids: Vec<String> = {
            let inner = self.inner.read();
            inner
                .sessions
                .values()
                .filter(|s| s.client.id == client_id)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in ids {
            tracing::debug!(session = %id, client = client_id, "closing terminal for disconnected client");
            self.close(&id).await;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<TermSession> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listing for the catalog surface.
    pub fn list(&self) -> Vec<TermSessionInfo> {
        let mut sessions: Vec<TermSessionInfo> = self
            .inner
            .read()
            .sessions
            .values()
            .map(|s| {
                let (cols, rows) = s.size();
                TermSessionInfo {
                    session_id: s.id.clone(),
                    title: s.title.clone(),
                    kind: s.kind.as_str(),
                    state: s.state().as_str(),
                    cols,
                    rows,
                    created_at: s.created_at,
                    image: match &s.kind {
                        TermKind::Sandbox { image, .. } => Some(image.clone()),
                        TermKind::Local => None,
                    },
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    fn next_default_title(&self) -> String {
        let mut inner = self.inner.write();
        inner.title_seq += 1;
        format!("Terminal {}", inner.title_seq)
    }

    fn schedule_cwd_refresh(&self, session: &TermSession) {
        let Some(pid) = session.pid else { return };
        let cwd_slot = session.cwd.clone();
        let cancelled = session.cancelled.clone();
        let delay = self.cwd_refresh_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(dir) = cwd::current_dir(pid).await {
                        *cwd_slot.lock() = Some(dir);
                    }
                }
            }
        });
    }

    /// Spawn the PTY, wire up the reader/writer/exit tasks, and register
    /// the session.
    #[allow(clippy::too_many_arguments)]
    fn spawn_session(
        &self,
        client: ClientHandle,
        id: String,
        kind: TermKind,
        title: String,
        cols: u16,
        rows: u16,
        command: SpawnCommand,
        initial_cwd: Option<PathBuf>,
    ) -> Result<TermSession, TermError> {
        let mut pty = Pty::spawn(cols, rows, command)?;
        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;
        let child = pty.take_child();
        let pid = child.as_ref().and_then(|c| c.process_id());

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);
        let session = TermSession {
            id: id.clone(),
            kind,
            title,
            created_at: Utc::now(),
            client: client.clone(),
            pid,
            input_tx,
            pty: Arc::new(Mutex::new(pty)),
            size: Arc::new(Mutex::new((cols, rows))),
            cwd: Arc::new(Mutex::new(initial_cwd)),
            state: Arc::new(Mutex::new(Lifecycle::Starting)),
            close_emitted: Arc::new(AtomicBool::new(false)),
            cancelled: CancellationToken::new(),
        };

        // Child exit monitor (oneshot fires with the exit code).
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<Option<i32>>();
        if let Some(mut child) = child {
            tokio::task::spawn_blocking(move || {
                let code = child.wait().ok().map(|status| status.exit_code() as i32);
                let _ = exit_tx.send(code);
            });
        } else {
            let _ = exit_tx.send(None);
        }

        // PTY reader: forward output verbatim, tagged with the session id.
        // Multi-byte sequences straddling a read boundary are carried to
        // the next chunk instead of being mangled into U+FFFD.
        {
            let client = client.clone();
            let id = id.clone();
            let state = session.state.clone();
            tokio::task::spawn_blocking(move || {
                use std::io::Read;
                let mut reader = reader;
                let mut decoder = Utf8Carry::new();
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            {
                                let mut s = state.lock();
                                if *s == Lifecycle::Starting {
                                    *s = Lifecycle::Running;
                                }
                            }
                            let data = decoder.push(&buf[..n]);
                            if !data.is_empty() {
                                client.send(ServerMessage::Data {
                                    session_id: id.clone(),
                                    data,
                                });
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        // PTY writer: drain the input channel.
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        self.inner
            .write()
            .sessions
            .insert(id.clone(), session.clone());

        // Exit watcher: surface the exit code, then drive the close path.
        {
            let registry = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let code = exit_rx.await.unwrap_or(None);
                let emit_exit = {
                    let state = session.state.lock();
                    *state != Lifecycle::Closing && *state != Lifecycle::Closed
                };
                if emit_exit {
                    tracing::info!(session = %session.id, ?code, "terminal child exited");
                    session.client.send(ServerMessage::TerminalExit {
                        session_id: session.id.clone(),
                        code,
                    });
                }
                registry.close(&session.id).await;
            });
        }

        tracing::info!(session = %session.id, title = %session.title, kind = session.kind.as_str(), "terminal session created");
        Ok(session)
    }
}
