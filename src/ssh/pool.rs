//! Keyed cache of live SSH transports with reference counting and idle
//! expiry.
//!
//! A transport is shared by every session whose (host, port, username)
//! matches. The pool owns transport lifetime exclusively: sessions acquire
//! and release, nothing else closes a pooled transport directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client;
use russh::Disconnect;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::params::{PoolKey, SshParams};

/// A pooled, authenticated transport handle.
pub type Transport = Arc<client::Handle<ClientHandler>>;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("unreachable host {0}")]
    UnreachableHost(String),

    #[error("authentication failed for {0}")]
    AuthFailed(String),

    #[error("ssh transport error: {0}")]
    Transport(#[source] russh::Error),

    #[error("failed to open remote shell: {0}")]
    RemoteOpenFailed(String),

    #[error("unknown ssh session: {0}")]
    Unknown(String),
}

/// Client-side russh event handler. Host keys are accepted without
/// verification; the gateway has no key store and the source protocol
/// carries no fingerprint field.
pub struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct PoolEntry {
    transport: Transport,
    refcount: usize,
    /// Cancels the pending idle-close task, when one is armed.
    idle_cancel: Option<CancellationToken>,
}

/// Reference-counted transport cache. Cheap to clone; all clones share
/// the same entries.
#[derive(Clone)]
pub struct TransportPool {
    inner: Arc<Mutex<HashMap<PoolKey, PoolEntry>>>,
    idle_close: Duration,
    keepalive: Duration,
    ready_timeout: Duration,
}

impl TransportPool {
    pub fn new(idle_close: Duration, keepalive: Duration, ready_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            idle_close,
            keepalive,
            ready_timeout,
        }
    }

    /// Acquire a transport for `params`, reusing a live pooled entry when
    /// the key matches and dialing a new one otherwise. On success the
    /// entry's reference count reflects this caller; failure inserts
    /// nothing.
    pub async fn acquire(&self, params: &SshParams) -> Result<Transport, SshError> {
        let key = params.pool_key();

        {
            let mut inner = self.inner.lock();
            let stale = matches!(inner.get(&key), Some(entry) if entry.transport.is_closed());
            if stale {
                inner.remove(&key);
            } else if let Some(entry) = inner.get_mut(&key) {
                if let Some(cancel) = entry.idle_cancel.take() {
                    cancel.cancel();
                }
                entry.refcount += 1;
                tracing::debug!(key = %key, refcount = entry.refcount, "reusing pooled transport");
                return Ok(entry.transport.clone());
            }
        }

        let transport = self.dial(params).await?;

        let mut inner = self.inner.lock();
        let pooled = match inner.get_mut(&key) {
            // Lost a dial race; keep the established entry.
            Some(entry) if !entry.transport.is_closed() => {
                if let Some(cancel) = entry.idle_cancel.take() {
                    cancel.cancel();
                }
                entry.refcount += 1;
                Some(entry.transport.clone())
            }
            _ => None,
        };
        match pooled {
            Some(existing) => {
                let surplus = transport;
                tokio::spawn(async move {
                    let _ = surplus
                        .disconnect(Disconnect::ByApplication, "duplicate transport", "en")
                        .await;
                });
                Ok(existing)
            }
            None => {
                tracing::info!(key = %key, "established new ssh transport");
                inner.insert(
                    key,
                    PoolEntry {
                        transport: transport.clone(),
                        refcount: 1,
                        idle_cancel: None,
                    },
                );
                Ok(transport)
            }
        }
    }

    /// Drop one reference. At zero the entry stays cached with an armed
    /// idle-close timer; a subsequent acquire before expiry disarms it.
    pub fn release(&self, key: &PoolKey) {
        let mut inner = self.inner.lock();
        let armed = {
            let Some(entry) = inner.get_mut(key) else {
                return;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            tracing::debug!(key = %key, refcount = entry.refcount, "released pooled transport");
            if entry.refcount > 0 {
                return;
            }
            if entry.transport.is_closed() {
                None
            } else {
                let cancel = CancellationToken::new();
                entry.idle_cancel = Some(cancel.clone());
                Some(cancel)
            }
        };
        let Some(cancel) = armed else {
            inner.remove(key);
            return;
        };
        drop(inner);

        let pool = self.clone();
        let key = key.clone();
        let idle = self.idle_close;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(idle) => pool.expire(&key),
            }
        });
    }

    /// Close and remove an entry whose idle timer fired, unless it was
    /// re-acquired in the meantime.
    fn expire(&self, key: &PoolKey) {
        let transport = {
            let mut inner = self.inner.lock();
            let idle = matches!(inner.get(key), Some(entry) if entry.refcount == 0);
            if idle {
                inner.remove(key).map(|e| e.transport)
            } else {
                None
            }
        };
        if let Some(transport) = transport {
            tracing::info!(key = %key, "closing idle ssh transport");
            tokio::spawn(async move {
                let _ = transport
                    .disconnect(Disconnect::ByApplication, "idle", "en")
                    .await;
            });
        }
    }

    /// Remove entries whose transport has closed underneath us, regardless
    /// of reference count. Sessions borrowing such a transport observe
    /// their channels closing and clean themselves up independently.
    pub fn prune_closed(&self) {
        let mut inner = self.inner.lock();
        inner.retain(|key, entry| {
            let live = !entry.transport.is_closed();
            if !live {
                tracing::warn!(key = %key, "pruning closed ssh transport");
                if let Some(cancel) = entry.idle_cancel.take() {
                    cancel.cancel();
                }
            }
            live
        });
    }

    /// Current reference count for a key, if pooled. Exposed for the
    /// catalog surface and for tests.
    pub fn refcount(&self, key: &PoolKey) -> Option<usize> {
        self.inner.lock().get(key).map(|e| e.refcount)
    }

    /// Number of pooled transports (any refcount, including idle).
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel all idle timers and close every transport.
    pub fn shutdown(&self) {
        let entries: Vec<(PoolKey, PoolEntry)> = self.inner.lock().drain().collect();
        for (key, mut entry) in entries {
            if let Some(cancel) = entry.idle_cancel.take() {
                cancel.cancel();
            }
            tracing::debug!(key = %key, "closing transport on shutdown");
            let transport = entry.transport;
            tokio::spawn(async move {
                let _ = transport
                    .disconnect(Disconnect::ByApplication, "server shutting down", "en")
                    .await;
            });
        }
    }

    async fn dial(&self, params: &SshParams) -> Result<Transport, SshError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(self.keepalive),
            ..Default::default()
        });

        let endpoint = (params.host.as_str(), params.port);
        let mut handle = tokio::time::timeout(
            self.ready_timeout,
            client::connect(config, endpoint, ClientHandler),
        )
        .await
        .map_err(|_| {
            SshError::UnreachableHost(format!("{}:{} (timed out)", params.host, params.port))
        })?
        .map_err(|e| match e {
            russh::Error::IO(_) => {
                SshError::UnreachableHost(format!("{}:{}", params.host, params.port))
            }
            other => SshError::Transport(other),
        })?;

        let authenticated = if let Some(ref password) = params.password {
            handle
                .authenticate_password(&params.username, password)
                .await
                .map_err(SshError::Transport)?
        } else if let Some(ref pem) = params.private_key {
            let key = russh_keys::decode_secret_key(pem, params.passphrase.as_deref())
                .map_err(|_| SshError::AuthFailed(params.title()))?;
            handle
                .authenticate_publickey(&params.username, Arc::new(key))
                .await
                .map_err(SshError::Transport)?
        } else {
            false
        };

        if !authenticated {
            return Err(SshError::AuthFailed(params.title()));
        }
        Ok(Arc::new(handle))
    }
}
