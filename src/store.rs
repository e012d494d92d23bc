//! Persisted advisory catalogs.
//!
//! Two small JSON files in the data directory survive restarts: the
//! remembered container images (an insertion-ordered array, most recent
//! first) and the remembered SSH session parameters (a map from session id
//! to saved parameters plus a timestamp). Losing either file degrades
//! convenience, never correctness, so persistence failures are logged and
//! swallowed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ssh::SshParams;

/// Remembered container image names. Set semantics, most recent first.
#[derive(Clone)]
pub struct ImageStore {
    path: PathBuf,
    inner: Arc<Mutex<Vec<String>>>,
}

impl ImageStore {
    /// Load the catalog from `path`, starting empty if the file is missing
    /// or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let images = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed image catalog");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            path,
            inner: Arc::new(Mutex::new(images)),
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.lock().clone()
    }

    /// Insert (or re-promote) an image name at the front and return the
    /// updated set.
    pub fn insert(&self, image: &str) -> Vec<String> {
        let snapshot = {
            let mut images = self.inner.lock();
            images.retain(|i| i != image);
            images.insert(0, image.to_string());
            images.clone()
        };
        self.persist(&snapshot);
        snapshot
    }

    /// Remove an image name and return the updated set.
    pub fn remove(&self, image: &str) -> Vec<String> {
        let snapshot = {
            let mut images = self.inner.lock();
            images.retain(|i| i != image);
            images.clone()
        };
        self.persist(&snapshot);
        snapshot
    }

    fn persist(&self, images: &[String]) {
        if let Err(e) = write_json(&self.path, &images, false) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist image catalog");
        }
    }
}

/// A remembered SSH session: the full connection parameters (credentials
/// included, as the source protocol persists them) plus when they were
/// saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSshSession {
    pub params: SshParams,
    pub saved_at: DateTime<Utc>,
}

/// Remembered SSH session parameters, keyed by session id. Entries older
/// than `max_age` are evicted lazily on load and lookup.
#[derive(Clone)]
pub struct SshParamsStore {
    path: PathBuf,
    max_age: Duration,
    inner: Arc<Mutex<HashMap<String, SavedSshSession>>>,
}

impl SshParamsStore {
    pub fn load(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        let path = path.into();
        let mut sessions: HashMap<String, SavedSshSession> =
            match std::fs::read_to_string(&path) {
                Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring malformed ssh session catalog");
                    HashMap::new()
                }),
                Err(_) => HashMap::new(),
            };
        let before = sessions.len();
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        sessions.retain(|_, saved| saved.saved_at > cutoff);
        if sessions.len() != before {
            tracing::info!(evicted = before - sessions.len(), "evicted stale remembered ssh sessions");
        }
        warn_if_world_readable(&path);
        Self {
            path,
            max_age,
            inner: Arc::new(Mutex::new(sessions)),
        }
    }

    /// Remember the parameters used for `session_id`, stamped now.
    pub fn insert(&self, session_id: &str, params: SshParams) {
        let snapshot = {
            let mut sessions = self.inner.lock();
            sessions.insert(
                session_id.to_string(),
                SavedSshSession {
                    params,
                    saved_at: Utc::now(),
                },
            );
            sessions.clone()
        };
        self.persist(&snapshot);
    }

    /// Parameters remembered for `session_id`, unless they have aged out.
    pub fn get(&self, session_id: &str) -> Option<SshParams> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.max_age).unwrap_or_default();
        let mut sessions = self.inner.lock();
        match sessions.get(session_id) {
            Some(saved) if saved.saved_at > cutoff => Some(saved.params.clone()),
            Some(_) => {
                sessions.remove(session_id);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, sessions: &HashMap<String, SavedSshSession>) {
        if let Err(e) = write_json(&self.path, sessions, true) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist ssh session catalog");
        }
    }
}

/// Serialize `value` to `path`, creating parent directories recursively.
/// `restrict` additionally narrows the file mode to 0600 on Unix (the ssh
/// catalog carries credentials).
fn write_json<T: Serialize>(path: &Path, value: &T, restrict: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    if restrict {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = restrict;
    Ok(())
}

/// Warn when the ssh catalog is readable by other users.
#[cfg(unix)]
fn warn_if_world_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o004 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{:o}", mode & 0o7777),
                "remembered ssh sessions file is world-readable; it contains credentials"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_world_readable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(host: &str) -> SshParams {
        SshParams {
            host: host.into(),
            port: 22,
            username: "alice".into(),
            password: Some("pw".into()),
            private_key: None,
            passphrase: None,
            term: None,
        }
    }

    #[test]
    fn image_store_starts_empty_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::load(dir.path().join("images.json"));
        assert!(store.list().is_empty());
    }

    #[test]
    fn image_insert_is_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::load(dir.path().join("images.json"));
        store.insert("alpine:latest");
        store.insert("ubuntu:24.04");
        assert_eq!(store.list(), vec!["ubuntu:24.04", "alpine:latest"]);
    }

    #[test]
    fn image_insert_has_set_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::load(dir.path().join("images.json"));
        store.insert("alpine:latest");
        store.insert("ubuntu:24.04");
        // Re-inserting promotes instead of duplicating.
        let images = store.insert("alpine:latest");
        assert_eq!(images, vec!["alpine:latest", "ubuntu:24.04"]);
    }

    #[test]
    fn image_remove_returns_updated_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::load(dir.path().join("images.json"));
        store.insert("alpine:latest");
        store.insert("busybox");
        assert_eq!(store.remove("alpine:latest"), vec!["busybox"]);
        assert_eq!(store.remove("not-there"), vec!["busybox"]);
    }

    #[test]
    fn image_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/images.json");
        {
            let store = ImageStore::load(&path);
            store.insert("alpine:latest");
            store.insert("ubuntu:24.04");
        }
        let reloaded = ImageStore::load(&path);
        assert_eq!(reloaded.list(), vec!["ubuntu:24.04", "alpine:latest"]);
    }

    #[test]
    fn ssh_store_round_trips_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh-sessions.json");
        let max_age = Duration::from_secs(7 * 24 * 3600);
        {
            let store = SshParamsStore::load(&path, max_age);
            store.insert("sess-1", params("bastion"));
        }
        let reloaded = SshParamsStore::load(&path, max_age);
        let saved = reloaded.get("sess-1").expect("params survive restart");
        assert_eq!(saved.host, "bastion");
        assert_eq!(saved.password.as_deref(), Some("pw"));
    }

    #[test]
    fn ssh_store_get_unknown_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SshParamsStore::load(
            dir.path().join("ssh-sessions.json"),
            Duration::from_secs(60),
        );
        assert!(store.get("ghost").is_none());
    }

    #[test]
    fn ssh_store_evicts_aged_entries_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = SshParamsStore::load(
            dir.path().join("ssh-sessions.json"),
            Duration::from_secs(0),
        );
        store.insert("old", params("h"));
        // max_age of zero means everything is already stale.
        assert!(store.get("old").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn ssh_store_evicts_aged_entries_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh-sessions.json");
        {
            let store = SshParamsStore::load(&path, Duration::from_secs(3600));
            store.insert("sess", params("h"));
        }
        let reloaded = SshParamsStore::load(&path, Duration::from_secs(0));
        assert!(reloaded.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn ssh_catalog_is_written_mode_600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh-sessions.json");
        let store = SshParamsStore::load(&path, Duration::from_secs(3600));
        store.insert("sess", params("h"));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_catalog_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let images_path = dir.path().join("images.json");
        std::fs::write(&images_path, "{not json").unwrap();
        assert!(ImageStore::load(&images_path).list().is_empty());

        let ssh_path = dir.path().join("ssh-sessions.json");
        std::fs::write(&ssh_path, "[]").unwrap(); // wrong shape
        let store = SshParamsStore::load(&ssh_path, Duration::from_secs(60));
        assert!(store.is_empty());
    }
}
