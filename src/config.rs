//! Runtime tunables for the gateway.
//!
//! Everything here has a sensible default; the CLI only overrides the bind
//! address, port, and data directory.

use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the persisted catalogs (remembered images,
    /// remembered SSH session parameters). Created recursively on first
    /// write.
    pub data_dir: PathBuf,
    /// Maximum accepted size of a single inbound client frame. Larger
    /// frames are discarded with an `error` frame.
    pub max_frame_len: usize,
    /// How long a pooled SSH transport with zero users stays open before
    /// it is closed.
    pub pool_idle_close: Duration,
    /// Keep-alive ping interval for pooled SSH transports.
    pub keepalive_interval: Duration,
    /// Bound on SSH transport establishment (TCP connect + handshake +
    /// auth).
    pub ready_timeout: Duration,
    /// Remembered SSH session parameters older than this are evicted.
    pub saved_params_max_age: Duration,
    /// Delay before the kube-context selection lines are written into a
    /// freshly spawned local shell.
    pub kube_inject_delay: Duration,
    /// Delay before the tracked working directory is re-probed after input
    /// that looks like a directory change.
    pub cwd_refresh_delay: Duration,
    /// Geometry used when a create request omits cols/rows.
    pub default_cols: u16,
    pub default_rows: u16,
    /// Terminal type requested for SSH sessions unless the client names one.
    pub default_term: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".termgate");
        Self {
            data_dir,
            max_frame_len: 1024 * 1024,
            pool_idle_close: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(20),
            saved_params_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            kube_inject_delay: Duration::from_millis(750),
            cwd_refresh_delay: Duration::from_millis(500),
            default_cols: 80,
            default_rows: 30,
            default_term: "xterm-256color".to_string(),
        }
    }
}

impl Config {
    /// Path of the remembered-images catalog file.
    pub fn images_path(&self) -> PathBuf {
        self.data_dir.join("images.json")
    }

    /// Path of the remembered SSH session parameters file.
    pub fn ssh_sessions_path(&self) -> PathBuf {
        self.data_dir.join("ssh-sessions.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_frame_len, 1024 * 1024);
        assert_eq!(config.pool_idle_close, Duration::from_secs(300));
        assert_eq!(config.keepalive_interval, Duration::from_secs(10));
        assert_eq!(config.ready_timeout, Duration::from_secs(20));
        assert_eq!(config.saved_params_max_age, Duration::from_secs(604_800));
        assert_eq!(config.default_cols, 80);
        assert_eq!(config.default_rows, 30);
        assert_eq!(config.default_term, "xterm-256color");
    }

    #[test]
    fn catalog_paths_live_under_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/tg-test"),
            ..Default::default()
        };
        assert_eq!(config.images_path(), PathBuf::from("/tmp/tg-test/images.json"));
        assert_eq!(
            config.ssh_sessions_path(),
            PathBuf::from("/tmp/tg-test/ssh-sessions.json")
        );
    }
}
