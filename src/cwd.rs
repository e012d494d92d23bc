//! Best-effort working-directory tracking for local shell sessions.
//!
//! Duplicating a local terminal should land in the original's current
//! directory. The kernel knows it; we read it where the platform exposes
//! it and report "unknown" everywhere else. Callers fall back to the last
//! tracked value, so detection failure never fails a duplicate.

use std::path::PathBuf;

/// Current working directory of a live process, if the platform can tell.
#[cfg(target_os = "linux")]
pub async fn current_dir(pid: u32) -> Option<PathBuf> {
    tokio::fs::read_link(format!("/proc/{pid}/cwd")).await.ok()
}

/// macOS has no /proc; ask lsof for the cwd file descriptor.
#[cfg(target_os = "macos")]
pub async fn current_dir(pid: u32) -> Option<PathBuf> {
    let output = tokio::process::Command::new("lsof")
        .args(["-a", "-d", "cwd", "-p", &pid.to_string(), "-Fn"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix('n').map(PathBuf::from))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub async fn current_dir(_pid: u32) -> Option<PathBuf> {
    None
}

/// Whether an input chunk looks like it contains a directory change. Used
/// to schedule a deferred refresh of the tracked working directory; false
/// positives only cost one extra probe.
pub fn looks_like_chdir(input: &str) -> bool {
    input
        .split(['\r', '\n', ';'])
        .map(str::trim_start)
        .any(|line| line == "cd" || line.starts_with("cd ") || line.starts_with("cd\t"))
}
