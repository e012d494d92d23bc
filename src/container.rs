//! Uniform façade over the host's container runtime.
//!
//! The first call probes `docker` then `podman`; the result (including
//! absence) is cached for the process lifetime. All operations shell out to
//! the detected CLI.

use std::process::Output;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::ids;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("no container runtime available (tried docker, podman)")]
    NoRuntime,

    #[error("failed to pull image {image}: {detail}")]
    PullFailed { image: String, detail: String },

    #[error("failed to create container: {0}")]
    CreateFailed(String),

    #[error("failed to exec into container: {0}")]
    ExecFailed(String),

    #[error("failed to stop container {name}: {detail}")]
    StopFailed { name: String, detail: String },
}

/// Which CLI backs the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// Deterministic container name for a session.
pub fn container_name(session_id: &str) -> String {
    format!("termgate-sandbox-{}", ids::short(session_id))
}

/// A container already removed by auto-removal counts as stopped.
fn is_already_gone(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container")
        || lower.contains("container not found")
        || lower.contains("no container with name")
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[derive(Default)]
pub struct ContainerRuntime {
    detected: OnceCell<Option<RuntimeKind>>,
}

impl ContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The detected runtime, probing on first use.
    pub async fn detect(&self) -> Result<RuntimeKind, ContainerError> {
        let detected = self
            .detected
            .get_or_init(|| async {
                for kind in [RuntimeKind::Docker, RuntimeKind::Podman] {
                    if probe(kind).await {
                        tracing::info!(runtime = kind.command(), "container runtime detected");
                        return Some(kind);
                    }
                }
                tracing::warn!("no container runtime available");
                None
            })
            .await;
        detected.ok_or(ContainerError::NoRuntime)
    }

    /// Pull `image` unless it is already present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        let runtime = self.detect().await?;
        if self.list_local_images().await?.iter().any(|i| i == image) {
            tracing::debug!(image, "image already present");
            return Ok(());
        }

        tracing::info!(image, "pulling image");
        let output = Command::new(runtime.command())
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| ContainerError::PullFailed {
                image: image.to_string(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ContainerError::PullFailed {
                image: image.to_string(),
                detail: stderr_of(&output),
            });
        }
        Ok(())
    }

    /// Start a detached interactive container for a session, named after
    /// its id and configured for auto-removal on stop.
    pub async fn create_container(
        &self,
        session_id: &str,
        image: &str,
    ) -> Result<String, ContainerError> {
        let runtime = self.detect().await?;
        let name = container_name(session_id);
        let output = Command::new(runtime.command())
            .args(["run", "-d", "-it", "--rm", "--name", &name, image, "/bin/sh"])
            .output()
            .await
            .map_err(|e| ContainerError::CreateFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(ContainerError::CreateFailed(stderr_of(&output)));
        }
        tracing::info!(container = %name, image, "container started");
        Ok(name)
    }

    /// Command that, run under a PTY, attaches an interactive shell inside
    /// the container.
    pub async fn exec_spec(
        &self,
        container: &str,
    ) -> Result<(String, Vec<String>), ContainerError> {
        let runtime = self.detect().await?;
        Ok((
            runtime.command().to_string(),
            vec![
                "exec".to_string(),
                "-it".to_string(),
                container.to_string(),
                "/bin/sh".to_string(),
            ],
        ))
    }

    /// Stop a container. Idempotent: a container already gone by
    /// auto-removal is success.
    pub async fn stop(&self, container: &str) -> Result<(), ContainerError> {
        let runtime = self.detect().await?;
        let output = Command::new(runtime.command())
            .args(["stop", container])
            .output()
            .await
            .map_err(|e| ContainerError::StopFailed {
                name: container.to_string(),
                detail: e.to_string(),
            })?;
        if output.status.success() || is_already_gone(&stderr_of(&output)) {
            tracing::debug!(container, "container stopped");
            return Ok(());
        }
        Err(ContainerError::StopFailed {
            name: container.to_string(),
            detail: stderr_of(&output),
        })
    }

    /// Image strings present locally, used to short-circuit `ensure_image`.
    /// A failed listing degrades to "nothing present" (the pull decides).
    pub async fn list_local_images(&self) -> Result<Vec<String>, ContainerError> {
        let runtime = self.detect().await?;
        let output = match Command::new(runtime.command())
            .args(["images", "--format", "{{.Repository}}:{{.Tag}}"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                tracing::warn!(stderr = %stderr_of(&output), "image listing failed");
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::warn!(error = %e, "image listing failed");
                return Ok(Vec::new());
            }
        };
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

async fn probe(kind: RuntimeKind) -> bool {
    match Command::new(kind.command()).arg("info").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
