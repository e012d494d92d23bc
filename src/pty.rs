//! Pseudo-terminal plumbing for local and container-exec sessions.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// What to run inside the pseudo-terminal.
#[derive(Debug, Clone)]
pub enum SpawnCommand {
    /// The platform default shell ($SHELL, /bin/sh fallback), optionally
    /// at a working directory and with extra environment variables. The
    /// ambient environment is inherited either way.
    Shell {
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
    },
    /// An arbitrary program with arguments (container exec).
    Program { program: String, args: Vec<String> },
}

impl Default for SpawnCommand {
    fn default() -> Self {
        Self::Shell {
            cwd: None,
            env: HashMap::new(),
        }
    }
}

pub struct Pty {
    pair: PtyPair,
    child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
}

impl Pty {
    /// Spawn a PTY with the given geometry and command.
    pub fn spawn(cols: u16, rows: u16, spawn_cmd: SpawnCommand) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let cmd = Self::build_command(&spawn_cmd);
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;

        Ok(Self {
            pair,
            child: Some(child),
        })
    }

    fn build_command(spawn_cmd: &SpawnCommand) -> CommandBuilder {
        let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());

        let mut cmd = match spawn_cmd {
            SpawnCommand::Shell { cwd, env } => {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
                let mut cmd = CommandBuilder::new(&shell);
                if let Some(dir) = cwd {
                    cmd.cwd(dir);
                }
                for (key, value) in env {
                    cmd.env(key, value);
                }
                cmd
            }
            SpawnCommand::Program { program, args } => {
                let mut cmd = CommandBuilder::new(program);
                for arg in args {
                    cmd.arg(arg);
                }
                cmd
            }
        };

        cmd.env("TERM", term);
        cmd
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.pair
            .master
            .try_clone_reader()
            .map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.pair.master.take_writer().map_err(PtyError::TakeWriter)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.pair
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    pub fn take_child(&mut self) -> Option<Box<dyn portable_pty::Child + Send + Sync>> {
        self.child.take()
    }
}
