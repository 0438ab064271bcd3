//! Command execution backends
//!
//! The [`Host`] trait is the only way the manager touches a machine: run a
//! program with an argument list and collect its output. The manager never
//! learns whether the command ran locally or over SSH.
//!
//! - [`local::LocalHost`] - child process on this machine, with optional elevation
//! - [`ssh::SshHost`] - the same command line on a remote machine via OpenSSH

pub mod local;
pub mod ssh;

use crate::elevation::ElevationError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Shared host trait object.
pub type DynHost = Arc<dyn Host>;

/// Errors raised when a command could not be run to completion.
///
/// A command that ran and exited non-zero is *not* a host error; its status
/// and stderr come back in [`CommandOutput`].
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The program (or the ssh client) could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Privilege escalation is not available
    #[error("elevation unavailable: {0}")]
    Elevation(#[from] ElevationError),

    /// The remote session could not be established
    #[error("connection to {remote} failed: {message}")]
    Connection { remote: String, message: String },

    /// The command did not finish in time and was killed
    #[error("timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    /// Waiting for the child failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code(),
        }
    }
}

/// Command execution against one machine.
#[async_trait]
pub trait Host: Send + Sync {
    /// Human-readable target, used in logs.
    fn describe(&self) -> String;

    /// Runs `program` with `args` and waits for it to exit.
    ///
    /// Arguments are passed through verbatim; backends must not interpret them.
    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput, HostError>;
}

/// Waits for `cmd` to finish, killing it once `timeout` expires.
pub(crate) async fn run_with_timeout(
    mut cmd: tokio::process::Command,
    program: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutput, HostError> {
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| HostError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| HostError::Timeout(limit))??,
        None => child.wait_with_output().await?,
    };

    Ok(output.into())
}
