//! Remote command execution through the OpenSSH client
//!
//! Each command opens its own `ssh` session in batch mode, so authentication
//! must not prompt: use a key (optionally via `ssh-agent`) and, with `sudo`, a
//! NOPASSWD rule on the remote side. The remote login shell parses the command
//! line, so every argument is single-quoted before it is sent.

use super::{CommandOutput, Host, HostError, run_with_timeout};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Exit status `ssh` uses for its own failures
const SSH_FAILURE_STATUS: i32 = 255;

const DEFAULT_SSH_PORT: u16 = 22;

/// Connection settings for [`SshHost`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// `host` or `host:port` (IPv6 as `[addr]:port`)
    pub remote: String,
    pub user: String,
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    /// Prefix remote commands with `sudo -n`
    #[serde(default)]
    pub sudo: bool,
    /// Accept unknown host keys on first connect
    #[serde(default)]
    pub accept_new_host_keys: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl SshConfig {
    pub fn new(remote: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            user: user.into(),
            private_key_file: None,
            sudo: false,
            accept_new_host_keys: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Runs commands on a remote machine.
#[derive(Debug, Clone)]
pub struct SshHost {
    config: SshConfig,
    host: String,
    port: u16,
    timeout: Option<Duration>,
}

impl SshHost {
    /// # Errors
    ///
    /// Returns `HostError::Connection` if `remote` or `user` cannot be used.
    pub fn new(config: SshConfig, timeout: Option<Duration>) -> Result<Self, HostError> {
        let (host, port) = parse_remote(&config.remote).map_err(|message| {
            HostError::Connection {
                remote: config.remote.clone(),
                message,
            }
        })?;

        if config.user.is_empty() || config.user.starts_with('-') {
            return Err(HostError::Connection {
                remote: config.remote.clone(),
                message: format!("invalid user '{}'", config.user),
            });
        }

        Ok(Self {
            config,
            host,
            port,
            timeout,
        })
    }

    /// Arguments passed to the local `ssh` binary.
    fn ssh_args(&self, program: &str, args: &[String]) -> Vec<String> {
        let mut ssh_args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];

        if self.config.accept_new_host_keys {
            ssh_args.push("-o".to_string());
            ssh_args.push("StrictHostKeyChecking=accept-new".to_string());
        }

        ssh_args.push("-p".to_string());
        ssh_args.push(self.port.to_string());

        if let Some(key) = &self.config.private_key_file {
            ssh_args.push("-i".to_string());
            ssh_args.push(key.display().to_string());
        }

        ssh_args.push("-l".to_string());
        ssh_args.push(self.config.user.clone());
        ssh_args.push(self.host.clone());
        ssh_args.push("--".to_string());
        ssh_args.push(self.remote_command_line(program, args));
        ssh_args
    }

    fn remote_command_line(&self, program: &str, args: &[String]) -> String {
        let mut words = Vec::with_capacity(args.len() + 3);
        if self.config.sudo {
            words.push("sudo".to_string());
            words.push("-n".to_string());
        }
        words.push(shell_quote(program));
        words.extend(args.iter().map(|a| shell_quote(a)));
        words.join(" ")
    }
}

#[async_trait]
impl Host for SshHost {
    fn describe(&self) -> String {
        format!("ssh://{}@{}:{}", self.config.user, self.host, self.port)
    }

    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput, HostError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(program, args));

        let output = run_with_timeout(cmd, "ssh", self.timeout).await?;
        debug!(
            remote = %self.describe(),
            program,
            exit_code = ?output.exit_code,
            "remote command finished"
        );

        if output.exit_code == Some(SSH_FAILURE_STATUS) {
            return Err(HostError::Connection {
                remote: self.describe(),
                message: output.stderr_lossy().trim().to_string(),
            });
        }

        Ok(output)
    }
}

/// Splits `host[:port]` / `[v6addr][:port]`.
fn parse_remote(remote: &str) -> Result<(String, u16), String> {
    let remote = remote.trim();
    if remote.is_empty() {
        return Err("remote address is empty".to_string());
    }

    let (host, port) = if let Some(rest) = remote.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated '[' in '{remote}'"))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(format!("unexpected '{tail}' after address")),
        }
    } else {
        match remote.rsplit_once(':') {
            // A bare IPv6 address has several colons and no port
            Some((host, _)) if host.contains(':') => (remote, None),
            Some((host, port)) => (host, Some(port)),
            None => (remote, None),
        }
    };

    if host.is_empty() || host.starts_with('-') {
        return Err(format!("invalid host '{host}'"));
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid port '{port}'"))?,
        None => DEFAULT_SSH_PORT,
    };

    Ok((host.to_string(), port))
}

/// Quotes a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let is_safe = !word.is_empty()
        && word
            .chars()
            .all(|c| {
                c.is_ascii_alphanumeric()
                    || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '@')
            });

    if is_safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
