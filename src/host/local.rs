//! Local command execution

use super::{CommandOutput, Host, HostError, run_with_timeout};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Options for [`LocalHost`]
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    /// Run commands through run0/sudo/pkexec unless already root
    pub elevate: bool,
    /// Kill commands that run longer than this
    pub timeout: Option<Duration>,
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Default)]
pub struct LocalHost {
    config: LocalConfig,
}

impl LocalHost {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Host for LocalHost {
    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput, HostError> {
        let cmd = if self.config.elevate {
            crate::elevation::create_elevated_command(program, args)?
        } else {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        };

        let output = run_with_timeout(cmd, program, self.config.timeout).await?;
        debug!(
            program,
            exit_code = ?output.exit_code,
            "local command finished"
        );
        Ok(output)
    }
}
