use crate::core::manager::{DEFAULT_IPTABLES_PATH, ManagerOptions};
use crate::host::ssh::SshConfig;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

/// Longest command timeout accepted from the config file (1 hour)
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Remote host used when `--ssh` is not given; local execution if unset
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    /// Kill a single iptables invocation after this many seconds (0 disables)
    ///
    /// Clamped to [`MAX_COMMAND_TIMEOUT_SECS`].
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// iptables binary on the target host
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,
    /// Pass `-w <secs>` so iptables waits for the xtables lock
    #[serde(default)]
    pub lock_wait_secs: Option<u32>,
    /// Elevate local commands with run0/sudo/pkexec when not root
    #[serde(default = "default_true")]
    pub elevate_local: bool,
    /// Record every rule change in the audit log
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ssh: None,
            command_timeout_secs: default_command_timeout(),
            iptables_path: default_iptables_path(),
            lock_wait_secs: None,
            elevate_local: true,
            audit_enabled: true,
        }
    }
}

fn default_command_timeout() -> u64 {
    30
}

fn default_iptables_path() -> String {
    DEFAULT_IPTABLES_PATH.to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        match self.command_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs.min(MAX_COMMAND_TIMEOUT_SECS))),
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            program: self.iptables_path.clone(),
            lock_wait_secs: self.lock_wait_secs,
        }
    }
}

/// Saves the app config to disk using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Security
///
/// On Unix systems, files are created with mode 0o600 (user read/write only),
/// since the config may name private key files and remote accounts.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    if let Some(dir) = get_data_dir() {
        save_config_to(&dir, config).await?;
    }
    Ok(())
}

pub(crate) async fn save_config_to(dir: &Path, config: &AppConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let temp_path = dir.join(format!("{CONFIG_FILE}.tmp"));
    let path = dir.join(CONFIG_FILE);

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the app config from disk, or returns default if not found.
///
/// A config file that cannot be parsed is reported and ignored.
pub async fn load_config() -> AppConfig {
    match get_data_dir() {
        Some(dir) => load_config_from(&dir).await,
        None => AppConfig::default(),
    }
}

pub(crate) async fn load_config_from(dir: &Path) -> AppConfig {
    let path = dir.join(CONFIG_FILE);
    let Ok(json) = tokio::fs::read_to_string(&path).await else {
        return AppConfig::default();
    };

    match serde_json::from_str::<AppConfig>(&json) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Ignoring invalid config file: {e}");
            AppConfig::default()
        }
    }
}
