//! Privilege elevation for local iptables invocations
//!
//! iptables needs `CAP_NET_ADMIN`. iptctl runs as whatever user started it and
//! only elevates the iptables invocations made by [`crate::host::local::LocalHost`].
//!
//! # Elevation Strategy
//!
//! - **Root**: run directly, no prompt
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-terminal fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `IPTCTL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for scripts with sudoers NOPASSWD rules where you want to bypass run0/polkit.
//!   Example: `IPTCTL_ELEVATION_METHOD=sudo iptctl create-chain DESKTOP-A`
//!
//! - `IPTCTL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only iptables binaries can be elevated
//! - Commands are constructed without shell interpolation
//! - The elevation helper and target program are checked for availability

use std::path::Path;
use tokio::process::Command;

/// Binaries that may be run with elevated privileges
const ELEVATABLE_PROGRAMS: [&str; 6] = [
    "iptables",
    "iptables-legacy",
    "iptables-nft",
    "ip6tables",
    "ip6tables-legacy",
    "ip6tables-nft",
];

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `IPTCTL_ELEVATION_METHOD`
    #[error("Invalid IPTCTL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Program is not on the elevation allowlist
    #[error("Refusing to elevate '{0}': only iptables binaries may be elevated")]
    NotAllowed(String),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn is_elevatable(program: &str) -> bool {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| ELEVATABLE_PROGRAMS.contains(&name))
}

fn wrapped(helper: &str, program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Creates a command running `program` with root privileges.
///
/// `program` may be a bare name or an absolute path, but its file name must
/// be an iptables binary unless no elevation is needed (root, or test mode).
///
/// # Errors
///
/// Returns `Err` if the program is not allowed to be elevated, if
/// `IPTCTL_ELEVATION_METHOD` is invalid, or if the chosen helper is missing.
///
/// # Testing
///
/// Set `IPTCTL_TEST_NO_ELEVATION=1` to run the program directly.
pub fn create_elevated_command(program: &str, args: &[String]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("IPTCTL_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    if !is_elevatable(program) {
        return Err(ElevationError::NotAllowed(program.to_string()));
    }

    // 3. Explicit elevation method override (for scripts with sudoers NOPASSWD, etc.)
    if let Ok(method) = std::env::var("IPTCTL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fallback to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);

    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}
