use crate::host::HostError;
use strum::{Display, EnumString};
use thiserror::Error;

/// Core error types for iptctl
#[derive(Debug, Error)]
pub enum Error {
    /// The tool reported that a chain or rule does not exist
    #[error("{what} not found: {detail}")]
    NotFound { what: String, detail: String },

    /// The tool reported that a chain or rule already exists
    #[error("{what} already exists: {detail}")]
    AlreadyExists { what: String, detail: String },

    /// A chain cannot be deleted while something still references it
    #[error("{what} is busy: {detail}")]
    Busy { what: String, detail: String },

    /// iptables ran but failed with an unrecognized error
    #[error("iptables error running `{command}`: {message}")]
    Iptables {
        command: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// The host could not run the command at all
    #[error("failed to run `{command}`: {source}")]
    Host {
        command: String,
        #[source]
        source: HostError,
    },

    /// Input validation failed before any command was issued
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },
}

/// Coarse classification of [`Error`] for callers deciding on retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Busy,
    ExecutionFailure,
    MalformedInput,
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Iptables { .. } | Self::Host { .. } => ErrorKind::ExecutionFailure,
            Self::Validation { .. } => ErrorKind::MalformedInput,
        }
    }

    /// Builds the error for a failed tool invocation from its exit status and stderr.
    ///
    /// `what` names the chain or rule the command was acting on.
    pub fn from_failure(
        what: impl Into<String>,
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr: &str,
    ) -> Self {
        let what = what.into();
        let detail = clean_stderr(stderr);
        match classify_failure(exit_code, stderr) {
            FailureKind::NotFound => Self::NotFound { what, detail },
            FailureKind::AlreadyExists => Self::AlreadyExists { what, detail },
            FailureKind::Busy => Self::Busy { what, detail },
            FailureKind::Unrecognized => Self::Iptables {
                command: command.into(),
                message: if detail.is_empty() {
                    format!("exited with status {}", format_exit_code(exit_code))
                } else {
                    detail
                },
                exit_code,
            },
        }
    }
}

/// What a failed iptables invocation means for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    AlreadyExists,
    Busy,
    Unrecognized,
}

/// Classifies a non-zero iptables exit by its stderr text.
///
/// Covers the messages printed by both the legacy and the nf_tables flavors.
/// Only text that unambiguously names absence, duplication or busyness is
/// recognized; everything else (permissions, lock contention, sudo prompts,
/// bad arguments) stays `Unrecognized`.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> FailureKind {
    let lower = stderr.to_lowercase();

    if lower.contains("already exists") || lower.contains("file exists") {
        return FailureKind::AlreadyExists;
    }

    if lower.contains("too many links")
        || lower.contains("resource busy")
        || lower.contains("directory not empty")
        || lower.contains("chain is in use")
    {
        return FailureKind::Busy;
    }

    if lower.contains("no chain/target/match by that name")
        || lower.contains("does a matching rule exist")
        || (lower.contains("no such file or directory") && lower.contains("chain"))
        || (lower.contains("chain") && lower.contains("does not exist"))
    {
        return FailureKind::NotFound;
    }

    // `-C` exits 1 with no output when the rule is absent on some builds
    if exit_code == Some(1) && lower.trim().is_empty() {
        return FailureKind::NotFound;
    }

    FailureKind::Unrecognized
}

fn clean_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("Try `iptables -h'"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_exit_code(code: Option<i32>) -> String {
    code.map_or_else(|| "unknown (killed by signal)".to_string(), |c| c.to_string())
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables/ssh error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify iptables rules")
                .with_suggestion("Run as root, or pass --sudo for remote hosts")
                .with_suggestion("Set IPTCTL_ELEVATION_METHOD=sudo for scripted local runs")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // sudo refused to run non-interactively
        if lower.contains("a password is required") || lower.contains("a terminal is required") {
            return ErrorTranslation::new("sudo on the target host requires a password")
                .with_suggestion("Add a NOPASSWD sudoers entry for iptables")
                .with_suggestion("Or connect as root instead of using --sudo");
        }

        // Missing iptables
        if lower.contains("command not found") || lower.contains("failed to spawn") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables-nft  (Arch)")
                .with_suggestion("Or point iptables_path in config.json at the binary");
        }

        // Remote connection problems
        if lower.contains("connection refused")
            || lower.contains("could not resolve hostname")
            || lower.contains("no route to host")
            || lower.contains("host key verification failed")
            || lower.contains("publickey")
        {
            return ErrorTranslation::new("Could not open an SSH session to the remote host")
                .with_suggestion("Verify the address and port passed to --ssh")
                .with_suggestion("Check that the identity file is authorized on the host")
                .with_suggestion("Try: ssh -o BatchMode=yes -l <user> <host> true");
        }

        // xtables lock contention
        if lower.contains("xtables lock") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Wait for the other firewall tool to finish")
                .with_suggestion("Set lock_wait_secs in config.json to wait for the lock");
        }

        // Chain or rule missing
        if lower.contains("no chain/target/match") || lower.contains("not found") {
            return ErrorTranslation::new("Chain or rule not found")
                .with_suggestion("Create the chain before linking or adding rules to it")
                .with_suggestion("Check the description matches the one used when linking")
                .with_suggestion("List existing links: iptctl links <table> <chain>");
        }

        // Chain still referenced
        if lower.contains("busy") || lower.contains("too many links") {
            return ErrorTranslation::new("Chain is still referenced and cannot be deleted")
                .with_suggestion("Delete inner chains before the chains that link to them")
                .with_suggestion("Detach extra parents with: iptctl unlink")
                .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html");
        }

        // Bad arguments
        if lower.contains("bad argument")
            || lower.contains("unknown arg")
            || lower.contains("invalid")
            || lower.contains("validation error")
        {
            return ErrorTranslation::new("Invalid rule arguments")
                .with_suggestion("Chain names: max 28 chars, no spaces, not starting with '-'")
                .with_suggestion("Ports must be between 1 and 65535, ranges as start:end")
                .with_suggestion("Destinations must be IPv4 addresses, optionally with :port");
        }

        // Timeout errors
        if lower.contains("timeout") || lower.contains("timed out") {
            return ErrorTranslation::new("Operation timed out")
                .with_suggestion("The command took too long on the target host")
                .with_suggestion("Raise --timeout or check host load");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -t nat -S")
            .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
