/// Audit logging for rule changes
///
/// Every chain, link and DNAT change made through the CLI is recorded with the
/// host it ran against and whether it succeeded.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    CreateChain,
    LinkChain,
    UnlinkChain,
    AppendDnat,
    DeleteDnat,
    DeleteChain,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Host the command ran against (`localhost` or `ssh://user@host:port`)
    pub host: String,

    /// Whether the operation succeeded
    pub success: bool,

    /// Chain names, descriptions and forwarding details
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        host: impl Into<String>,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            host: host.into(),
            success,
            details,
            error,
        }
    }

    /// One-line form for terminal output.
    pub fn summary(&self) -> String {
        let outcome = match &self.error {
            None if self.success => "ok".to_string(),
            None => "failed".to_string(),
            Some(error) => format!("failed: {error}"),
        };
        format!(
            "{} {} {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.host,
            self.event_type,
            self.details,
            outcome
        )
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates an audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads up to `count` of the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Records the outcome of one rule change.
///
/// Audit failures are reported with `warn!` and never fail the operation.
pub async fn log_operation<T>(
    event_type: EventType,
    host: &str,
    details: serde_json::Value,
    result: &crate::Result<T>,
) {
    match AuditLog::new() {
        Ok(audit) => record(&audit, event_type, host, details, result).await,
        Err(e) => tracing::warn!("Audit log unavailable: {}", e),
    }
}

async fn record<T>(
    audit: &AuditLog,
    event_type: EventType,
    host: &str,
    details: serde_json::Value,
    result: &crate::Result<T>,
) {
    let event = AuditEvent::new(
        event_type,
        host,
        result.is_ok(),
        details,
        result.as_ref().err().map(ToString::to_string),
    );

    if let Err(e) = audit.log(event).await {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}
