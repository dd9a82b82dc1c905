/// Audit logging of what drnet rendered and where it sent it
///
/// Every rendered script, persisted dry run and dispatch is recorded with a
/// checksum of the script, so a later audit can tell which script a machine
/// actually received.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RenderScript,
    PersistDryRun,
    DispatchScript,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates a new audit log instance
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

    pub fn at(log_path: PathBuf) -> Self {
        Self { log_path }
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

        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
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

    /// Reads the most recent events from the log, newest first
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

fn script_checksum(script: &str) -> String {
    format!("{:x}", Sha256::digest(script.as_bytes()))
}

async fn write(event: AuditEvent) {
    if let Ok(audit) = AuditLog::new()
        && let Err(e) = audit.log(event).await
    {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}

/// Logs a rendered script
pub async fn log_render(machine: &str, action: &str, script: &str, unit_count: usize) {
    write(AuditEvent::new(
        EventType::RenderScript,
        true,
        serde_json::json!({
            "machine": machine,
            "action": action,
            "units": unit_count,
            "sha256": script_checksum(script),
        }),
        None,
    ))
    .await;
}

/// Logs a dry-run script written to disk
pub async fn log_dry_run(machine: &str, path: Option<&std::path::Path>, error: Option<String>) {
    write(AuditEvent::new(
        EventType::PersistDryRun,
        error.is_none(),
        serde_json::json!({
            "machine": machine,
            "path": path.map(|p| p.display().to_string()),
        }),
        error,
    ))
    .await;
}

/// Logs a script handed to a transport
pub async fn log_dispatch(
    machine: &str,
    action: &str,
    passed: Option<u32>,
    failed: Option<u32>,
    error: Option<String>,
) {
    write(AuditEvent::new(
        EventType::DispatchScript,
        error.is_none(),
        serde_json::json!({
            "machine": machine,
            "action": action,
            "passed": passed,
            "failed": failed,
        }),
        error,
    ))
    .await;
}
