/// Audit logging for privileged operations
///
/// Every firewall mutation and container state change made by dockfw is
/// appended to a JSON-lines log in the XDG state directory.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InitializeFirewall,
    InsertRule,
    AppendRule,
    DeleteRule,
    DropRules,
    SaveHostConfig,
    StartContainer,
    PauseContainer,
    UpdateHosts,
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

    /// Error message if operation failed
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
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the default state directory
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

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line
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

    /// Logs an event; a failing audit write only produces a warning.
    pub async fn record<T>(
        &self,
        event_type: EventType,
        details: serde_json::Value,
        result: &Result<T, crate::Error>,
    ) {
        let event = AuditEvent::new(
            event_type,
            result.is_ok(),
            details,
            result.as_ref().err().map(ToString::to_string),
        );

        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }

    /// Reads the most recent events, newest first
    #[cfg(test)]
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

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        let ok: Result<(), crate::Error> = Ok(());
        audit
            .record(
                EventType::InsertRule,
                serde_json::json!({ "rule": "FORWARD -s 1.2.3.4/32" }),
                &ok,
            )
            .await;

        let failed: Result<(), crate::Error> = Err(crate::Error::Runtime("boom".into()));
        audit
            .record(EventType::PauseContainer, serde_json::json!({}), &failed)
            .await;

        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::PauseContainer);
        assert!(!events[0].success);
        assert!(events[0].error.as_deref().unwrap().contains("boom"));
        assert_eq!(events[1].details["rule"], "FORWARD -s 1.2.3.4/32");

        let raw = std::fs::read_to_string(audit.path()).unwrap();
        assert!(raw.contains("\"event_type\":\"insert_rule\""));
    }
}
