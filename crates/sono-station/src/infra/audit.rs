//! Audit trail of operator actions and safety-relevant events, one JSON
//! object per line.

use serde::{Deserialize, Serialize};
use sono_core::TimeBase;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    SessionStarted,
    SessionStopped,
    /// Amplifier stopped answering; output forced off
    ConnectionLost,
    PresetSelected,
    ModeChanged,
    MotorStarted,
    MotorStopped,
    CommandRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe JSONL writer
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// Optional audit sink stamped with the station clock. A failed write is
/// logged and never interrupts control.
pub struct AuditTrail {
    logger: Option<AuditLogger>,
    timebase: TimeBase,
}

impl AuditTrail {
    pub fn new(logger: Option<AuditLogger>, timebase: TimeBase) -> Self {
        Self { logger, timebase }
    }

    pub fn disabled(timebase: TimeBase) -> Self {
        Self::new(None, timebase)
    }

    pub fn record(&self, event_type: AuditEventType, details: serde_json::Value) {
        let Some(logger) = &self.logger else {
            return;
        };
        let entry = AuditEntry {
            timestamp_us: self.timebase.now_us(),
            unix_us: self.timebase.unix_us(),
            event_type,
            details,
        };
        if let Err(e) = logger.log(&entry) {
            warn!(event = ?event_type, error = %e, "audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn trail_appends_jsonl_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");
        let trail = AuditTrail::new(Some(AuditLogger::new(&path).unwrap()), TimeBase::new());

        trail.record(
            AuditEventType::SystemStart,
            serde_json::json!({"version": "0.1.0"}),
        );
        trail.record(
            AuditEventType::PresetSelected,
            serde_json::json!({"preset": "30 kPa", "voltage": 75.0}),
        );

        let content = fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, AuditEventType::SystemStart);
        assert_eq!(entries[1].event_type, AuditEventType::PresetSelected);
        assert_eq!(entries[1].details["voltage"], 75.0);
        assert!(entries[1].timestamp_us >= entries[0].timestamp_us);
    }

    #[test]
    fn reopening_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        for _ in 0..2 {
            let trail = AuditTrail::new(Some(AuditLogger::new(&path).unwrap()), TimeBase::new());
            trail.record(AuditEventType::SystemShutdown, serde_json::json!({}));
        }
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn disabled_trail_is_silent() {
        AuditTrail::disabled(TimeBase::new())
            .record(AuditEventType::CommandRejected, serde_json::json!({}));
    }
}
