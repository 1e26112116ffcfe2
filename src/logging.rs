//! Append-only audit trail.
//!
//! Events emitted with `target: AUDIT_TARGET` and a `kind` field are captured
//! by [`AuditLayer`] and written to the audit file as
//! `YYYY-MM-DD HH:MM:SS [KIND] {json detail}`. The file is never read back.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::error::{BotError, Result};

/// Target that routes an event into the audit file
pub const AUDIT_TARGET: &str = "audit";

/// A single audit line
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<chrono::Local>,
    pub kind: String,
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl AuditEntry {
    /// Format as one log line, without the trailing newline
    pub fn format(&self) -> String {
        format!(
            "{} [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            serde_json::Value::Object(self.detail.clone())
        )
    }
}

/// Buffered append-only audit file
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Open for appending, creating the file if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BotError::AuditLog {
                path: path.display().to_string(),
                source: e,
            })?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) {
        let mut writer = self.writer.lock();
        // Emitting a tracing event from here would re-enter the layer
        if let Err(e) = writeln!(writer, "{}", entry.format()) {
            eprintln!("Failed to write audit log {}: {}", self.path.display(), e);
        }
    }

    /// Push buffered lines to disk
    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush().map_err(|e| BotError::AuditLog {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

/// Shared audit log type
pub type SharedAuditLog = Arc<AuditLog>;

pub fn create_audit_log(path: impl AsRef<Path>) -> Result<SharedAuditLog> {
    Ok(Arc::new(AuditLog::open(path)?))
}

/// Tracing layer that captures audit events into the audit file
pub struct AuditLayer {
    log: SharedAuditLog,
}

impl AuditLayer {
    pub fn new(log: SharedAuditLog) -> Self {
        Self { log }
    }
}

impl<S> Layer<S> for AuditLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != AUDIT_TARGET {
            return;
        }

        let mut visitor = AuditVisitor::default();
        event.record(&mut visitor);

        let entry = AuditEntry {
            timestamp: chrono::Local::now(),
            kind: visitor
                .kind
                .unwrap_or_else(|| event.metadata().level().to_string()),
            detail: visitor.detail,
        };

        self.log.append(&entry);
    }
}

/// Splits the `kind` field off and collects everything else as JSON detail
#[derive(Default)]
struct AuditVisitor {
    kind: Option<String>,
    detail: serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for AuditVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.detail.insert(
            field.name().to_string(),
            serde_json::Value::String(format!("{:?}", value)),
        );
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "kind" {
            self.kind = Some(value.to_string());
        } else {
            self.detail
                .insert(field.name().to_string(), serde_json::Value::from(value));
        }
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.detail
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.detail
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.detail
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_entry_format() {
        let mut detail = serde_json::Map::new();
        detail.insert("member".to_string(), serde_json::Value::from("42"));

        let entry = AuditEntry {
            timestamp: chrono::Local::now(),
            kind: "NEW_MEMBER".to_string(),
            detail,
        };

        let line = entry.format();
        assert!(line.contains(" [NEW_MEMBER] "));
        assert!(line.ends_with(r#"{"member":"42"}"#));
    }

    #[test]
    fn test_layer_captures_only_audit_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.log");
        let log = create_audit_log(&path).unwrap();

        let subscriber = tracing_subscriber::registry().with(AuditLayer::new(log.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: AUDIT_TARGET, kind = "SYSTEM", "Bot initialized");
            tracing::info!("not an audit line");
            tracing::info!(
                target: AUDIT_TARGET,
                kind = "BOT_FILTERED",
                member = 7u64,
                is_bot = true,
                "Skipping bot account"
            );
        });
        log.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[SYSTEM]"));
        assert!(lines[0].contains("Bot initialized"));
        assert!(lines[1].contains("[BOT_FILTERED]"));
        assert!(lines[1].contains(r#""member":7"#));
        assert!(lines[1].contains(r#""is_bot":true"#));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        for kind in ["FIRST", "SECOND"] {
            let log = AuditLog::open(&path).unwrap();
            log.append(&AuditEntry {
                timestamp: chrono::Local::now(),
                kind: kind.to_string(),
                detail: serde_json::Map::new(),
            });
            log.flush().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("[FIRST]"));
        assert!(content.contains("[SECOND]"));
    }
}
