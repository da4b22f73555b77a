//! Audit pipeline
//!
//! Every state-changing operation emits an [`AuditEvent`]. The default sink
//! writes it to the `audit` tracing target and appends it as one JSON line
//! to the audit log file. The file is only ever appended to.

use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Who triggered an operation
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Actor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn new(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self { ip, user_agent }
    }

    /// Background tasks and startup
    pub fn system() -> Self {
        Self {
            ip: None,
            user_agent: Some("system".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub actor: Actor,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(action: &str, resource: &str, resource_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.to_string(),
            resource: resource.to_string(),
            resource_id: resource_id.into(),
            actor: Actor::system(),
            success: true,
            error: None,
            fields: Map::new(),
        }
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn failed(mut self, error: impl Display) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Tracing + JSONL file sink
pub struct AuditLog {
    path: Option<PathBuf>,
    append_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            append_lock: Mutex::new(()),
        }
    }

    /// Only emit to the tracing target
    pub fn tracing_only() -> Self {
        Self {
            path: None,
            append_lock: Mutex::new(()),
        }
    }

    fn append(&self, path: &PathBuf, line: &str) -> std::io::Result<()> {
        let _guard = self.append_lock.lock();
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }
}

impl AuditSink for AuditLog {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = %event.action,
            resource = %event.resource,
            resource_id = %event.resource_id,
            ip = event.actor.ip.as_deref().unwrap_or("-"),
            success = event.success,
            error = event.error.as_deref().unwrap_or(""),
            "audit event"
        );
        let Some(path) = &self.path else {
            return;
        };
        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = self.append(path, &line) {
                    warn!(path = %path.display(), error = %e, "failed to append audit event");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize audit event"),
        }
    }
}
