//! SQLite metadata mirror
//!
//! Mirrors CA info, certificate metadata, the serial mapping and email
//! settings into a single SQLite file. Every failure marks the mirror
//! unhealthy and is reported as [`Error::Transient`]; the next successful
//! statement marks it healthy again. Reads skip the mirror while it is
//! unhealthy.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::paths::SafeName;
use super::{CaInfo, CertificateRecord, MetadataBackend};
use crate::configs::EmailSettings;
use crate::error::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ca_info (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    name TEXT NOT NULL,
    organization TEXT NOT NULL,
    country TEXT NOT NULL,
    serial_counter INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    key_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS certificates (
    name TEXT PRIMARY KEY,
    serial TEXT NOT NULL,
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    issuer TEXT NOT NULL,
    not_before TEXT NOT NULL,
    not_after TEXT NOT NULL,
    sans TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    revoked_at TEXT
);
CREATE TABLE IF NOT EXISTS serials (
    serial TEXT PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS serials_by_name ON serials(name);
CREATE TABLE IF NOT EXISTS settings (
    topic TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub struct DbMirror {
    conn: Mutex<Connection>,
    healthy: AtomicBool,
}

impl DbMirror {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| anyhow!("Failed to open database {}: {}", path.display(), e))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| anyhow!("Failed to open in-memory database: {}", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| anyhow!("Failed to apply database schema: {}", e))?;
        debug!("database mirror schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
            healthy: AtomicBool::new(true),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn with_conn<T>(&self, op: &str, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        match f(&conn) {
            Ok(v) => {
                self.healthy.store(true, Ordering::Relaxed);
                Ok(v)
            }
            Err(e) => {
                if self.healthy.swap(false, Ordering::Relaxed) {
                    warn!(op, error = %e, "database mirror marked unhealthy");
                }
                Err(Error::Transient(format!("database {op}: {e}")))
            }
        }
    }
}

fn parse_time(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

impl MetadataBackend for DbMirror {
    fn name(&self) -> &'static str {
        "database"
    }

    fn save_ca_info(&self, info: &CaInfo) -> Result<()> {
        self.with_conn("save_ca_info", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO ca_info
                 (id, name, organization, country, serial_counter, created_at, expires_at, key_hash)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    info.name,
                    info.organization,
                    info.country,
                    info.serial_counter as i64,
                    info.created_at.to_rfc3339(),
                    info.expires_at.to_rfc3339(),
                    info.key_hash,
                ],
            )
            .map(|_| ())
        })
    }

    fn load_ca_info(&self) -> Result<Option<CaInfo>> {
        self.with_conn("load_ca_info", |conn| {
            conn.query_row(
                "SELECT name, organization, country, serial_counter, created_at, expires_at, key_hash
                 FROM ca_info WHERE id = 1",
                [],
                |row| {
                    let counter: i64 = row.get(3)?;
                    let created: String = row.get(4)?;
                    let expires: String = row.get(5)?;
                    Ok(CaInfo {
                        name: row.get(0)?,
                        organization: row.get(1)?,
                        country: row.get(2)?,
                        serial_counter: counter.max(0) as u64,
                        created_at: parse_time(&created)?,
                        expires_at: parse_time(&expires)?,
                        key_hash: row.get(6)?,
                    })
                },
            )
            .optional()
        })
    }

    fn record_certificate(&self, record: &CertificateRecord) -> Result<()> {
        let sans = serde_json::to_string(&record.sans)?;
        self.with_conn("record_certificate", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO certificates
                 (name, serial, kind, subject, issuer, not_before, not_after, sans, revoked, revoked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.name,
                    record.serial,
                    record.kind.as_str(),
                    record.subject,
                    record.issuer,
                    record.not_before.to_rfc3339(),
                    record.not_after.to_rfc3339(),
                    sans,
                    record.revoked,
                    record.revoked_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map(|_| ())
        })
    }

    fn delete_certificate(&self, name: &SafeName) -> Result<()> {
        self.with_conn("delete_certificate", |conn| {
            conn.execute("DELETE FROM certificates WHERE name = ?1", params![name.as_str()])?;
            conn.execute("DELETE FROM serials WHERE name = ?1", params![name.as_str()])?;
            Ok(())
        })
    }

    fn list_certificates(&self) -> Result<Vec<String>> {
        self.with_conn("list_certificates", |conn| {
            let mut stmt = conn.prepare("SELECT name FROM certificates ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    fn save_serial(&self, serial: &SafeName, name: &SafeName) -> Result<()> {
        self.with_conn("save_serial", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO serials (serial, name) VALUES (?1, ?2)",
                params![serial.as_str(), name.as_str()],
            )
            .map(|_| ())
        })
    }

    fn lookup_serial(&self, serial: &SafeName) -> Result<Option<String>> {
        self.with_conn("lookup_serial", |conn| {
            conn.query_row(
                "SELECT name FROM serials WHERE serial = ?1",
                params![serial.as_str()],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn delete_serial(&self, serial: &SafeName) -> Result<()> {
        self.with_conn("delete_serial", |conn| {
            conn.execute("DELETE FROM serials WHERE serial = ?1", params![serial.as_str()])
                .map(|_| ())
        })
    }

    fn save_email_settings(&self, settings: &EmailSettings) -> Result<()> {
        let value = serde_json::to_string(settings)?;
        self.with_conn("save_email_settings", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (topic, value) VALUES ('email', ?1)",
                params![value],
            )
            .map(|_| ())
        })
    }

    fn load_email_settings(&self) -> Result<Option<EmailSettings>> {
        let value: Option<String> = self.with_conn("load_email_settings", |conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE topic = 'email'",
                [],
                |row| row.get(0),
            )
            .optional()
        })?;
        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v).map_err(|e| {
                Error::Transient(format!("database email settings: {e}"))
            })?)),
            None => Ok(None),
        }
    }
}
