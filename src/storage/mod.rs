//! Persistence layer
//!
//! Three tiers behind one facade:
//! - [`FileStore`]: the authoritative file tree; every write lands here first
//!   and must succeed
//! - [`DbMirror`]: optional SQLite copy of the metadata
//! - [`ObjectStore`]: optional byte-for-byte copy of every file written
//!
//! plus an optional in-process [`Cache`]. Mirror failures are logged and
//! reported to the audit sink but never fail the caller. Reads go cache →
//! database (when enabled and healthy) → file tree.

pub mod cache;
pub mod db_mirror;
pub mod file_store;
pub mod object_mirror;
pub mod paths;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use cache::{Cache, CacheKey, CacheTtls};
pub use db_mirror::DbMirror;
pub use file_store::{FileStore, MODE_PRIVATE, MODE_PUBLIC};
pub use object_mirror::{DirectoryObjectStore, ObjectStore};
pub use paths::{AcmeCollection, Paths, SafeName};

use crate::audit::{AuditEvent, AuditSink};
use crate::configs::{CacheConfig, EmailSettings, StorageConfig};
use crate::error::{Error, Result};
use crate::generate_leaf_cert::CertificateKind;

/// CA identity as persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaInfo {
    pub name: String,
    pub organization: String,
    pub country: String,
    /// Number of leaf certificates issued so far
    pub serial_counter: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// SHA-256 of the CA public key (PKIX DER), hex
    pub key_hash: String,
}

/// Metadata of one issued certificate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateRecord {
    pub name: String,
    pub serial: String,
    pub kind: CertificateKind,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub sans: Vec<String>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Operations every metadata tier provides
pub trait MetadataBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn save_ca_info(&self, info: &CaInfo) -> Result<()>;

    fn load_ca_info(&self) -> Result<Option<CaInfo>>;

    fn record_certificate(&self, record: &CertificateRecord) -> Result<()>;

    fn delete_certificate(&self, name: &SafeName) -> Result<()>;

    fn list_certificates(&self) -> Result<Vec<String>>;

    fn save_serial(&self, serial: &SafeName, name: &SafeName) -> Result<()>;

    fn lookup_serial(&self, serial: &SafeName) -> Result<Option<String>>;

    fn delete_serial(&self, serial: &SafeName) -> Result<()>;

    fn save_email_settings(&self, settings: &EmailSettings) -> Result<()>;

    fn load_email_settings(&self) -> Result<Option<EmailSettings>>;
}

const EMAIL_TOPIC: &str = "email";

pub struct Storage {
    files: FileStore,
    db: Option<DbMirror>,
    objects: Option<Box<dyn ObjectStore>>,
    cache: Option<Cache>,
    audit: Arc<dyn AuditSink>,
    counter_lock: Mutex<()>,
}

impl Storage {
    /// Open the storage tiers selected by the configuration
    ///
    /// # Errors
    /// [`Error::Config`] when an enabled mirror cannot be opened, and a fatal
    /// error when the base directory cannot be created.
    pub fn open(
        config: &StorageConfig,
        cache_config: &CacheConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let files = FileStore::new(Paths::new(&config.path));
        files.init()?;

        let db = if config.db_enabled {
            let path = config.db_path();
            let db = DbMirror::open(&path).map_err(|e| Error::Config(format!("{e:#}")))?;
            info!(path = %path.display(), "database mirror enabled");
            Some(db)
        } else {
            None
        };

        let objects: Option<Box<dyn ObjectStore>> = match (&config.object_store_path, config.object_store_enabled) {
            (Some(root), true) => {
                let store =
                    DirectoryObjectStore::new(root).map_err(|e| Error::Config(format!("{e:#}")))?;
                info!(root = %root.display(), "object store mirror enabled");
                Some(Box::new(store))
            }
            (None, true) => {
                return Err(Error::Config(
                    "OBJECT_STORE_PATH is required when OBJECT_STORE_ENABLED is set".into(),
                ))
            }
            _ => None,
        };

        let cache = cache_config.enabled.then(|| {
            Cache::new(CacheTtls {
                auth_token: Duration::from_secs(cache_config.auth_ttl_secs),
                ..CacheTtls::default()
            })
        });

        Ok(Self {
            files,
            db,
            objects,
            cache,
            audit,
            counter_lock: Mutex::new(()),
        })
    }

    /// File tree only; no mirrors, no cache
    pub fn files_only(base: impl Into<PathBuf>, audit: Arc<dyn AuditSink>) -> Result<Self> {
        let files = FileStore::new(Paths::new(base));
        files.init()?;
        Ok(Self {
            files,
            db: None,
            objects: None,
            cache: None,
            audit,
            counter_lock: Mutex::new(()),
        })
    }

    pub fn paths(&self) -> &Paths {
        self.files.paths()
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    fn healthy_db(&self) -> Option<&DbMirror> {
        self.db.as_ref().filter(|db| db.is_healthy())
    }

    fn mirror_failed(&self, backend: &str, op: &str, err: &dyn std::fmt::Display) {
        warn!(backend, op, error = %err, "mirror write failed");
        self.audit
            .record(AuditEvent::new("mirror_write", backend, op).failed(err));
    }

    fn cache_get<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.cache.as_ref().and_then(|c| c.get(key))
    }

    fn cache_put<T: Serialize>(&self, key: &CacheKey, value: &T) {
        if let Some(cache) = &self.cache {
            cache.put(key, value);
        }
    }

    fn cache_invalidate(&self, key: &CacheKey) {
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
    }

    // ---- bytes ----

    /// Write a file under the base directory and mirror it
    pub fn write_file(&self, path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
        file_store::write_atomic(path, bytes, mode)?;
        if let Some(objects) = &self.objects {
            if let Some(key) = self.paths().relative_key(path) {
                if let Err(e) = objects.put(&key, bytes, mode) {
                    self.mirror_failed(objects.name(), "put", &format!("{key}: {e:#}"));
                }
            }
        }
        Ok(())
    }

    pub fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(file_store::read_optional(path)?)
    }

    pub fn remove_file(&self, path: &Path) -> Result<()> {
        file_store::remove_if_exists(path)?;
        if let Some(objects) = &self.objects {
            if let Some(key) = self.paths().relative_key(path) {
                if let Err(e) = objects.delete(&key) {
                    self.mirror_failed(objects.name(), "delete", &format!("{key}: {e:#}"));
                }
            }
        }
        Ok(())
    }

    // ---- CA info ----

    pub fn save_ca_info(&self, info: &CaInfo) -> Result<()> {
        self.files.save_ca_info(info)?;
        for key in [
            self.paths().ca_name_file(),
            self.paths().ca_organization_file(),
            self.paths().ca_country_file(),
            self.paths().serial_counter(),
        ] {
            self.mirror_existing(&key, MODE_PUBLIC);
        }
        if let Some(db) = &self.db {
            if let Err(e) = db.save_ca_info(info) {
                self.mirror_failed(db.name(), "save_ca_info", &e);
            }
        }
        self.cache_invalidate(&CacheKey::CaInfo);
        Ok(())
    }

    pub fn load_ca_info(&self) -> Result<Option<CaInfo>> {
        if let Some(info) = self.cache_get::<CaInfo>(&CacheKey::CaInfo) {
            return Ok(Some(info));
        }
        let mut loaded = None;
        if let Some(db) = self.healthy_db() {
            match db.load_ca_info() {
                Ok(found) => loaded = found,
                Err(e) => debug!(error = %e, "database read failed; using file store"),
            }
        }
        if loaded.is_none() {
            loaded = self.files.load_ca_info()?;
        }
        if let Some(info) = &loaded {
            self.cache_put(&CacheKey::CaInfo, info);
        }
        Ok(loaded)
    }

    /// Increment the issued-certificate counter
    pub fn bump_serial_counter(&self) -> Result<u64> {
        let _guard = self.counter_lock.lock();
        let mut info = self.files.load_ca_info()?.ok_or(Error::NotInitialized)?;
        info.serial_counter += 1;
        self.save_ca_info(&info)?;
        Ok(info.serial_counter)
    }

    fn mirror_existing(&self, path: &Path, mode: u32) {
        let Some(objects) = &self.objects else {
            return;
        };
        let Some(key) = self.paths().relative_key(path) else {
            return;
        };
        match file_store::read_optional(path) {
            Ok(Some(bytes)) => {
                if let Err(e) = objects.put(&key, &bytes, mode) {
                    self.mirror_failed(objects.name(), "put", &format!("{key}: {e:#}"));
                }
            }
            Ok(None) => {}
            Err(e) => self.mirror_failed(objects.name(), "put", &format!("{key}: {e:#}")),
        }
    }

    // ---- certificates ----

    /// Create the per-certificate directory
    pub fn create_certificate_dir(&self, name: &SafeName) -> Result<PathBuf> {
        let dir = self.paths().cert_dir(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Mirror certificate metadata after the files were written
    pub fn record_certificate(&self, record: &CertificateRecord) -> Result<()> {
        self.files.record_certificate(record)?;
        if let Some(db) = &self.db {
            if let Err(e) = db.record_certificate(record) {
                self.mirror_failed(db.name(), "record_certificate", &e);
            }
        }
        self.cache_invalidate(&CacheKey::Certificate(record.name.clone()));
        self.cache_invalidate(&CacheKey::CertificateList);
        Ok(())
    }

    pub fn certificate(&self, name: &SafeName) -> Result<Option<CertificateRecord>> {
        let key = CacheKey::Certificate(name.to_string());
        if let Some(record) = self.cache_get::<CertificateRecord>(&key) {
            return Ok(Some(record));
        }
        let record = self.files.read_certificate(name)?;
        if let Some(record) = &record {
            self.cache_put(&key, record);
        }
        Ok(record)
    }

    /// Re-read a certificate from the file tree and mirror its metadata
    pub fn refresh_certificate(&self, name: &SafeName) -> Result<Option<CertificateRecord>> {
        self.cache_invalidate(&CacheKey::Certificate(name.to_string()));
        let record = self.files.read_certificate(name)?;
        if let Some(record) = &record {
            self.record_certificate(record)?;
        }
        Ok(record)
    }

    /// Remove a certificate everywhere: directory, serial mappings, database
    /// rows and mirrored objects
    pub fn delete_certificate(&self, name: &SafeName) -> Result<()> {
        let serials = self.serials_for(name)?;
        self.files.delete_certificate(name)?;
        for serial in &serials {
            self.files.delete_serial(serial)?;
            self.cache_invalidate(&CacheKey::Serial(serial.to_string()));
        }
        if let Some(db) = &self.db {
            if let Err(e) = db.delete_certificate(name) {
                self.mirror_failed(db.name(), "delete_certificate", &e);
            }
        }
        if let Some(objects) = &self.objects {
            if let Err(e) = objects.delete_prefix(name.as_str()) {
                self.mirror_failed(objects.name(), "delete_prefix", &format!("{e:#}"));
            }
            for serial in &serials {
                let key = format!("serials/{serial}");
                if let Err(e) = objects.delete(&key) {
                    self.mirror_failed(objects.name(), "delete", &format!("{key}: {e:#}"));
                }
            }
        }
        self.cache_invalidate(&CacheKey::Certificate(name.to_string()));
        self.cache_invalidate(&CacheKey::CertificateList);
        Ok(())
    }

    /// Serial mapping entries that point at `name`
    fn serials_for(&self, name: &SafeName) -> Result<Vec<SafeName>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(self.paths().serials_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let Ok(serial) = SafeName::serial(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if self.files.lookup_serial(&serial)?.as_deref() == Some(name.as_str()) {
                out.push(serial);
            }
        }
        Ok(out)
    }

    pub fn list_certificates(&self) -> Result<Vec<String>> {
        if let Some(list) = self.cache_get::<Vec<String>>(&CacheKey::CertificateList) {
            return Ok(list);
        }
        let mut names = None;
        if let Some(db) = self.healthy_db() {
            match db.list_certificates() {
                Ok(list) => names = Some(list),
                Err(e) => debug!(error = %e, "database read failed; using file store"),
            }
        }
        let names = match names {
            Some(list) => list,
            None => self.files.list_certificates()?,
        };
        self.cache_put(&CacheKey::CertificateList, &names);
        Ok(names)
    }

    // ---- serial mapping ----

    pub fn save_serial(&self, serial: &SafeName, name: &SafeName) -> Result<()> {
        self.files.save_serial(serial, name)?;
        self.mirror_existing(&self.paths().serial_mapping(serial), MODE_PUBLIC);
        if let Some(db) = &self.db {
            if let Err(e) = db.save_serial(serial, name) {
                self.mirror_failed(db.name(), "save_serial", &e);
            }
        }
        self.cache_invalidate(&CacheKey::Serial(serial.to_string()));
        Ok(())
    }

    pub fn lookup_serial(&self, serial: &SafeName) -> Result<Option<String>> {
        let key = CacheKey::Serial(serial.to_string());
        if let Some(name) = self.cache_get::<String>(&key) {
            return Ok(Some(name));
        }
        let mut found = None;
        if let Some(db) = self.healthy_db() {
            match db.lookup_serial(serial) {
                Ok(name) => found = name,
                Err(e) => debug!(error = %e, "database read failed; using file store"),
            }
        }
        if found.is_none() {
            found = self.files.lookup_serial(serial)?;
        }
        if let Some(name) = &found {
            self.cache_put(&key, name);
        }
        Ok(found)
    }

    // ---- settings ----

    pub fn save_email_settings(&self, settings: &EmailSettings) -> Result<()> {
        self.files.save_email_settings(settings)?;
        if let Some(db) = &self.db {
            if let Err(e) = db.save_email_settings(settings) {
                self.mirror_failed(db.name(), "save_email_settings", &e);
            }
        }
        self.cache_invalidate(&CacheKey::Settings(EMAIL_TOPIC.to_string()));
        Ok(())
    }

    pub fn load_email_settings(&self) -> Result<Option<EmailSettings>> {
        let key = CacheKey::Settings(EMAIL_TOPIC.to_string());
        if let Some(settings) = self.cache_get::<EmailSettings>(&key) {
            return Ok(Some(settings));
        }
        let mut found = None;
        if let Some(db) = self.healthy_db() {
            match db.load_email_settings() {
                Ok(settings) => found = settings,
                Err(e) => debug!(error = %e, "database read failed; using file store"),
            }
        }
        if found.is_none() {
            found = self.files.load_email_settings()?;
        }
        if let Some(settings) = &found {
            self.cache_put(&key, settings);
        }
        Ok(found)
    }

    /// Write the environment's email settings unless some are already stored
    pub fn seed_email_settings(&self, settings: &EmailSettings) -> Result<bool> {
        if self.files.load_email_settings()?.is_some() {
            return Ok(false);
        }
        self.save_email_settings(settings)?;
        Ok(true)
    }

    /// Reload the hot keys into the cache
    pub fn warm_cache(&self) -> Result<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let purged = cache.purge_expired();
        cache.invalidate(&CacheKey::CertificateList);
        cache.invalidate(&CacheKey::CaInfo);
        self.list_certificates()?;
        self.load_ca_info()?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use tempfile::TempDir;

    fn storage(dir: &TempDir, db: bool, objects: Option<PathBuf>) -> Storage {
        let config = StorageConfig {
            path: dir.path().join("data"),
            db_enabled: db,
            db_path: None,
            object_store_enabled: objects.is_some(),
            object_store_path: objects,
            audit_log_path: None,
        };
        Storage::open(
            &config,
            &CacheConfig::default(),
            Arc::new(AuditLog::tracing_only()),
        )
        .unwrap()
    }

    fn ca_info(name: &str, counter: u64) -> CaInfo {
        let now = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        CaInfo {
            name: name.into(),
            organization: "Acme".into(),
            country: "US".into(),
            serial_counter: counter,
            created_at: now,
            expires_at: now + chrono::Duration::days(3650),
            key_hash: "00".repeat(32),
        }
    }

    #[test]
    fn test_save_ca_info_is_visible_through_cache() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, true, None);
        let db = storage.db.as_ref().unwrap();

        storage.save_ca_info(&ca_info("Test CA", 1)).unwrap();
        // the file tier alone cannot load without ca.pem; the database can
        assert_eq!(storage.load_ca_info().unwrap().unwrap().serial_counter, 1);
        assert_eq!(db.load_ca_info().unwrap().unwrap().name, "Test CA");

        storage.save_ca_info(&ca_info("Test CA", 2)).unwrap();
        assert_eq!(storage.load_ca_info().unwrap().unwrap().serial_counter, 2);
    }

    #[test]
    fn test_serial_lookup_uses_cache_then_files() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, false, None);
        let serial = SafeName::serial("ABCD").unwrap();
        let name = SafeName::certificate("web1").unwrap();
        storage.save_serial(&serial, &name).unwrap();
        assert_eq!(storage.lookup_serial(&serial).unwrap().as_deref(), Some("web1"));
        assert_eq!(
            storage
                .cache()
                .unwrap()
                .get::<String>(&CacheKey::Serial("ABCD".into()))
                .as_deref(),
            Some("web1")
        );
    }

    #[test]
    fn test_writes_are_mirrored_to_object_store() {
        let dir = TempDir::new().unwrap();
        let mirror = dir.path().join("mirror");
        let storage = storage(&dir, false, Some(mirror.clone()));
        let name = SafeName::certificate("web1").unwrap();
        storage.create_certificate_dir(&name).unwrap();
        storage
            .write_file(&storage.paths().cert_file(&name), b"pem", MODE_PUBLIC)
            .unwrap();
        assert_eq!(fs::read(mirror.join("web1/web1.crt")).unwrap(), b"pem");

        storage.delete_certificate(&name).unwrap();
        assert!(!mirror.join("web1").exists());
        assert!(!storage.paths().cert_dir(&name).exists());
    }

    #[test]
    fn test_delete_removes_serial_mappings() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, true, None);
        let name = SafeName::certificate("web1").unwrap();
        let other = SafeName::certificate("web2").unwrap();
        storage.save_serial(&SafeName::serial("01").unwrap(), &name).unwrap();
        storage.save_serial(&SafeName::serial("02").unwrap(), &other).unwrap();
        storage.delete_certificate(&name).unwrap();
        assert_eq!(storage.lookup_serial(&SafeName::serial("01").unwrap()).unwrap(), None);
        assert_eq!(
            storage.lookup_serial(&SafeName::serial("02").unwrap()).unwrap().as_deref(),
            Some("web2")
        );
    }

    #[test]
    fn test_seed_email_settings_only_once() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, false, None);
        let first = EmailSettings {
            smtp_server: "one".into(),
            ..Default::default()
        };
        let second = EmailSettings {
            smtp_server: "two".into(),
            ..Default::default()
        };
        assert!(storage.seed_email_settings(&first).unwrap());
        assert!(!storage.seed_email_settings(&second).unwrap());
        assert_eq!(storage.load_email_settings().unwrap().unwrap().smtp_server, "one");
    }
}
