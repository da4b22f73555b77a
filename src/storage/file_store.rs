//! Authoritative file-tree backend
//!
//! All writes go to a temporary file in the target directory which is then
//! renamed over the destination, so readers see either the old or the new
//! contents. Permissions are applied before the rename.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use super::paths::{Paths, SafeName};
use super::{CaInfo, CertificateRecord, MetadataBackend};
use crate::configs::EmailSettings;
use crate::error::Result;
use crate::keys;

/// Mode for private material
pub const MODE_PRIVATE: u32 = 0o600;
/// Mode for public material
pub const MODE_PUBLIC: u32 = 0o644;

/// Write `bytes` to `path` atomically with the given mode
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir).context(format!("Failed to create {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .context(format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .context(format!("Failed to write {}", path.display()))?;
    tmp.as_file().sync_all()?;
    set_mode(tmp.path(), mode)?;
    tmp.persist(path)
        .map_err(|e| anyhow!("Failed to persist {}: {}", path.display(), e.error))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .context(format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

/// Read a file, mapping "not found" to `None`
pub fn read_optional(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow!("Failed to read {}: {}", path.display(), e)),
    }
}

fn read_text(path: &Path) -> anyhow::Result<Option<String>> {
    Ok(read_optional(path)?.map(|b| String::from_utf8_lossy(&b).trim().to_string()))
}

/// Remove a file; a missing file is not an error
pub fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!("Failed to remove {}: {}", path.display(), e)),
    }
}

const EMAIL_KEYS: &[&str] = &[
    "email_notify",
    "smtp_server",
    "smtp_port",
    "smtp_user",
    "smtp_password",
    "use_tls",
    "use_starttls",
    "email_from",
    "email_to",
];

/// The file tree under the storage base directory
#[derive(Debug, Clone)]
pub struct FileStore {
    paths: Paths,
}

impl FileStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Create the directory skeleton
    pub fn init(&self) -> Result<()> {
        for dir in self.paths.skeleton() {
            fs::create_dir_all(&dir).context(format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    fn setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = SafeName::parse(key).map_err(|e| anyhow!("{}", e))?;
        read_text(&self.paths.settings_file(&key))
    }

    fn put_setting(&self, key: &str, value: &str, mode: u32) -> anyhow::Result<()> {
        let key = SafeName::parse(key).map_err(|e| anyhow!("{}", e))?;
        write_atomic(&self.paths.settings_file(&key), value.as_bytes(), mode)
    }

    /// Read certificate metadata from the per-certificate directory
    pub fn read_certificate(&self, name: &SafeName) -> Result<Option<CertificateRecord>> {
        let Some(pem) = read_optional(&self.paths.cert_file(name))? else {
            return Ok(None);
        };
        let cert = keys::load_certificate(&pem)?;
        let revoked_at = read_text(&self.paths.revoked_marker(name))?.map(|ts| {
            DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        });
        let kind = if self.paths.p12_file(name).exists() {
            crate::generate_leaf_cert::CertificateKind::Client
        } else if self.paths.key_file(name).exists() {
            crate::generate_leaf_cert::CertificateKind::Server
        } else {
            crate::generate_leaf_cert::CertificateKind::AcmeIssued
        };
        Ok(Some(CertificateRecord {
            name: name.to_string(),
            serial: keys::serial_hex(&cert)?,
            kind,
            subject: keys::name_to_string(cert.subject_name()),
            issuer: keys::name_to_string(cert.issuer_name()),
            not_before: keys::asn1_to_utc(cert.not_before())?,
            not_after: keys::asn1_to_utc(cert.not_after())?,
            sans: keys::certificate_sans(&cert),
            revoked: revoked_at.is_some(),
            revoked_at,
        }))
    }
}

impl MetadataBackend for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn save_ca_info(&self, info: &CaInfo) -> Result<()> {
        write_atomic(&self.paths.ca_name_file(), info.name.as_bytes(), MODE_PUBLIC)?;
        write_atomic(
            &self.paths.ca_organization_file(),
            info.organization.as_bytes(),
            MODE_PUBLIC,
        )?;
        write_atomic(&self.paths.ca_country_file(), info.country.as_bytes(), MODE_PUBLIC)?;
        write_atomic(
            &self.paths.serial_counter(),
            info.serial_counter.to_string().as_bytes(),
            MODE_PUBLIC,
        )?;
        Ok(())
    }

    /// Identity text files plus validity and key hash from `ca/ca.pem`
    fn load_ca_info(&self) -> Result<Option<CaInfo>> {
        let Some(name) = read_text(&self.paths.ca_name_file())? else {
            return Ok(None);
        };
        let Some(pem) = read_optional(&self.paths.ca_cert())? else {
            return Ok(None);
        };
        let cert = keys::load_certificate(&pem)?;
        let serial_counter = read_text(&self.paths.serial_counter())?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let ca_key = cert.public_key()?;
        Ok(Some(CaInfo {
            name,
            organization: read_text(&self.paths.ca_organization_file())?.unwrap_or_default(),
            country: read_text(&self.paths.ca_country_file())?.unwrap_or_default(),
            serial_counter,
            created_at: keys::asn1_to_utc(cert.not_before())?,
            expires_at: keys::asn1_to_utc(cert.not_after())?,
            key_hash: keys::key_hash(&*ca_key)?,
        }))
    }

    /// The certificate files are the record; nothing extra to write
    fn record_certificate(&self, _record: &CertificateRecord) -> Result<()> {
        Ok(())
    }

    fn delete_certificate(&self, name: &SafeName) -> Result<()> {
        let dir = self.paths.cert_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("Failed to remove {}: {}", dir.display(), e).into()),
        }
    }

    /// Directories under the base that hold a `<name>.crt`
    fn list_certificates(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(self.paths.base()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let Ok(name) = SafeName::certificate(&dir_name) else {
                continue;
            };
            if self.paths.cert_file(&name).exists() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn save_serial(&self, serial: &SafeName, name: &SafeName) -> Result<()> {
        write_atomic(
            &self.paths.serial_mapping(serial),
            name.as_str().as_bytes(),
            MODE_PUBLIC,
        )?;
        Ok(())
    }

    fn lookup_serial(&self, serial: &SafeName) -> Result<Option<String>> {
        Ok(read_text(&self.paths.serial_mapping(serial))?)
    }

    fn delete_serial(&self, serial: &SafeName) -> Result<()> {
        remove_if_exists(&self.paths.serial_mapping(serial))?;
        Ok(())
    }

    fn save_email_settings(&self, settings: &EmailSettings) -> Result<()> {
        let bool_str = |b: bool| if b { "true" } else { "false" };
        self.put_setting("email_notify", bool_str(settings.notify), MODE_PUBLIC)?;
        self.put_setting("smtp_server", &settings.smtp_server, MODE_PUBLIC)?;
        self.put_setting("smtp_port", &settings.smtp_port.to_string(), MODE_PUBLIC)?;
        self.put_setting("smtp_user", &settings.smtp_user, MODE_PUBLIC)?;
        self.put_setting("smtp_password", &settings.smtp_password, MODE_PRIVATE)?;
        self.put_setting("use_tls", bool_str(settings.use_tls), MODE_PUBLIC)?;
        self.put_setting("use_starttls", bool_str(settings.use_starttls), MODE_PUBLIC)?;
        self.put_setting("email_from", &settings.email_from, MODE_PUBLIC)?;
        self.put_setting("email_to", &settings.email_to, MODE_PUBLIC)?;
        Ok(())
    }

    fn load_email_settings(&self) -> Result<Option<EmailSettings>> {
        let mut found = false;
        let mut values = std::collections::HashMap::new();
        for key in EMAIL_KEYS {
            if let Some(v) = self.setting(key)? {
                found = true;
                values.insert(*key, v);
            }
        }
        if !found {
            return Ok(None);
        }
        let text = |k: &str| values.get(k).cloned().unwrap_or_default();
        let flag = |k: &str| values.get(k).map(|v| v == "true").unwrap_or(false);
        Ok(Some(EmailSettings {
            notify: flag("email_notify"),
            smtp_server: text("smtp_server"),
            smtp_port: text("smtp_port").parse().unwrap_or(0),
            smtp_user: text("smtp_user"),
            smtp_password: text("smtp_password"),
            use_tls: flag("use_tls"),
            use_starttls: flag("use_starttls"),
            email_from: text("email_from"),
            email_to: text("email_to"),
        }))
    }
}
