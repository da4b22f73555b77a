use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::logging::LogFormat;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "PKI_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ca: CaSettings,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub acme: AcmeSettings,
    #[serde(default)]
    pub email: EmailSettings,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub db_enabled: bool,
    /// Defaults to `<path>/pki.sqlite3`
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub object_store_enabled: bool,
    #[serde(default)]
    pub object_store_path: Option<PathBuf>,
    /// Defaults to `<path>/audit.log`
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            db_enabled: false,
            db_path: None,
            object_store_enabled: false,
            object_store_path: None,
            audit_log_path: None,
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/app/certs")
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.path.join("pki.sqlite3"))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log_path
            .clone()
            .unwrap_or_else(|| self.path.join("audit.log"))
    }
}

/// CA identity settings. `name` and one of `key` / `key_file` are required.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CaSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub country: String,
    /// Passphrase protecting `ca/ca.key.enc`
    #[serde(default)]
    pub key: Option<SecretString>,
    /// File whose first line is the passphrase
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl CaSettings {
    /// Resolve the CA key passphrase from `key` or the first line of `key_file`
    pub fn passphrase(&self) -> Result<SecretString, Error> {
        if let Some(key) = &self.key {
            if !key.expose_secret().is_empty() {
                return Ok(key.clone());
            }
        }
        let Some(path) = &self.key_file else {
            return Err(Error::Config("CA_KEY or CA_KEY_FILE must be set".into()));
        };
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read CA key file {}: {e}", path.display()))
        })?;
        let first = contents.lines().next().unwrap_or("").trim().to_string();
        if first.is_empty() {
            return Err(Error::Config(format!(
                "CA key file {} is empty",
                path.display()
            )));
        }
        Ok(SecretString::new(first))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_acme_port")]
    pub acme_port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    /// Seconds in-flight requests get after the shutdown signal
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            acme_port: default_acme_port(),
            tls_enabled: false,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_acme_port() -> u16 {
    8555
}

fn default_shutdown_grace() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeSettings {
    /// Externally visible origin of the ACME listener, without trailing slash
    #[serde(default = "default_acme_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub terms_of_service: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default = "default_order_ttl_hours")]
    pub order_ttl_hours: i64,
    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: i64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Port the HTTP-01 validator connects to
    #[serde(default = "default_http01_port")]
    pub http01_port: u16,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            base_url: default_acme_base_url(),
            terms_of_service: None,
            website: None,
            caa_identities: Vec::new(),
            order_ttl_hours: default_order_ttl_hours(),
            nonce_ttl_secs: default_nonce_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            http01_port: default_http01_port(),
        }
    }
}

fn default_acme_base_url() -> String {
    "http://localhost:8555".to_string()
}

fn default_order_ttl_hours() -> i64 {
    24
}

fn default_nonce_ttl_secs() -> i64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    600
}

fn default_http01_port() -> u16 {
    80
}

/// SMTP notification settings. Persisted under `settings/` so the admin
/// front-end can edit them; the environment only seeds the first start.
#[derive(Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct EmailSettings {
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub smtp_server: String,
    #[serde(default)]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub use_starttls: bool,
    #[serde(default)]
    pub email_from: String,
    #[serde(default)]
    pub email_to: String,
}

impl fmt::Debug for EmailSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailSettings")
            .field("notify", &self.notify)
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_user", &self.smtp_user)
            .field("smtp_password", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .field("use_starttls", &self.use_starttls)
            .field("email_from", &self.email_from)
            .field("email_to", &self.email_to)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_auth_ttl_secs")]
    pub auth_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            auth_ttl_secs: default_auth_ttl_secs(),
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_auth_ttl_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load the optional config file, overlay the process environment and
    /// validate the result.
    ///
    /// `PKI_CONFIG` names the file explicitly and must exist when set;
    /// otherwise `config.toml` is read if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unreadable files, malformed values or
    /// missing required settings.
    pub fn load() -> Result<Self, Error> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))
                .map_err(|e| Error::Config(format!("{e:#}")))?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))
                    .map_err(|e| Error::Config(format!("{e:#}")))?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay settings from an environment lookup function
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STORAGE_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DB_ENABLED") {
            self.storage.db_enabled = parse_bool("DB_ENABLED", &v)?;
        }
        if let Some(v) = lookup("DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("OBJECT_STORE_ENABLED") {
            self.storage.object_store_enabled = parse_bool("OBJECT_STORE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("OBJECT_STORE_PATH") {
            self.storage.object_store_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("AUDIT_LOG_PATH") {
            self.storage.audit_log_path = Some(PathBuf::from(v));
        }

        if let Some(v) = lookup("CA_NAME") {
            self.ca.name = v;
        }
        if let Some(v) = lookup("ORGANIZATION") {
            self.ca.organization = v;
        }
        if let Some(v) = lookup("COUNTRY") {
            self.ca.country = v;
        }
        if let Some(v) = lookup("CA_KEY") {
            self.ca.key = Some(SecretString::new(v));
        }
        if let Some(v) = lookup("CA_KEY_FILE") {
            self.ca.key_file = Some(PathBuf::from(v));
        }

        if let Some(v) = lookup("TLS_ENABLED") {
            self.server.tls_enabled = parse_bool("TLS_ENABLED", &v)?;
        }
        if let Some(v) = lookup("HTTP_PORT") {
            self.server.http_port = parse_port("HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("HTTPS_PORT") {
            self.server.https_port = parse_port("HTTPS_PORT", &v)?;
        }
        if let Some(v) = lookup("ACME_PORT") {
            self.server.acme_port = parse_port("ACME_PORT", &v)?;
        }
        if let Some(v) = lookup("ACME_BASE_URL") {
            self.acme.base_url = v;
        }
        if let Some(v) = lookup("HTTP01_PORT") {
            self.acme.http01_port = parse_port("HTTP01_PORT", &v)?;
        }

        if let Some(v) = lookup("EMAIL_NOTIFY") {
            self.email.notify = parse_bool("EMAIL_NOTIFY", &v)?;
        }
        if let Some(v) = lookup("SMTP_SERVER") {
            self.email.smtp_server = v;
        }
        if let Some(v) = lookup("SMTP_PORT") {
            self.email.smtp_port = parse_port("SMTP_PORT", &v)?;
        }
        if let Some(v) = lookup("SMTP_USER") {
            self.email.smtp_user = v;
        }
        if let Some(v) = lookup("SMTP_PASSWORD") {
            self.email.smtp_password = v;
        }
        if let Some(v) = lookup("SMTP_USE_TLS") {
            self.email.use_tls = parse_bool("SMTP_USE_TLS", &v)?;
        }
        if let Some(v) = lookup("SMTP_USE_STARTTLS") {
            self.email.use_starttls = parse_bool("SMTP_USE_STARTTLS", &v)?;
        }
        if let Some(v) = lookup("EMAIL_FROM") {
            self.email.email_from = v;
        }
        if let Some(v) = lookup("EMAIL_TO") {
            self.email.email_to = v;
        }

        if let Some(v) = lookup("CACHE_ENABLED") {
            self.cache.enabled = parse_bool("CACHE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CACHE_AUTH_TTL_SECS") {
            self.cache.auth_ttl_secs = v
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("CACHE_AUTH_TTL_SECS: invalid value {v:?}")))?;
        }

        if let Some(v) = lookup("LOG_FORMAT") {
            self.logging.format = match v.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "pretty" => LogFormat::Text,
                other => {
                    return Err(Error::Config(format!("LOG_FORMAT: unknown format {other:?}")))
                }
            };
        }
        Ok(())
    }

    /// Check required settings and normalise values
    pub fn validate(&mut self) -> Result<(), Error> {
        self.ca.name = self.ca.name.trim().to_string();
        if self.ca.name.is_empty() {
            return Err(Error::Config("CA_NAME is required".into()));
        }
        self.ca.passphrase()?;

        let country = self.ca.country.trim();
        if !country.is_empty()
            && (country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()))
        {
            return Err(Error::Config(format!(
                "COUNTRY must be a two-letter code, got {country:?}"
            )));
        }
        self.ca.country = country.to_ascii_uppercase();

        let base = self.acme.base_url.trim().trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(Error::Config(format!(
                "ACME_BASE_URL must be an http(s) URL, got {base:?}"
            )));
        }
        self.acme.base_url = base;

        if self.storage.object_store_enabled && self.storage.object_store_path.is_none() {
            return Err(Error::Config(
                "OBJECT_STORE_PATH is required when OBJECT_STORE_ENABLED is set".into(),
            ));
        }
        if self.acme.order_ttl_hours <= 0 || self.acme.nonce_ttl_secs <= 0 {
            return Err(Error::Config("ACME lifetimes must be positive".into()));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got {value:?}"))),
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: invalid port {value:?}")))
}
