//! In-process read cache with per-class TTLs and prefix invalidation

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Cache keys; the rendered form is `<class>:<id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Certificate(String),
    CertificateList,
    CaInfo,
    AuthToken(String),
    Settings(String),
    Serial(String),
}

impl CacheKey {
    pub fn render(&self) -> String {
        match self {
            CacheKey::Certificate(name) => format!("cert:{name}"),
            CacheKey::CertificateList => "cert:list".to_string(),
            CacheKey::CaInfo => "ca:info".to_string(),
            CacheKey::AuthToken(token) => format!("auth:{token}"),
            CacheKey::Settings(topic) => format!("settings:{topic}"),
            CacheKey::Serial(serial) => format!("serial:{serial}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub certificate: Duration,
    pub certificate_list: Duration,
    pub ca_info: Duration,
    pub settings: Duration,
    pub serial: Duration,
    pub auth_token: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            certificate: Duration::from_secs(5 * 60),
            certificate_list: Duration::from_secs(5 * 60),
            ca_info: Duration::from_secs(60 * 60),
            settings: Duration::from_secs(30 * 60),
            serial: Duration::from_secs(2 * 60 * 60),
            auth_token: Duration::from_secs(15 * 60),
        }
    }
}

impl CacheTtls {
    fn ttl(&self, key: &CacheKey) -> Duration {
        match key {
            CacheKey::Certificate(_) => self.certificate,
            CacheKey::CertificateList => self.certificate_list,
            CacheKey::CaInfo => self.ca_info,
            CacheKey::AuthToken(_) => self.auth_token,
            CacheKey::Settings(_) => self.settings,
            CacheKey::Serial(_) => self.serial,
        }
    }
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
    ttls: CacheTtls,
}

impl Cache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttls,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.get_at(key, Instant::now())
    }

    fn get_at<T: DeserializeOwned>(&self, key: &CacheKey, now: Instant) -> Option<T> {
        let value = {
            let entries = self.entries.read();
            let entry = entries.get(&key.render())?;
            if entry.expires_at <= now {
                return None;
            }
            entry.value.clone()
        };
        serde_json::from_value(value).ok()
    }

    pub fn put<T: Serialize>(&self, key: &CacheKey, value: &T) {
        self.put_at(key, value, Instant::now())
    }

    fn put_at<T: Serialize>(&self, key: &CacheKey, value: &T, now: Instant) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                debug!(key = %key.render(), error = %e, "value not cacheable");
                return;
            }
        };
        let expires_at = now + self.ttls.ttl(key);
        self.entries
            .write()
            .insert(key.render(), Entry { value, expires_at });
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.write().remove(&key.render());
    }

    /// Drop every key starting with `prefix` (e.g. `cert:`)
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
