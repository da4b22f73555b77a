//! Canonical on-disk layout and path-segment validation
//!
//! Every path the crate touches is produced here. Names supplied by callers
//! only ever reach the filesystem as a [`SafeName`].

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 100;

/// Top-level directories that certificate names may not shadow
const RESERVED_NAMES: &[&str] = &["ca", "serials", "acme", "settings", "sessions"];

/// A validated path segment matching `[A-Za-z0-9._-]{1,100}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SafeName(String);

impl SafeName {
    /// Reduce `input` to its basename and validate it
    ///
    /// # Errors
    /// [`Error::Validation`] when the basename is empty, longer than 100
    /// characters, is `.`/`..`, contains `..`, or contains a character
    /// outside `[A-Za-z0-9._-]`.
    pub fn parse(input: &str) -> Result<Self> {
        let base = input
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        if base.is_empty() || base.len() > MAX_NAME_LEN {
            return Err(Error::Validation(format!(
                "name must be 1-{MAX_NAME_LEN} characters"
            )));
        }
        if base.contains("..") || base == "." {
            return Err(Error::Validation(format!("invalid name: {base:?}")));
        }
        if !base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::Validation(format!(
                "name {base:?} may only contain letters, digits, '.', '_' and '-'"
            )));
        }
        Ok(SafeName(base.to_string()))
    }

    /// Parse a certificate name; additionally rejects the reserved
    /// top-level directory names and the hidden-file prefix
    pub fn certificate(input: &str) -> Result<Self> {
        let name = Self::parse(input)?;
        if name.0.starts_with('.') || RESERVED_NAMES.contains(&name.0.to_ascii_lowercase().as_str()) {
            return Err(Error::Validation(format!(
                "{:?} cannot be used as a certificate name",
                name.0
            )));
        }
        Ok(name)
    }

    /// Parse an uppercase hex serial
    pub fn serial(input: &str) -> Result<Self> {
        let upper = input.trim().to_ascii_uppercase();
        if upper.is_empty() || !upper.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!("invalid serial: {input:?}")));
        }
        Self::parse(&upper)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SafeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SafeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// ACME record collections under `acme/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeCollection {
    Accounts,
    Orders,
    Authorizations,
    Challenges,
}

impl AcmeCollection {
    pub const ALL: [AcmeCollection; 4] = [
        AcmeCollection::Accounts,
        AcmeCollection::Orders,
        AcmeCollection::Authorizations,
        AcmeCollection::Challenges,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            AcmeCollection::Accounts => "accounts",
            AcmeCollection::Orders => "orders",
            AcmeCollection::Authorizations => "authz",
            AcmeCollection::Challenges => "challenges",
        }
    }
}

/// Paths under the storage base directory
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.base.join("ca")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.ca_dir().join("ca.pem")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.ca_dir().join("ca.key")
    }

    pub fn ca_key_encrypted(&self) -> PathBuf {
        self.ca_dir().join("ca.key.enc")
    }

    pub fn ca_name_file(&self) -> PathBuf {
        self.ca_dir().join("CA_NAME.txt")
    }

    pub fn ca_organization_file(&self) -> PathBuf {
        self.ca_dir().join("O.txt")
    }

    pub fn ca_country_file(&self) -> PathBuf {
        self.ca_dir().join("C.txt")
    }

    pub fn ca_key_ref_file(&self) -> PathBuf {
        self.ca_dir().join("CA_KEY.txt")
    }

    pub fn ca_crl(&self) -> PathBuf {
        self.ca_dir().join("ca.crl")
    }

    pub fn crl_dir(&self) -> PathBuf {
        self.ca_dir().join("crl")
    }

    pub fn crl_index(&self) -> PathBuf {
        self.crl_dir().join("index.txt")
    }

    /// Issued-certificate counter
    pub fn serial_counter(&self) -> PathBuf {
        self.crl_dir().join("serial.txt")
    }

    pub fn crl_number(&self) -> PathBuf {
        self.crl_dir().join("crlnumber")
    }

    pub fn public_ca_cert(&self) -> PathBuf {
        self.base.join("ca.pem")
    }

    pub fn public_crl(&self) -> PathBuf {
        self.base.join("ca.crl")
    }

    pub fn service_cert(&self) -> PathBuf {
        self.base.join("service.crt")
    }

    pub fn service_key(&self) -> PathBuf {
        self.base.join("service.key")
    }

    pub fn cert_dir(&self, name: &SafeName) -> PathBuf {
        self.base.join(name.as_str())
    }

    pub fn cert_file(&self, name: &SafeName) -> PathBuf {
        self.cert_dir(name).join(format!("{name}.crt"))
    }

    pub fn key_file(&self, name: &SafeName) -> PathBuf {
        self.cert_dir(name).join(format!("{name}.key"))
    }

    pub fn p12_file(&self, name: &SafeName) -> PathBuf {
        self.cert_dir(name).join(format!("{name}.p12"))
    }

    pub fn p12_password_file(&self, name: &SafeName) -> PathBuf {
        self.cert_dir(name).join(format!("{name}.pw"))
    }

    pub fn bundle_file(&self, name: &SafeName) -> PathBuf {
        self.cert_dir(name).join(format!("{name}.bundle.crt"))
    }

    /// Copy of the CA certificate kept next to the leaf for chain building
    pub fn chain_ca_file(&self, name: &SafeName) -> PathBuf {
        self.cert_dir(name).join("ca.crt")
    }

    pub fn revoked_marker(&self, name: &SafeName) -> PathBuf {
        self.cert_dir(name).join("revoked")
    }

    pub fn serials_dir(&self) -> PathBuf {
        self.base.join("serials")
    }

    pub fn serial_mapping(&self, serial: &SafeName) -> PathBuf {
        self.serials_dir().join(serial.as_str())
    }

    pub fn acme_dir(&self) -> PathBuf {
        self.base.join("acme")
    }

    pub fn acme_collection(&self, collection: AcmeCollection) -> PathBuf {
        self.acme_dir().join(collection.dir_name())
    }

    pub fn acme_record(&self, collection: AcmeCollection, id: &SafeName) -> PathBuf {
        self.acme_collection(collection).join(format!("{id}.json"))
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.base.join("settings")
    }

    pub fn settings_file(&self, key: &SafeName) -> PathBuf {
        self.settings_dir().join(format!("{key}.txt"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    /// Path relative to the base directory, `/`-separated; used as the
    /// object-store key
    pub fn relative_key(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.base).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Directories created at startup
    pub fn skeleton(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.base.clone(),
            self.ca_dir(),
            self.crl_dir(),
            self.serials_dir(),
            self.acme_dir(),
            self.settings_dir(),
            self.sessions_dir(),
        ];
        dirs.extend(AcmeCollection::ALL.iter().map(|c| self.acme_collection(*c)));
        dirs
    }
}
