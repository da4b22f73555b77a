//! CA lifecycle: bootstrap, renewal, and the service certificate
//!
//! The CA key lives in `ca/ca.key` (0600) with an AES-256 encrypted copy in
//! `ca/ca.key.enc`; both always hold the same key. The certificate is
//! written to `ca/ca.pem` and published as `ca.pem` at the storage root.

use std::sync::Arc;

use chrono::{Duration, Utc};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::audit::AuditEvent;
use crate::configs::CaSettings;
use crate::error::{Error, Result};
use crate::generate_root_ca::{renew_ca_certificate, CaCertificateBuilder, CA_VALIDITY_DAYS};
use crate::generate_service_tls::build_service_certificate;
use crate::keys::{self, KeyAlgorithm};
use crate::revocation;
use crate::storage::{CaInfo, Storage, MODE_PRIVATE, MODE_PUBLIC};

/// Renew the service certificate when it expires within this window
const SERVICE_RENEWAL_WINDOW_DAYS: i64 = 30;

/// Identity and passphrase used to bootstrap the CA
#[derive(Debug, Clone)]
pub struct CaConfig {
    pub name: String,
    pub organization: String,
    pub country: String,
    pub passphrase: SecretString,
}

impl CaConfig {
    pub fn from_settings(settings: &CaSettings) -> Result<Self> {
        Ok(Self {
            name: settings.name.clone(),
            organization: settings.organization.clone(),
            country: settings.country.clone(),
            passphrase: settings.passphrase()?,
        })
    }
}

/// CA key and certificate loaded for signing
pub struct CaSigner {
    pub key: PKey<Private>,
    pub cert: X509,
}

pub struct CaManager {
    storage: Arc<Storage>,
}

impl CaManager {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Both the CA certificate and private key are present
    pub fn exists(&self) -> bool {
        let paths = self.storage.paths();
        paths.ca_cert().is_file() && paths.ca_key().is_file()
    }

    /// Create the CA key, self-signed certificate and identity files
    ///
    /// # Errors
    /// [`Error::AlreadyInitialized`] when [`CaManager::exists`] holds.
    pub fn bootstrap(&self, config: &CaConfig) -> Result<CaInfo> {
        if self.exists() {
            return Err(Error::AlreadyInitialized);
        }
        let (key, cert) = CaCertificateBuilder::new()
            .subject_common_name(config.name.clone())
            .organization(config.organization.clone())
            .country(config.country.clone())
            .validity_days(CA_VALIDITY_DAYS)
            .build()
            .map_err(|e| Error::Validation(format!("{e:#}")))?;

        let paths = self.storage.paths();
        let key_pem = key.private_key_to_pem_pkcs8()?;
        let encrypted = keys::encrypt_private_key(&key, &config.passphrase)?;
        let cert_pem = cert.to_pem()?;

        self.storage.write_file(&paths.ca_key(), &key_pem, MODE_PRIVATE)?;
        self.storage
            .write_file(&paths.ca_key_encrypted(), &encrypted, MODE_PRIVATE)?;
        self.storage.write_file(&paths.ca_cert(), &cert_pem, MODE_PUBLIC)?;
        self.storage
            .write_file(&paths.public_ca_cert(), &cert_pem, MODE_PUBLIC)?;

        let key_hash = keys::key_hash(&key)?;
        let key_ref = format!(
            "algorithm={}\nkey=ca/ca.key\nencrypted=ca/ca.key.enc\nsha256={}\n",
            KeyAlgorithm::Rsa4096,
            key_hash
        );
        self.storage
            .write_file(&paths.ca_key_ref_file(), key_ref.as_bytes(), MODE_PUBLIC)?;
        if !paths.crl_index().exists() {
            self.storage.write_file(&paths.crl_index(), b"", MODE_PUBLIC)?;
        }

        let info = CaInfo {
            name: config.name.clone(),
            organization: config.organization.clone(),
            country: config.country.clone(),
            serial_counter: 0,
            created_at: keys::asn1_to_utc(cert.not_before())?,
            expires_at: keys::asn1_to_utc(cert.not_after())?,
            key_hash,
        };
        self.storage.save_ca_info(&info)?;

        let signer = CaSigner { key, cert };
        revocation::publish_crl(&self.storage, &signer)?;

        info!(name = %info.name, expires = %info.expires_at, "certificate authority bootstrapped");
        self.storage.audit().record(
            AuditEvent::new("bootstrap", "ca", info.name.clone())
                .field("key_hash", info.key_hash.clone()),
        );
        Ok(info)
    }

    /// Check that the encrypted key copy matches `ca/ca.key` under the
    /// configured passphrase, writing the copy when it is missing
    pub fn verify_key_copy(&self, passphrase: &SecretString) -> Result<()> {
        let signer = self.signer()?;
        let paths = self.storage.paths();
        match self.storage.read_file(&paths.ca_key_encrypted())? {
            Some(pem) => {
                let decrypted = keys::decrypt_private_key(&pem, passphrase).map_err(|_| {
                    Error::Config("CA key passphrase does not decrypt ca/ca.key.enc".into())
                })?;
                if keys::key_hash(&decrypted)? != keys::key_hash(&signer.key)? {
                    return Err(Error::Config(
                        "ca/ca.key.enc does not hold the same key as ca/ca.key".into(),
                    ));
                }
            }
            None => {
                warn!("encrypted CA key copy missing; writing a new one");
                let encrypted = keys::encrypt_private_key(&signer.key, passphrase)?;
                self.storage
                    .write_file(&paths.ca_key_encrypted(), &encrypted, MODE_PRIVATE)?;
            }
        }
        Ok(())
    }

    /// Load the CA key and certificate
    pub fn signer(&self) -> Result<CaSigner> {
        if !self.exists() {
            return Err(Error::NotInitialized);
        }
        let paths = self.storage.paths();
        let key_pem = self
            .storage
            .read_file(&paths.ca_key())?
            .ok_or(Error::NotInitialized)?;
        let cert_pem = self
            .storage
            .read_file(&paths.ca_cert())?
            .ok_or(Error::NotInitialized)?;
        Ok(CaSigner {
            key: keys::load_private_key(&key_pem)?,
            cert: keys::load_certificate(&cert_pem)?,
        })
    }

    pub fn certificate(&self) -> Result<X509> {
        let pem = self
            .storage
            .read_file(&self.storage.paths().ca_cert())?
            .ok_or(Error::NotInitialized)?;
        Ok(keys::load_certificate(&pem)?)
    }

    pub fn info(&self) -> Result<CaInfo> {
        self.storage.load_ca_info()?.ok_or(Error::NotInitialized)
    }

    /// Re-sign the CA certificate with the existing key for another ten years
    pub fn renew(&self) -> Result<CaInfo> {
        let signer = self.signer()?;
        let renewed = renew_ca_certificate(signer.key.clone(), &signer.cert, CA_VALIDITY_DAYS)?;
        let pem = renewed.to_pem()?;
        let paths = self.storage.paths();
        self.storage.write_file(&paths.ca_cert(), &pem, MODE_PUBLIC)?;
        self.storage
            .write_file(&paths.public_ca_cert(), &pem, MODE_PUBLIC)?;

        let mut info = self.info()?;
        info.created_at = keys::asn1_to_utc(renewed.not_before())?;
        info.expires_at = keys::asn1_to_utc(renewed.not_after())?;
        info.key_hash = keys::key_hash(&signer.key)?;
        self.storage.save_ca_info(&info)?;

        info!(name = %info.name, expires = %info.expires_at, "CA certificate renewed");
        self.storage.audit().record(
            AuditEvent::new("renew", "ca", info.name.clone())
                .field("serial", keys::serial_hex(&renewed)?),
        );
        Ok(info)
    }

    /// Issue `service.crt` / `service.key` for the HTTPS listener
    ///
    /// `service.crt` holds the leaf followed by the CA certificate.
    pub fn create_service_cert(&self) -> Result<X509> {
        let signer = self.signer()?;
        let info = self.info()?;
        let issued = build_service_certificate(&signer.key, &signer.cert, &info.name)?;
        let key = issued
            .private_key
            .ok_or_else(|| Error::Fatal(anyhow::anyhow!("service key was not generated")))?;
        let chain = keys::pem_chain(&[&issued.certificate, &signer.cert])?;
        let paths = self.storage.paths();
        self.storage
            .write_file(&paths.service_key(), &key.private_key_to_pem_pkcs8()?, MODE_PRIVATE)?;
        self.storage.write_file(&paths.service_cert(), &chain, MODE_PUBLIC)?;

        let serial = keys::serial_hex(&issued.certificate)?;
        info!(serial = %serial, "service certificate issued");
        self.storage.audit().record(
            AuditEvent::new("issue", "service_certificate", "service").field("serial", serial),
        );
        Ok(issued.certificate)
    }

    /// Regenerate the service certificate when missing or expiring soon
    pub fn ensure_service_cert(&self) -> Result<bool> {
        let paths = self.storage.paths();
        let current = match (
            self.storage.read_file(&paths.service_cert())?,
            paths.service_key().is_file(),
        ) {
            (Some(pem), true) => keys::load_certificate(&pem).ok(),
            _ => None,
        };
        let needs_renewal = match current {
            Some(cert) => {
                let not_after = keys::asn1_to_utc(cert.not_after())?;
                not_after - Utc::now() < Duration::days(SERVICE_RENEWAL_WINDOW_DAYS)
            }
            None => true,
        };
        if needs_renewal {
            self.create_service_cert()?;
        }
        Ok(needs_renewal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> CaManager {
        let storage =
            Storage::files_only(dir.path(), Arc::new(AuditLog::tracing_only())).unwrap();
        CaManager::new(Arc::new(storage))
    }

    fn config() -> CaConfig {
        CaConfig {
            name: "Test CA".into(),
            organization: "Acme".into(),
            country: "US".into(),
            passphrase: SecretString::new("pw".into()),
        }
    }

    #[test]
    fn test_bootstrap_then_renew() {
        let dir = TempDir::new().unwrap();
        let ca = manager(&dir);
        assert!(!ca.exists());
        assert!(matches!(ca.signer(), Err(Error::NotInitialized)));

        let info = ca.bootstrap(&config()).unwrap();
        assert!(ca.exists());
        assert_eq!(info.name, "Test CA");
        assert!(matches!(ca.bootstrap(&config()), Err(Error::AlreadyInitialized)));

        let cert = ca.certificate().unwrap();
        assert_eq!(keys::name_to_string(cert.subject_name()), "CN=Test CA, O=Acme, C=US");
        assert_eq!(
            std::fs::read(dir.path().join("ca.pem")).unwrap(),
            std::fs::read(dir.path().join("ca/ca.pem")).unwrap()
        );
        assert!(dir.path().join("ca.crl").exists());
        ca.verify_key_copy(&SecretString::new("pw".into())).unwrap();
        assert!(matches!(
            ca.verify_key_copy(&SecretString::new("nope".into())),
            Err(Error::Config(_))
        ));

        let renewed = ca.renew().unwrap();
        assert_eq!(renewed.key_hash, info.key_hash);
        let new_cert = ca.certificate().unwrap();
        assert_ne!(
            keys::serial_hex(&new_cert).unwrap(),
            keys::serial_hex(&cert).unwrap()
        );

        assert!(ca.ensure_service_cert().unwrap());
        assert!(!ca.ensure_service_cert().unwrap());
        let service = std::fs::read_to_string(dir.path().join("service.crt")).unwrap();
        assert_eq!(service.matches("BEGIN CERTIFICATE").count(), 2);
    }
}
