//! Leaf certificate issuance
//!
//! [`CertificateService`] is the capability set shared by the ACME server
//! and any admin front-end. [`PkiEngine`] implements it on top of the CA
//! manager, the storage facade and the revocation log.
//!
//! Every certificate lives in its own directory:
//!
//! ```text
//! <name>/<name>.crt         leaf (0644)
//! <name>/<name>.key         private key, when the CA generated it (0600)
//! <name>/ca.crt             issuing CA
//! <name>/<name>.bundle.crt  leaf followed by the CA
//! <name>/<name>.p12 / .pw   client certificates only (0600)
//! <name>/revoked            present once revoked
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Ref, X509};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::audit::{Actor, AuditEvent};
use crate::ca_manager::{CaManager, CaSigner};
use crate::error::{Error, Result};
use crate::generate_leaf_cert::{CertificateKind, IssuedLeaf, LeafCertBuilder, LEAF_VALIDITY_DAYS};
use crate::keys::{self, ParsedCsr};
use crate::revocation::{RevocationReason, Revocations};
use crate::storage::{CertificateRecord, SafeName, Storage, MODE_PRIVATE, MODE_PUBLIC};

/// Metadata returned by info and listing calls
pub type CertificateInfo = CertificateRecord;

const SERIAL_ATTEMPTS: usize = 8;

/// Operations on leaf certificates
pub trait CertificateService: Send + Sync {
    /// Issue a server certificate with a freshly generated RSA-2048 key
    fn issue_server(&self, name: &str, extra_sans: &[String], actor: &Actor) -> Result<CertificateInfo>;

    /// Issue a client certificate and a PKCS#12 archive under `p12_password`
    fn issue_client(&self, name: &str, p12_password: &SecretString, actor: &Actor) -> Result<CertificateInfo>;

    /// Issue a server certificate for the public key of a verified CSR
    fn sign_csr(&self, name: &str, csr: &ParsedCsr, actor: &Actor) -> Result<CertificateInfo>;

    /// Re-issue with a new serial and validity, keeping key and SANs
    fn renew(&self, name: &str, actor: &Actor) -> Result<CertificateInfo>;

    fn revoke(&self, name: &str, actor: &Actor) -> Result<CertificateInfo>;

    fn list(&self) -> Result<Vec<CertificateInfo>>;

    fn get_info(&self, name: &str) -> Result<CertificateInfo>;

    /// Remove the certificate and every mirrored copy
    fn delete(&self, name: &str, actor: &Actor) -> Result<()>;

    /// PEM chain: leaf then CA
    fn certificate_chain_pem(&self, name: &str) -> Result<Vec<u8>>;

    fn find_by_serial(&self, serial: &str) -> Result<Option<CertificateInfo>>;

    /// Whether `serial` is on the CRL, current certificate or not
    fn is_serial_revoked(&self, serial: &str) -> Result<bool>;

    /// Revoke an earlier certificate issued under `name` that has since been
    /// replaced
    fn revoke_retired(&self, name: &str, cert: &X509Ref, actor: &Actor) -> Result<()>;
}

pub struct PkiEngine {
    storage: Arc<Storage>,
    ca: CaManager,
    revocations: Revocations,
    in_flight: Mutex<HashSet<SafeName>>,
}

/// Marks a name as being written; released on drop
struct NameClaim<'a> {
    names: &'a Mutex<HashSet<SafeName>>,
    name: SafeName,
}

impl Drop for NameClaim<'_> {
    fn drop(&mut self) {
        self.names.lock().remove(&self.name);
    }
}

impl PkiEngine {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            ca: CaManager::new(storage.clone()),
            revocations: Revocations::new(storage.clone()),
            storage,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn ca(&self) -> &CaManager {
        &self.ca
    }

    pub fn revocations(&self) -> &Revocations {
        &self.revocations
    }

    fn claim(&self, name: &SafeName) -> Result<NameClaim<'_>> {
        if !self.in_flight.lock().insert(name.clone()) {
            return Err(Error::ConflictingState(format!(
                "certificate {name} is being written by another request"
            )));
        }
        Ok(NameClaim {
            names: &self.in_flight,
            name: name.clone(),
        })
    }

    /// A random serial that is not yet mapped to any certificate
    fn unique_serial(&self) -> Result<openssl::bn::BigNum> {
        for _ in 0..SERIAL_ATTEMPTS {
            let serial = keys::random_serial()?;
            let hex = SafeName::serial(&serial.to_hex_str()?)?;
            if self.storage.lookup_serial(&hex)?.is_none() {
                return Ok(serial);
            }
            debug!(serial = %hex, "serial collision; drawing again");
        }
        Err(Error::Fatal(anyhow::anyhow!(
            "could not draw an unused serial after {SERIAL_ATTEMPTS} attempts"
        )))
    }

    fn require_record(&self, name: &SafeName) -> Result<CertificateRecord> {
        self.storage
            .certificate(name)?
            .ok_or_else(|| Error::NotFound(format!("certificate {name}")))
    }

    fn read_key(&self, name: &SafeName) -> Result<PKey<Private>> {
        let pem = self
            .storage
            .read_file(&self.storage.paths().key_file(name))?
            .ok_or_else(|| Error::NotFound(format!("private key of {name}")))?;
        Ok(keys::load_private_key(&pem)?)
    }

    fn read_p12_password(&self, name: &SafeName) -> Result<SecretString> {
        let bytes = self
            .storage
            .read_file(&self.storage.paths().p12_password_file(name))?
            .ok_or_else(|| Error::NotFound(format!("PKCS#12 password of {name}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::Validation(format!("PKCS#12 password of {name} is not UTF-8")))?;
        Ok(SecretString::new(text.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Write every file of a freshly signed leaf, then register its serial
    fn store_leaf(
        &self,
        name: &SafeName,
        issued: &IssuedLeaf,
        signer: &CaSigner,
        p12_password: Option<&SecretString>,
    ) -> Result<CertificateInfo> {
        let paths = self.storage.paths();
        self.storage.create_certificate_dir(name)?;
        let cert = &issued.certificate;

        self.storage
            .write_file(&paths.cert_file(name), &cert.to_pem()?, MODE_PUBLIC)?;
        if let Some(key) = &issued.private_key {
            self.storage.write_file(
                &paths.key_file(name),
                &key.private_key_to_pem_pkcs8()?,
                MODE_PRIVATE,
            )?;
        }
        self.storage
            .write_file(&paths.chain_ca_file(name), &signer.cert.to_pem()?, MODE_PUBLIC)?;
        self.storage.write_file(
            &paths.bundle_file(name),
            &keys::pem_chain(&[cert, &signer.cert])?,
            MODE_PUBLIC,
        )?;

        if let Some(password) = p12_password {
            let key = issued.private_key.as_ref().ok_or_else(|| {
                Error::Fatal(anyhow::anyhow!("client certificate {name} has no private key"))
            })?;
            let p12 = keys::build_pkcs12(name.as_str(), key, cert, &signer.cert, password)?;
            self.storage
                .write_file(&paths.p12_file(name), &p12, MODE_PRIVATE)?;
            self.storage.write_file(
                &paths.p12_password_file(name),
                password.expose_secret().as_bytes(),
                MODE_PRIVATE,
            )?;
        }

        let serial = SafeName::serial(&keys::serial_hex(cert)?)?;
        self.storage.save_serial(&serial, name)?;
        let record = self
            .storage
            .refresh_certificate(name)?
            .ok_or_else(|| Error::Fatal(anyhow::anyhow!("certificate {name} vanished after write")))?;
        self.storage.bump_serial_counter()?;
        Ok(record)
    }

    fn issue_new(
        &self,
        name: &str,
        kind: CertificateKind,
        extra_sans: &[String],
        p12_password: Option<&SecretString>,
        actor: &Actor,
    ) -> Result<CertificateInfo> {
        let name = SafeName::certificate(name)?;
        let _claim = self.claim(&name)?;
        if self.storage.paths().cert_file(&name).exists() {
            return Err(Error::ConflictingState(format!(
                "certificate {name} already exists"
            )));
        }
        let signer = self.ca.signer()?;
        let issued = LeafCertBuilder::new(&signer.key, &signer.cert, kind)
            .subject_common_name(name.to_string())
            .subject_alt_names(extra_sans.to_vec())
            .validity_days(LEAF_VALIDITY_DAYS)
            .serial(self.unique_serial()?)
            .build()
            .map_err(|e| Error::Validation(format!("{e:#}")))?;

        let record = self.store_leaf(&name, &issued, &signer, p12_password)?;
        info!(name = %name, serial = %record.serial, kind = %kind, "certificate issued");
        self.storage.audit().record(
            AuditEvent::new("issue", "certificate", name.to_string())
                .actor(actor.clone())
                .field("serial", record.serial.clone())
                .field("kind", kind.as_str()),
        );
        Ok(record)
    }
}

impl CertificateService for PkiEngine {
    fn issue_server(&self, name: &str, extra_sans: &[String], actor: &Actor) -> Result<CertificateInfo> {
        self.issue_new(name, CertificateKind::Server, extra_sans, None, actor)
    }

    fn issue_client(&self, name: &str, p12_password: &SecretString, actor: &Actor) -> Result<CertificateInfo> {
        if p12_password.expose_secret().is_empty() {
            return Err(Error::Validation("PKCS#12 password must not be empty".into()));
        }
        self.issue_new(name, CertificateKind::Client, &[], Some(p12_password), actor)
    }

    fn sign_csr(&self, name: &str, csr: &ParsedCsr, actor: &Actor) -> Result<CertificateInfo> {
        let name = SafeName::certificate(name)?;
        let _claim = self.claim(&name)?;
        let paths = self.storage.paths();
        let existing = self.storage.certificate(&name)?;
        if let Some(existing) = &existing {
            if existing.kind != CertificateKind::AcmeIssued {
                return Err(Error::ConflictingState(format!(
                    "certificate {name} exists and was not issued through ACME"
                )));
            }
            debug!(name = %name, old_serial = %existing.serial, "replacing ACME certificate");
        }

        let signer = self.ca.signer()?;
        let sans: Vec<String> = csr
            .dns_names
            .iter()
            .cloned()
            .chain(csr.ip_addresses.iter().map(|ip| ip.to_string()))
            .collect();
        let issued = LeafCertBuilder::new(&signer.key, &signer.cert, CertificateKind::AcmeIssued)
            .subject_common_name(name.to_string())
            .subject_alt_names(sans)
            .public_key(csr.public_key.clone())
            .serial(self.unique_serial()?)
            .build()
            .map_err(|e| Error::Validation(format!("{e:#}")))?;

        // a replaced certificate is listed as superseded
        if let Some(existing) = existing.filter(|e| !e.revoked) {
            let pem = self
                .storage
                .read_file(&paths.cert_file(&name))?
                .ok_or_else(|| Error::NotFound(format!("certificate {name}")))?;
            let old = keys::load_certificate(&pem)?;
            self.revocations.revoke_retired(
                &name,
                &old,
                Some(RevocationReason::Superseded),
                &signer,
                actor,
            )?;
            info!(name = %name, serial = %existing.serial, "superseded certificate revoked");
        }
        self.storage.remove_file(&paths.revoked_marker(&name))?;
        let record = self.store_leaf(&name, &issued, &signer, None)?;
        info!(name = %name, serial = %record.serial, "certificate issued from CSR");
        self.storage.audit().record(
            AuditEvent::new("issue", "certificate", name.to_string())
                .actor(actor.clone())
                .field("serial", record.serial.clone())
                .field("kind", CertificateKind::AcmeIssued.as_str()),
        );
        Ok(record)
    }

    fn renew(&self, name: &str, actor: &Actor) -> Result<CertificateInfo> {
        let name = SafeName::certificate(name)?;
        let _claim = self.claim(&name)?;
        let current = self.require_record(&name)?;
        if current.revoked {
            return Err(Error::ConflictingState(format!(
                "certificate {name} is revoked and cannot be renewed"
            )));
        }
        let signer = self.ca.signer()?;
        let builder = LeafCertBuilder::new(&signer.key, &signer.cert, current.kind)
            .subject_common_name(name.to_string())
            .subject_alt_names(current.sans.clone())
            .serial(self.unique_serial()?);

        let mut p12_password = None;
        let builder = match current.kind {
            CertificateKind::AcmeIssued => {
                let pem = self
                    .storage
                    .read_file(&self.storage.paths().cert_file(&name))?
                    .ok_or_else(|| Error::NotFound(format!("certificate {name}")))?;
                let cert: X509 = keys::load_certificate(&pem)?;
                builder.public_key(cert.public_key()?)
            }
            CertificateKind::Client => {
                p12_password = Some(self.read_p12_password(&name)?);
                builder.existing_key(self.read_key(&name)?)
            }
            CertificateKind::Server | CertificateKind::Service => {
                builder.existing_key(self.read_key(&name)?)
            }
        };
        let issued = builder
            .build()
            .map_err(|e| Error::Validation(format!("{e:#}")))?;

        let record = self.store_leaf(&name, &issued, &signer, p12_password.as_ref())?;
        info!(name = %name, old_serial = %current.serial, serial = %record.serial, "certificate renewed");
        self.storage.audit().record(
            AuditEvent::new("renew", "certificate", name.to_string())
                .actor(actor.clone())
                .field("old_serial", current.serial)
                .field("serial", record.serial.clone()),
        );
        Ok(record)
    }

    fn revoke(&self, name: &str, actor: &Actor) -> Result<CertificateInfo> {
        let name = SafeName::certificate(name)?;
        let _claim = self.claim(&name)?;
        let signer = self.ca.signer()?;
        if let Err(e) = self.revocations.revoke(&name, &signer, actor) {
            self.storage.audit().record(
                AuditEvent::new("revoke", "certificate", name.to_string())
                    .actor(actor.clone())
                    .failed(&e),
            );
            return Err(e);
        }
        self.require_record(&name)
    }

    fn list(&self) -> Result<Vec<CertificateInfo>> {
        let mut out = Vec::new();
        for name in self.storage.list_certificates()? {
            let Ok(name) = SafeName::certificate(&name) else {
                continue;
            };
            if let Some(record) = self.storage.certificate(&name)? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn get_info(&self, name: &str) -> Result<CertificateInfo> {
        self.require_record(&SafeName::certificate(name)?)
    }

    fn delete(&self, name: &str, actor: &Actor) -> Result<()> {
        let name = SafeName::certificate(name)?;
        let _claim = self.claim(&name)?;
        let record = self.require_record(&name)?;
        self.storage.delete_certificate(&name)?;
        info!(name = %name, serial = %record.serial, "certificate deleted");
        self.storage.audit().record(
            AuditEvent::new("delete", "certificate", name.to_string())
                .actor(actor.clone())
                .field("serial", record.serial),
        );
        Ok(())
    }

    fn certificate_chain_pem(&self, name: &str) -> Result<Vec<u8>> {
        let name = SafeName::certificate(name)?;
        let paths = self.storage.paths();
        if let Some(bundle) = self.storage.read_file(&paths.bundle_file(&name))? {
            return Ok(bundle);
        }
        let leaf = self
            .storage
            .read_file(&paths.cert_file(&name))?
            .ok_or_else(|| Error::NotFound(format!("certificate {name}")))?;
        let leaf = keys::load_certificate(&leaf)?;
        let ca = self.ca.certificate()?;
        Ok(keys::pem_chain(&[&leaf, &ca])?)
    }

    fn find_by_serial(&self, serial: &str) -> Result<Option<CertificateInfo>> {
        let serial = SafeName::serial(serial)?;
        let Some(name) = self.storage.lookup_serial(&serial)? else {
            return Ok(None);
        };
        let name = SafeName::certificate(&name)?;
        self.storage.certificate(&name)
    }

    fn is_serial_revoked(&self, serial: &str) -> Result<bool> {
        let serial = SafeName::serial(serial)?;
        self.revocations.is_listed(serial.as_str())
    }

    fn revoke_retired(&self, name: &str, cert: &X509Ref, actor: &Actor) -> Result<()> {
        let name = SafeName::certificate(name)?;
        let _claim = self.claim(&name)?;
        let serial = keys::serial_hex(cert)?;
        let current = self.require_record(&name)?;
        if current.serial == serial {
            return Err(Error::ConflictingState(format!(
                "serial {serial} is the current certificate of {name}"
            )));
        }
        let mapped = self.storage.lookup_serial(&SafeName::serial(&serial)?)?;
        if mapped.as_deref() != Some(name.as_str()) {
            return Err(Error::NotFound(format!("serial {serial} of {name}")));
        }
        let signer = self.ca.signer()?;
        self.revocations
            .revoke_retired(&name, cert, None, &signer, actor)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::ca_manager::CaConfig;
    use crate::keys::test_support::csr_der;
    use crate::keys::KeyAlgorithm;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> PkiEngine {
        let storage =
            Arc::new(Storage::files_only(dir.path(), Arc::new(AuditLog::tracing_only())).unwrap());
        let engine = PkiEngine::new(storage);
        engine
            .ca()
            .bootstrap(&CaConfig {
                name: "Unit CA".into(),
                organization: "Acme".into(),
                country: "US".into(),
                passphrase: SecretString::new("pw".into()),
            })
            .unwrap();
        engine
    }

    #[test]
    fn test_issue_twice_conflicts() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.issue_server("api", &[], &Actor::system()).unwrap();
        assert!(matches!(
            engine.issue_server("api", &[], &Actor::system()),
            Err(Error::ConflictingState(_))
        ));
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        for bad in ["..", "a b", "ca", "web$1", ""] {
            assert!(
                matches!(engine.issue_server(bad, &[], &Actor::system()), Err(Error::Validation(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_in_flight_claim_blocks_same_name() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let name = SafeName::certificate("busy").unwrap();
        let claim = engine.claim(&name).unwrap();
        assert!(matches!(
            engine.issue_server("busy", &[], &Actor::system()),
            Err(Error::ConflictingState(_))
        ));
        drop(claim);
        engine.issue_server("busy", &[], &Actor::system()).unwrap();
    }

    #[test]
    fn test_sign_csr_replaces_only_acme_certificates() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let key = KeyAlgorithm::EcP256.generate().unwrap();
        let csr = keys::parse_csr(&csr_der(&key, "svc.local", &["svc.local"])).unwrap();

        let first = engine.sign_csr("svc.local", &csr, &Actor::system()).unwrap();
        assert_eq!(first.kind, CertificateKind::AcmeIssued);
        engine.revoke("svc.local", &Actor::system()).unwrap();

        let second = engine.sign_csr("svc.local", &csr, &Actor::system()).unwrap();
        assert_ne!(first.serial, second.serial);
        assert!(!second.revoked);

        engine.issue_server("web1", &[], &Actor::system()).unwrap();
        assert!(matches!(
            engine.sign_csr("web1", &csr, &Actor::system()),
            Err(Error::ConflictingState(_))
        ));
    }

    #[test]
    fn test_renew_acme_certificate_keeps_public_key() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let key = KeyAlgorithm::EcP256.generate().unwrap();
        let csr = keys::parse_csr(&csr_der(&key, "svc.local", &["svc.local"])).unwrap();
        engine.sign_csr("svc.local", &csr, &Actor::system()).unwrap();

        engine.renew("svc.local", &Actor::system()).unwrap();
        let pem = engine.certificate_chain_pem("svc.local").unwrap();
        let leaf = X509::from_pem(&pem).unwrap();
        assert_eq!(
            keys::key_hash(&leaf.public_key().unwrap()).unwrap(),
            keys::key_hash(&key).unwrap()
        );
    }
}
