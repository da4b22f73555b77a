//! Revocation and CRL maintenance
//!
//! Revoking a certificate appends a line to `ca/crl/index.txt`, re-signs the
//! CRL from the full index, publishes it to `ca/ca.crl` and `ca.crl`, and only
//! then writes the `revoked` sentinel next to the certificate. All of this
//! happens under one CA-wide lock so the published CRL always reflects a
//! prefix of the index.
//!
//! A certificate that is replaced under the same name, or revoked after it
//! was replaced, has no sentinel to write; it is listed in the index and the
//! CRL with its own serial and an optional reason code.
//!
//! The CRL is built natively (v2, SHA-256) from `x509-cert` structures and
//! signed with the CA key through OpenSSL.

use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use anyhow::anyhow;
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Utc};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::Id;
use openssl::sign::Signer;
use openssl::x509::X509Ref;
use parking_lot::Mutex;
use tracing::info;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::der::asn1::{BitString, GeneralizedTime, OctetString, UtcTime};
use x509_cert::der::oid::ObjectIdentifier;
use x509_cert::der::{Any, AnyRef, Decode, Encode};
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;
use x509_cert::{Certificate, Version};

use crate::audit::{Actor, AuditEvent};
use crate::ca_manager::CaSigner;
use crate::error::{Error, Result};
use crate::keys;
use crate::storage::{SafeName, Storage, MODE_PUBLIC};

pub const CRL_VALIDITY_DAYS: i64 = 30;
const INDEX_TIME_FORMAT: &str = "%y%m%d%H%M%SZ";

const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
const CRL_REASON: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.21");

/// RFC 5280 CRLReason values recorded by this CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
}

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
        }
    }

    /// Reason names as they appear in an OpenSSL index file
    pub fn as_str(self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            RevocationReason::Unspecified,
            RevocationReason::KeyCompromise,
            RevocationReason::AffiliationChanged,
            RevocationReason::Superseded,
            RevocationReason::CessationOfOperation,
        ]
        .into_iter()
        .find(|r| r.as_str() == s)
    }

    /// DER of the `reasonCode` entry extension value (ENUMERATED)
    fn extension_value(self) -> [u8; 3] {
        [0x0A, 0x01, self.code()]
    }
}

/// One line of the revocation index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    pub serial: String,
    pub not_after: DateTime<Utc>,
    pub revoked_at: DateTime<Utc>,
    pub common_name: String,
    pub reason: Option<RevocationReason>,
}

impl RevocationEntry {
    /// Describe `cert` as revoked now
    pub fn for_certificate(cert: &X509Ref, reason: Option<RevocationReason>) -> Result<Self> {
        Ok(Self {
            serial: keys::serial_hex(cert)?,
            not_after: keys::asn1_to_utc(cert.not_after())?,
            revoked_at: Utc::now(),
            common_name: keys::common_name(cert.subject_name()).unwrap_or_default(),
            reason,
        })
    }

    /// `R\t<not-after>\t<SERIAL>\t<revoked-at>[,<reason>]\tunknown\t/CN=<name>`
    pub fn to_index_line(&self) -> String {
        let mut revoked_at = self.revoked_at.format(INDEX_TIME_FORMAT).to_string();
        if let Some(reason) = self.reason {
            revoked_at.push(',');
            revoked_at.push_str(reason.as_str());
        }
        format!(
            "R\t{}\t{}\t{}\tunknown\t/CN={}",
            self.not_after.format(INDEX_TIME_FORMAT),
            self.serial,
            revoked_at,
            self.common_name
        )
    }

    pub fn parse_index_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 || fields[0] != "R" {
            return None;
        }
        let parse = |s: &str| {
            NaiveDateTime::parse_from_str(s, INDEX_TIME_FORMAT)
                .ok()
                .map(|t| t.and_utc())
        };
        let (revoked_at, reason) = match fields[3].split_once(',') {
            Some((time, reason)) => (time, Some(RevocationReason::parse(reason)?)),
            None => (fields[3], None),
        };
        Some(Self {
            not_after: parse(fields[1])?,
            serial: fields[2].to_string(),
            revoked_at: parse(revoked_at)?,
            common_name: fields[5].strip_prefix("/CN=").unwrap_or(fields[5]).to_string(),
            reason,
        })
    }
}

/// Entries of `ca/crl/index.txt`, in append order
pub fn read_index(storage: &Storage) -> Result<Vec<RevocationEntry>> {
    let Some(bytes) = storage.read_file(&storage.paths().crl_index())? else {
        return Ok(Vec::new());
    };
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .filter_map(RevocationEntry::parse_index_line)
        .collect())
}

fn asn1_time(t: DateTime<Utc>) -> anyhow::Result<Time> {
    let secs = u64::try_from(t.timestamp()).map_err(|_| anyhow!("time before epoch: {}", t))?;
    let duration = StdDuration::from_secs(secs);
    // RFC 5280: UTCTime through 2049, GeneralizedTime after
    if t.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_unix_duration(duration)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(duration)?))
    }
}

/// Encode and sign a v2 CRL listing `entries`
///
/// # Arguments
/// * `signer` - CA key (RSA or EC P-256) and certificate
/// * `entries` - Revoked serials; duplicates are listed once
/// * `crl_number` - Monotonic CRL number extension value
/// * `this_update` - Issue time; next update is 30 days later
pub fn build_crl(
    signer: &CaSigner,
    entries: &[RevocationEntry],
    crl_number: u64,
    this_update: DateTime<Utc>,
) -> anyhow::Result<Vec<u8>> {
    let ca = Certificate::from_der(&signer.cert.to_der()?)
        .map_err(|e| anyhow!("Failed to decode CA certificate: {}", e))?;

    let algorithm = match signer.key.id() {
        Id::RSA => AlgorithmIdentifierOwned {
            oid: SHA256_WITH_RSA,
            parameters: Some(Any::from(AnyRef::NULL)),
        },
        Id::EC => AlgorithmIdentifierOwned {
            oid: ECDSA_WITH_SHA256,
            parameters: None,
        },
        other => return Err(anyhow!("unsupported CA key type: {:?}", other)),
    };

    let mut revoked = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        if !seen.insert(entry.serial.clone()) {
            continue;
        }
        let serial = BigNum::from_hex_str(&entry.serial)
            .map_err(|e| anyhow!("invalid serial {}: {}", entry.serial, e))?;
        let crl_entry_extensions = match entry.reason {
            Some(reason) if reason != RevocationReason::Unspecified => Some(vec![Extension {
                extn_id: CRL_REASON,
                critical: false,
                extn_value: OctetString::new(reason.extension_value().to_vec())?,
            }]),
            _ => None,
        };
        revoked.push(RevokedCert {
            serial_number: SerialNumber::new(&serial.to_vec())?,
            revocation_date: asn1_time(entry.revoked_at)?,
            crl_entry_extensions,
        });
    }

    let crl_number_ext = Extension {
        extn_id: CRL_NUMBER,
        critical: false,
        extn_value: OctetString::new(crl_number.to_der()?)?,
    };

    let tbs = TbsCertList {
        version: Version::V2,
        signature: algorithm.clone(),
        issuer: ca.tbs_certificate.subject,
        this_update: asn1_time(this_update)?,
        next_update: Some(asn1_time(this_update + Duration::days(CRL_VALIDITY_DAYS))?),
        revoked_certificates: if revoked.is_empty() { None } else { Some(revoked) },
        crl_extensions: Some(vec![crl_number_ext]),
    };
    let tbs_der = tbs.to_der()?;

    let mut sig = Signer::new(MessageDigest::sha256(), &signer.key)
        .map_err(|e| anyhow!("Failed to create CRL signer: {}", e))?;
    sig.update(&tbs_der)?;
    let signature = sig
        .sign_to_vec()
        .map_err(|e| anyhow!("Failed to sign CRL: {}", e))?;

    let crl = CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(&signature)?,
    };
    Ok(crl.to_der()?)
}

fn next_crl_number(storage: &Storage) -> Result<u64> {
    let path = storage.paths().crl_number();
    let current = storage
        .read_file(&path)?
        .and_then(|b| String::from_utf8_lossy(&b).trim().parse::<u64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    storage.write_file(&path, next.to_string().as_bytes(), MODE_PUBLIC)?;
    Ok(next)
}

/// Re-sign the CRL from the current index and publish both copies
///
/// Callers other than bootstrap go through [`Revocations`], which holds the
/// CA-wide lock.
pub fn publish_crl(storage: &Storage, signer: &CaSigner) -> Result<Vec<u8>> {
    let entries = read_index(storage)?;
    let number = next_crl_number(storage)?;
    let der = build_crl(signer, &entries, number, Utc::now())?;
    let paths = storage.paths();
    storage.write_file(&paths.ca_crl(), &der, MODE_PUBLIC)?;
    storage.write_file(&paths.public_crl(), &der, MODE_PUBLIC)?;
    info!(crl_number = number, revoked = entries.len(), "CRL published");
    Ok(der)
}

/// Serialises every write to the revocation index and CRL
pub struct Revocations {
    storage: Arc<Storage>,
    lock: Mutex<()>,
}

impl Revocations {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Revoke the certificate currently stored under `name`
    ///
    /// # Errors
    /// [`Error::NotFound`] when there is no certificate, and
    /// [`Error::ConflictingState`] when it is already revoked.
    pub fn revoke(&self, name: &SafeName, signer: &CaSigner, actor: &Actor) -> Result<RevocationEntry> {
        let _guard = self.lock.lock();
        let paths = self.storage.paths();
        if paths.revoked_marker(name).exists() {
            return Err(Error::ConflictingState(format!(
                "certificate {name} is already revoked"
            )));
        }
        let pem = self
            .storage
            .read_file(&paths.cert_file(name))?
            .ok_or_else(|| Error::NotFound(format!("certificate {name}")))?;
        let cert = keys::load_certificate(&pem)?;
        let mut entry = RevocationEntry::for_certificate(&cert, None)?;
        if entry.common_name.is_empty() {
            entry.common_name = name.to_string();
        }
        self.append_and_publish(&entry, signer)?;

        self.storage.write_file(
            &paths.revoked_marker(name),
            entry.revoked_at.to_rfc3339().as_bytes(),
            MODE_PUBLIC,
        )?;
        self.storage.refresh_certificate(name)?;

        info!(name = %name, serial = %entry.serial, "certificate revoked");
        self.storage.audit().record(
            AuditEvent::new("revoke", "certificate", name.to_string())
                .actor(actor.clone())
                .field("serial", entry.serial.clone()),
        );
        Ok(entry)
    }

    /// Revoke a certificate that is no longer the one stored under `name`
    ///
    /// Used when a certificate is replaced and when an older serial is
    /// revoked by its holder. No sentinel is written; the current
    /// certificate under `name` is unaffected.
    ///
    /// # Errors
    /// [`Error::ConflictingState`] when the serial is already listed.
    pub fn revoke_retired(
        &self,
        name: &SafeName,
        cert: &X509Ref,
        reason: Option<RevocationReason>,
        signer: &CaSigner,
        actor: &Actor,
    ) -> Result<RevocationEntry> {
        let _guard = self.lock.lock();
        let mut entry = RevocationEntry::for_certificate(cert, reason)?;
        if entry.common_name.is_empty() {
            entry.common_name = name.to_string();
        }
        if read_index(&self.storage)?.iter().any(|e| e.serial == entry.serial) {
            return Err(Error::ConflictingState(format!(
                "serial {} is already revoked",
                entry.serial
            )));
        }
        self.append_and_publish(&entry, signer)?;

        info!(name = %name, serial = %entry.serial, reason = ?reason, "retired certificate revoked");
        let mut event = AuditEvent::new("revoke", "certificate", name.to_string())
            .actor(actor.clone())
            .field("serial", entry.serial.clone());
        if let Some(reason) = reason {
            event = event.field("reason", reason.as_str());
        }
        self.storage.audit().record(event);
        Ok(entry)
    }

    /// Whether `serial` appears in the revocation index
    pub fn is_listed(&self, serial: &str) -> Result<bool> {
        Ok(read_index(&self.storage)?.iter().any(|e| e.serial == serial))
    }

    /// Append `entry` to the index and re-sign the CRL; caller holds the lock
    fn append_and_publish(&self, entry: &RevocationEntry, signer: &CaSigner) -> Result<()> {
        let path = self.storage.paths().crl_index();
        let mut index = self.storage.read_file(&path)?.unwrap_or_default();
        if !index.is_empty() && !index.ends_with(b"\n") {
            index.push(b'\n');
        }
        index.extend_from_slice(entry.to_index_line().as_bytes());
        index.push(b'\n');
        self.storage.write_file(&path, &index, MODE_PUBLIC)?;
        publish_crl(&self.storage, signer)?;
        Ok(())
    }

    /// Re-sign the CRL without changing the index
    pub fn refresh(&self, signer: &CaSigner) -> Result<()> {
        let _guard = self.lock.lock();
        publish_crl(&self.storage, signer)?;
        Ok(())
    }

    /// Time since `ca/ca.crl` was last written
    pub fn crl_age(&self) -> Option<StdDuration> {
        let modified = std::fs::metadata(self.storage.paths().ca_crl())
            .and_then(|m| m.modified())
            .ok()?;
        SystemTime::now().duration_since(modified).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_root_ca::CaCertificateBuilder;
    use crate::keys::KeyAlgorithm;
    use openssl::x509::X509Crl;

    fn signer(algorithm: KeyAlgorithm) -> CaSigner {
        let (key, cert) = CaCertificateBuilder::new()
            .subject_common_name("CRL Test CA".to_string())
            .organization("Acme".to_string())
            .with_key(algorithm.generate().unwrap())
            .build()
            .unwrap();
        CaSigner { key, cert }
    }

    fn entry(serial: &str) -> RevocationEntry {
        RevocationEntry {
            serial: serial.to_string(),
            not_after: Utc::now() + Duration::days(365),
            revoked_at: Utc::now(),
            common_name: "web1".to_string(),
            reason: None,
        }
    }

    #[test]
    fn test_index_line_roundtrip() {
        let line = "R\t270101120000Z\t0A1B2C\t260315083000Z\tunknown\t/CN=web1";
        let parsed = RevocationEntry::parse_index_line(line).unwrap();
        assert_eq!(parsed.serial, "0A1B2C");
        assert_eq!(parsed.common_name, "web1");
        assert_eq!(parsed.to_index_line(), line);
        assert!(RevocationEntry::parse_index_line("V\tjunk").is_none());
    }

    #[test]
    fn test_crl_lists_serials_and_verifies() {
        for algorithm in [KeyAlgorithm::Rsa2048, KeyAlgorithm::EcP256] {
            let signer = signer(algorithm);
            let entries = vec![entry("0A1B2C"), entry("FF00FF00FF00FF00FF00FF00FF00FF00"), entry("0A1B2C")];
            let der = build_crl(&signer, &entries, 7, Utc::now()).unwrap();

            let crl = X509Crl::from_der(&der).unwrap();
            assert!(crl.verify(&signer.key).unwrap());
            let serials: Vec<String> = crl
                .get_revoked()
                .unwrap()
                .iter()
                .map(|r| r.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string())
                .collect();
            assert_eq!(serials.len(), 2);
            assert!(serials.contains(&"0A1B2C".to_string()));
            assert!(serials.contains(&"FF00FF00FF00FF00FF00FF00FF00FF00".to_string()));
            assert_eq!(
                keys::name_to_string(crl.issuer_name()),
                keys::name_to_string(signer.cert.subject_name())
            );
        }
    }

    #[test]
    fn test_empty_crl() {
        let signer = signer(KeyAlgorithm::EcP256);
        let der = build_crl(&signer, &[], 1, Utc::now()).unwrap();
        let crl = X509Crl::from_der(&der).unwrap();
        assert!(crl.get_revoked().is_none());
        assert!(crl.next_update().is_some());
    }

    #[test]
    fn test_index_line_with_reason() {
        let line = "R\t270101120000Z\t0A1B2C\t260315083000Z,superseded\tunknown\t/CN=svc.local";
        let parsed = RevocationEntry::parse_index_line(line).unwrap();
        assert_eq!(parsed.reason, Some(RevocationReason::Superseded));
        assert_eq!(parsed.to_index_line(), line);
        assert!(RevocationEntry::parse_index_line(
            "R\t270101120000Z\t0A1B2C\t260315083000Z,bogus\tunknown\t/CN=x"
        )
        .is_none());
    }

    #[test]
    fn test_crl_carries_reason_code() {
        let signer = signer(KeyAlgorithm::EcP256);
        let mut superseded = entry("0A1B2C");
        superseded.reason = Some(RevocationReason::Superseded);
        let der = build_crl(&signer, &[superseded, entry("0D0E")], 2, Utc::now()).unwrap();

        let crl = CertificateList::from_der(&der).unwrap();
        let revoked = crl.tbs_cert_list.revoked_certificates.unwrap();
        let reasons: Vec<Option<Vec<u8>>> = revoked
            .iter()
            .map(|r| {
                r.crl_entry_extensions.as_ref().map(|exts| {
                    assert_eq!(exts[0].extn_id, CRL_REASON);
                    exts[0].extn_value.as_bytes().to_vec()
                })
            })
            .collect();
        assert_eq!(reasons, vec![Some(vec![0x0A, 0x01, 0x04]), None]);
    }

    #[test]
    fn test_revoke_retired_lists_serial_once() {
        use crate::audit::AuditLog;
        use crate::generate_leaf_cert::{CertificateKind, LeafCertBuilder};
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::files_only(dir.path(), Arc::new(AuditLog::tracing_only())).unwrap());
        let revocations = Revocations::new(storage.clone());
        let signer = signer(KeyAlgorithm::EcP256);
        let leaf = LeafCertBuilder::new(&signer.key, &signer.cert, CertificateKind::Server)
            .subject_common_name("old.local".to_string())
            .key_algorithm(KeyAlgorithm::EcP256)
            .build()
            .unwrap()
            .certificate;
        let name = SafeName::certificate("old.local").unwrap();
        let serial = keys::serial_hex(&leaf).unwrap();

        assert!(!revocations.is_listed(&serial).unwrap());
        let entry = revocations
            .revoke_retired(&name, &leaf, Some(RevocationReason::Superseded), &signer, &Actor::system())
            .unwrap();
        assert_eq!(entry.serial, serial);
        assert_eq!(entry.common_name, "old.local");
        assert!(revocations.is_listed(&serial).unwrap());
        assert!(!storage.paths().revoked_marker(&name).exists());

        let crl = X509Crl::from_der(&std::fs::read(storage.paths().ca_crl()).unwrap()).unwrap();
        assert_eq!(crl.get_revoked().map(|r| r.len()), Some(1));
        assert!(matches!(
            revocations.revoke_retired(&name, &leaf, None, &signer, &Actor::system()),
            Err(Error::ConflictingState(_))
        ));
    }
}
