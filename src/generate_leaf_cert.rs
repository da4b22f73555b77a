//! Leaf Certificate Generation Module
//!
//! Builds end-entity certificates signed directly by the CA:
//!
//! **Certificate Chain**: CA → Leaf Certificate
//!
//! # X.509 Extensions per kind
//! - **server / service / acme-issued**: Key Usage `digitalSignature`,
//!   `keyEncipherment`; Extended Key Usage `serverAuth`
//! - **client**: Key Usage `digitalSignature`; Extended Key Usage
//!   `clientAuth`, `emailProtection`
//!
//! Every leaf carries `CA=false`, subject and authority key identifiers and
//! a Subject Alternative Name made of the common name followed by the extra
//! names, de-duplicated. Entries that parse as IP addresses become `iPAddress`
//! SANs, everything else `dNSName`.
//!
//! # Example
//! ```rust,no_run
//! # use anyhow::Result;
//! # use openssl::pkey::{PKey, Private};
//! # use openssl::x509::X509;
//! # use pki_authority::generate_leaf_cert::{CertificateKind, LeafCertBuilder};
//! # fn example(ca_key: PKey<Private>, ca_cert: X509) -> Result<()> {
//! let issued = LeafCertBuilder::new(&ca_key, &ca_cert, CertificateKind::Server)
//!     .subject_common_name("web1".to_string())
//!     .subject_alt_names(vec!["web1.local".to_string(), "10.0.0.2".to_string()])
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private, Public};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509Ref, X509};
use serde::{Deserialize, Serialize};

use crate::keys::{self, KeyAlgorithm};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
pub const LEAF_VALIDITY_DAYS: u32 = 365;

/// What a leaf certificate is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateKind {
    Server,
    Client,
    Service,
    AcmeIssued,
}

impl CertificateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateKind::Server => "server",
            CertificateKind::Client => "client",
            CertificateKind::Service => "service",
            CertificateKind::AcmeIssued => "acme-issued",
        }
    }
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertificateKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(CertificateKind::Server),
            "client" => Ok(CertificateKind::Client),
            "service" => Ok(CertificateKind::Service),
            "acme-issued" => Ok(CertificateKind::AcmeIssued),
            other => Err(anyhow!("unknown certificate kind: {}", other)),
        }
    }
}

/// Where the subject public key comes from
enum SubjectKey {
    Generate(KeyAlgorithm),
    Existing(PKey<Private>),
    PublicOnly(PKey<Public>),
}

/// Output of [`LeafCertBuilder::build`]
pub struct IssuedLeaf {
    /// Set when the builder generated or was handed the private key
    pub private_key: Option<PKey<Private>>,
    pub certificate: X509,
}

/// Builder for leaf certificates signed by the CA
///
/// By default a fresh RSA-2048 key is generated. Renewal passes the current
/// key via [`LeafCertBuilder::existing_key`]; CSR-based issuance passes only
/// the requester's public key via [`LeafCertBuilder::public_key`].
pub struct LeafCertBuilder<'a> {
    subject_common_name: String,
    subject_alt_names: Vec<String>,
    kind: CertificateKind,
    validity_days: u32,
    serial: Option<BigNum>,
    subject_key: SubjectKey,
    signing_key: &'a PKeyRef<Private>,
    signing_cert: &'a X509Ref,
}

impl<'a> LeafCertBuilder<'a> {
    /// Create a new leaf certificate builder
    ///
    /// # Arguments
    /// * `ca_key` - CA private key used to sign
    /// * `ca_cert` - CA certificate (issuer name and authority key id)
    /// * `kind` - Selects key usage and extended key usage
    pub fn new(ca_key: &'a PKeyRef<Private>, ca_cert: &'a X509Ref, kind: CertificateKind) -> Self {
        Self {
            subject_common_name: String::new(),
            subject_alt_names: Vec::new(),
            kind,
            validity_days: LEAF_VALIDITY_DAYS,
            serial: None,
            subject_key: SubjectKey::Generate(KeyAlgorithm::Rsa2048),
            signing_key: ca_key,
            signing_cert: ca_cert,
        }
    }

    /// Set the common name (CN); it is also the first SAN
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Additional DNS names or IP addresses
    pub fn subject_alt_names(mut self, names: Vec<String>) -> Self {
        self.subject_alt_names = names;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Use a specific serial instead of a random one
    pub fn serial(mut self, serial: BigNum) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.subject_key = SubjectKey::Generate(algorithm);
        self
    }

    pub fn existing_key(mut self, key: PKey<Private>) -> Self {
        self.subject_key = SubjectKey::Existing(key);
        self
    }

    pub fn public_key(mut self, key: PKey<Public>) -> Self {
        self.subject_key = SubjectKey::PublicOnly(key);
        self
    }

    /// Ordered, de-duplicated SAN list: CN first, then the extra names
    pub fn san_list(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in std::iter::once(&self.subject_common_name).chain(self.subject_alt_names.iter())
        {
            let name = name.trim();
            if name.is_empty() || out.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                continue;
            }
            out.push(name.to_string());
        }
        out
    }

    /// Build and sign the leaf certificate
    ///
    /// # Errors
    /// Returns error if the common name is empty, a SAN is not a valid DNS
    /// name or IP address, key generation fails, or signing fails.
    pub fn build(self) -> Result<IssuedLeaf> {
        if self.subject_common_name.trim().is_empty() {
            bail!("certificate common name must not be empty");
        }
        let sans = self.san_list();
        for san in &sans {
            if IpAddr::from_str(san).is_err() && !is_dns_name(san) {
                bail!("invalid subject alternative name: {}", san);
            }
        }

        let (private_key, public_der) = match &self.subject_key {
            SubjectKey::Generate(algorithm) => {
                let key = algorithm.generate()?;
                let der = key.public_key_to_der()?;
                (Some(key), der)
            }
            SubjectKey::Existing(key) => (Some(key.clone()), key.public_key_to_der()?),
            SubjectKey::PublicOnly(key) => (None, key.public_key_to_der()?),
        };
        let public_key = PKey::public_key_from_der(&public_der)
            .map_err(|e| anyhow!("Failed to load subject public key: {}", e))?;

        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        let serial = match self.serial {
            Some(serial) => serial,
            None => keys::random_serial()?,
        };
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&*serial)?;

        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, self.subject_common_name.trim())
            .map_err(|e| anyhow!("Failed to set CN: {}", e))?;
        let name = name_builder.build();
        builder
            .set_subject_name(&name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
        builder
            .set_issuer_name(self.signing_cert.subject_name())
            .map_err(|e| anyhow!("Failed to set issuer: {}", e))?;

        let not_before = openssl::asn1::Asn1Time::days_from_now(0)
            .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;
        let not_after = openssl::asn1::Asn1Time::days_from_now(self.validity_days)
            .map_err(|e| anyhow!("Failed to create not_after: {}", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;

        builder
            .set_pubkey(&public_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let bc = BasicConstraints::new()
            .critical()
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(bc)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        ku.digital_signature();
        let mut eku = ExtendedKeyUsage::new();
        match self.kind {
            CertificateKind::Client => {
                eku.client_auth();
                eku.email_protection();
            }
            CertificateKind::Server | CertificateKind::Service | CertificateKind::AcmeIssued => {
                ku.key_encipherment();
                eku.server_auth();
            }
        }
        let ku_extension = ku
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;
        let eku_extension = eku
            .build()
            .map_err(|e| anyhow!("Failed to build ExtendedKeyUsage: {}", e))?;
        builder
            .append_extension(eku_extension)
            .map_err(|e| anyhow!("Failed to add ExtendedKeyUsage: {}", e))?;

        let mut san = SubjectAlternativeName::new();
        for entry in &sans {
            if IpAddr::from_str(entry).is_ok() {
                san.ip(entry);
            } else {
                san.dns(entry);
            }
        }
        let san_extension = san
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .map_err(|e| anyhow!("Failed to build SubjectAlternativeName: {}", e))?;
        builder
            .append_extension(san_extension)
            .map_err(|e| anyhow!("Failed to add SubjectAlternativeName: {}", e))?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(ski)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .map_err(|e| anyhow!("Failed to build AuthorityKeyIdentifier: {}", e))?;
        builder
            .append_extension(aki)
            .map_err(|e| anyhow!("Failed to add AuthorityKeyIdentifier: {}", e))?;

        builder
            .sign(self.signing_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;

        Ok(IssuedLeaf {
            private_key,
            certificate: builder.build(),
        })
    }
}

/// Loose hostname check: labels of `[A-Za-z0-9-]`, optional leading `*.`
pub fn is_dns_name(name: &str) -> bool {
    let name = name.strip_prefix("*.").unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_root_ca::CaCertificateBuilder;

    fn ca() -> (PKey<Private>, X509) {
        CaCertificateBuilder::new()
            .subject_common_name("Leaf Test CA".to_string())
            .with_key(KeyAlgorithm::EcP256.generate().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_server_sans_and_issuer() {
        let (ca_key, ca_cert) = ca();
        let issued = LeafCertBuilder::new(&ca_key, &ca_cert, CertificateKind::Server)
            .subject_common_name("web1".to_string())
            .subject_alt_names(vec![
                "web1.local".to_string(),
                "10.0.0.2".to_string(),
                "WEB1".to_string(),
            ])
            .key_algorithm(KeyAlgorithm::EcP256)
            .build()
            .unwrap();
        let cert = issued.certificate;
        assert!(issued.private_key.is_some());
        assert_eq!(
            keys::certificate_sans(&cert),
            vec!["web1", "web1.local", "10.0.0.2"]
        );
        assert_eq!(
            keys::name_to_string(cert.issuer_name()),
            keys::name_to_string(ca_cert.subject_name())
        );
        assert!(cert.verify(&ca_key).unwrap());
    }

    #[test]
    fn test_public_only_key_has_no_private_half() {
        let (ca_key, ca_cert) = ca();
        let requester = KeyAlgorithm::EcP256.generate().unwrap();
        let public = PKey::public_key_from_der(&requester.public_key_to_der().unwrap()).unwrap();
        let issued = LeafCertBuilder::new(&ca_key, &ca_cert, CertificateKind::AcmeIssued)
            .subject_common_name("svc.local".to_string())
            .public_key(public)
            .build()
            .unwrap();
        assert!(issued.private_key.is_none());
        assert_eq!(
            keys::key_hash(&issued.certificate.public_key().unwrap()).unwrap(),
            keys::key_hash(&requester).unwrap()
        );
    }

    #[test]
    fn test_explicit_serial_is_used() {
        let (ca_key, ca_cert) = ca();
        let serial = openssl::bn::BigNum::from_hex_str("7F3A0C11").unwrap();
        let issued = LeafCertBuilder::new(&ca_key, &ca_cert, CertificateKind::Server)
            .subject_common_name("web1".to_string())
            .key_algorithm(KeyAlgorithm::EcP256)
            .serial(serial)
            .build()
            .unwrap();
        assert_eq!(keys::serial_hex(&issued.certificate).unwrap(), "7F3A0C11");
    }

    #[test]
    fn test_invalid_san_rejected() {
        let (ca_key, ca_cert) = ca();
        let result = LeafCertBuilder::new(&ca_key, &ca_cert, CertificateKind::Server)
            .subject_common_name("web1".to_string())
            .subject_alt_names(vec!["bad name!".to_string()])
            .key_algorithm(KeyAlgorithm::EcP256)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_kind_roundtrip_str() {
        for kind in [
            CertificateKind::Server,
            CertificateKind::Client,
            CertificateKind::Service,
            CertificateKind::AcmeIssued,
        ] {
            assert_eq!(kind.as_str().parse::<CertificateKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_is_dns_name() {
        assert!(is_dns_name("svc.local"));
        assert!(is_dns_name("alice"));
        assert!(!is_dns_name("-bad.local"));
        assert!(!is_dns_name("a..b"));
        assert!(!is_dns_name("has space"));
    }
}
