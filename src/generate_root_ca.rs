//! CA Certificate Generation Module
//!
//! This module generates the self-signed certificate that anchors every
//! certificate this authority issues, and re-signs it on renewal.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Key Usage**: keyCertSign, cRLSign (critical)
//! - **Basic Constraints**: CA=true, pathlen=0 (signs end-entity certificates only)
//! - **Default Key Size**: RSA 4096-bit
//! - **Default Validity**: 3650 days
//! - **Version**: X.509v3 with subject key identifier
//!
//! # Example
//! ```rust,no_run
//! # use anyhow::Result;
//! # use pki_authority::generate_root_ca::CaCertificateBuilder;
//! # fn example() -> Result<()> {
//! let (ca_key, ca_cert) = CaCertificateBuilder::new()
//!     .subject_common_name("Example CA".to_string())
//!     .organization("Example Corporation".to_string())
//!     .country("US".to_string())
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, bail, Result};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509NameRef, X509};

use crate::keys::{self, KeyAlgorithm};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
pub const CA_VALIDITY_DAYS: u32 = 3650;
const CA_PATH_LENGTH: u32 = 0;

/// Builder for the self-signed CA key pair and certificate
///
/// Only `subject_common_name` is required. Organization and country are
/// added to the subject when non-empty.
///
/// # Renewal
/// [`CaCertificateBuilder::with_key`] signs the new certificate with an
/// existing key instead of generating one, and [`renew_ca_certificate`]
/// additionally carries the subject over from the current certificate.
pub struct CaCertificateBuilder {
    subject_common_name: String,
    organization: String,
    country: String,
    validity_days: u32,
    key: Option<PKey<Private>>,
}

impl Default for CaCertificateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CaCertificateBuilder {
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            country: String::new(),
            validity_days: CA_VALIDITY_DAYS,
            key: None,
        }
    }

    /// Set the common name (CN) for the certificate
    ///
    /// # Arguments
    /// * `cn` - CA name (e.g., "Example CA", "Lab Internal CA")
    ///
    /// # Returns
    /// Self for method chaining
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Set the organization (O) for the certificate
    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    /// Set the country (C) for the certificate (2-letter ISO code)
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    /// Set validity period in days
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Sign with an existing key instead of generating a new RSA-4096 key
    pub fn with_key(mut self, key: PKey<Private>) -> Self {
        self.key = Some(key);
        self
    }

    fn subject(&self) -> Result<X509Name> {
        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, &self.subject_common_name)
            .map_err(|e| anyhow!("Failed to set CN: {}", e))?;
        if !self.organization.is_empty() {
            name_builder
                .append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)
                .map_err(|e| anyhow!("Failed to set organization: {}", e))?;
        }
        if !self.country.is_empty() {
            name_builder
                .append_entry_by_nid(Nid::COUNTRYNAME, &self.country)
                .map_err(|e| anyhow!("Failed to set country: {}", e))?;
        }
        Ok(name_builder.build())
    }

    /// Build the key pair and self-signed CA certificate
    ///
    /// # Returns
    /// * `Ok((PKey<Private>, X509))` - Tuple of (private key, self-signed certificate)
    ///
    /// # Errors
    /// Returns error if:
    /// - The common name is empty
    /// - Key generation fails
    /// - X.509 extension creation or signing fails
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        if self.subject_common_name.trim().is_empty() {
            bail!("CA common name must not be empty");
        }
        let name = self.subject()?;
        let private_key = match self.key {
            Some(key) => key,
            None => KeyAlgorithm::Rsa4096.generate()?,
        };

        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        let serial = keys::random_serial()?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        builder
            .set_subject_name(&name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
        builder
            .set_issuer_name(&name)
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
            .set_pubkey(&private_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca().pathlen(CA_PATH_LENGTH);
        let extension = bc
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(extension)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        ku.key_cert_sign();
        ku.crl_sign();
        let ku_extension = ku
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(ski)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;
        Ok((private_key, builder.build()))
    }
}

/// Re-sign the CA certificate with its existing key and subject
///
/// The subject's CN, O and C are carried over; the validity restarts now.
pub fn renew_ca_certificate(
    key: PKey<Private>,
    current: &X509,
    validity_days: u32,
) -> Result<X509> {
    let subject = current.subject_name();
    let cn = keys::common_name(subject)
        .ok_or_else(|| anyhow!("CA certificate has no common name"))?;
    let (_, cert) = CaCertificateBuilder::new()
        .subject_common_name(cn)
        .organization(entry(subject, Nid::ORGANIZATIONNAME))
        .country(entry(subject, Nid::COUNTRYNAME))
        .validity_days(validity_days)
        .with_key(key)
        .build()?;
    Ok(cert)
}

fn entry(name: &X509NameRef, nid: Nid) -> String {
    name.entries_by_nid(nid)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_default()
}
