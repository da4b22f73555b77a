//! Key and certificate primitives
//!
//! Thin helpers over OpenSSL shared by the CA manager, leaf issuance,
//! revocation and the ACME server:
//! - RSA / EC P-256 key generation
//! - passphrase-encrypted PKCS#8 export and import
//! - PKCS#12 bundling
//! - CSR parsing with signature verification
//! - serial, SAN, subject and time accessors for parsed certificates
//! - key hashes (SHA-256 of the PKIX DER public key)

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::{X509NameRef, X509Ref, X509Req, X509};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use x509_cert::der::oid::ObjectIdentifier;
use x509_cert::der::{Decode, Encode};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extensions;
use x509_cert::request::CertReq;

const SERIAL_BITS: i32 = 128;
const EXTENSION_REQUEST_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const SUBJECT_ALT_NAME_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

/// Supported key algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa2048,
    Rsa4096,
    EcP256,
}

impl KeyAlgorithm {
    /// Generate a fresh private key
    pub fn generate(self) -> Result<PKey<Private>> {
        match self {
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa4096 => {
                let bits = if self == KeyAlgorithm::Rsa2048 { 2048 } else { 4096 };
                let rsa = Rsa::generate(bits)
                    .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;
                PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))
            }
            KeyAlgorithm::EcP256 => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
                    .map_err(|e| anyhow!("Failed to load P-256 group: {}", e))?;
                let ec = EcKey::generate(&group)
                    .map_err(|e| anyhow!("Failed to generate EC keypair: {}", e))?;
                PKey::from_ec_key(ec).map_err(|e| anyhow!("Failed to create private key: {}", e))
            }
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa2048 => write!(f, "RSA-2048"),
            KeyAlgorithm::Rsa4096 => write!(f, "RSA-4096"),
            KeyAlgorithm::EcP256 => write!(f, "EC-P256"),
        }
    }
}

/// Random 128-bit serial number
pub fn random_serial() -> Result<BigNum> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial)
}

/// URL-safe random token of `len` random bytes (base64url, no padding)
pub fn random_token(len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf).context("Failed to read random bytes")?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Uppercase hex serial of a certificate
pub fn serial_hex(cert: &X509Ref) -> Result<String> {
    let bn = cert
        .serial_number()
        .to_bn()
        .map_err(|e| anyhow!("Failed to read serial number: {}", e))?;
    Ok(bn.to_hex_str()?.to_string())
}

/// SHA-256 (hex) of the PKIX DER encoding of a public key
pub fn key_hash<T: HasPublic>(key: &PKeyRef<T>) -> Result<String> {
    let der = key
        .public_key_to_der()
        .map_err(|e| anyhow!("Failed to encode public key: {}", e))?;
    Ok(hex::encode(Sha256::digest(der)))
}

/// Encrypt a private key as PKCS#8 PEM with AES-256-CBC under `passphrase`
pub fn encrypt_private_key(key: &PKeyRef<Private>, passphrase: &SecretString) -> Result<Vec<u8>> {
    key.private_key_to_pem_pkcs8_passphrase(
        Cipher::aes_256_cbc(),
        passphrase.expose_secret().as_bytes(),
    )
    .map_err(|e| anyhow!("Failed to encrypt private key: {}", e))
}

pub fn decrypt_private_key(pem: &[u8], passphrase: &SecretString) -> Result<PKey<Private>> {
    PKey::private_key_from_pem_passphrase(pem, passphrase.expose_secret().as_bytes())
        .map_err(|e| anyhow!("Failed to decrypt private key: {}", e))
}

pub fn load_private_key(pem: &[u8]) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(pem).map_err(|e| anyhow!("Failed to parse private key: {}", e))
}

pub fn load_certificate(pem: &[u8]) -> Result<X509> {
    X509::from_pem(pem).map_err(|e| anyhow!("Failed to parse certificate: {}", e))
}

/// Concatenate certificates as a PEM chain in the given order
pub fn pem_chain(certs: &[&X509Ref]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for cert in certs {
        out.extend_from_slice(&cert.to_pem()?);
    }
    Ok(out)
}

/// Build a PKCS#12 archive holding `key`, `cert` and the issuing CA
///
/// # Arguments
/// * `friendly_name` - Name shown by key stores when importing
/// * `password` - Archive password; also protects the embedded key
pub fn build_pkcs12(
    friendly_name: &str,
    key: &PKeyRef<Private>,
    cert: &X509Ref,
    ca_cert: &X509Ref,
    password: &SecretString,
) -> Result<Vec<u8>> {
    let mut ca_stack = Stack::new()?;
    ca_stack.push(ca_cert.to_owned())?;
    let p12 = Pkcs12::builder()
        .name(friendly_name)
        .pkey(key)
        .cert(cert)
        .ca(ca_stack)
        .build2(password.expose_secret())
        .map_err(|e| anyhow!("Failed to build PKCS#12: {}", e))?;
    p12.to_der()
        .map_err(|e| anyhow!("Failed to encode PKCS#12: {}", e))
}

/// Convert an ASN.1 time to UTC
pub fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp out of range: {secs}"))
}

/// First CN entry of a name
pub fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

/// Render a name as `CN=.., O=.., C=..` in encoding order
pub fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{}={}", key, value))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// DNS and IP subject alternative names, in certificate order
pub fn certificate_sans(cert: &X509Ref) -> Vec<String> {
    let Some(names) = cert.subject_alt_names() else {
        return Vec::new();
    };
    names
        .iter()
        .filter_map(|gn| {
            if let Some(dns) = gn.dnsname() {
                Some(dns.to_string())
            } else {
                gn.ipaddress().and_then(ip_from_octets).map(|ip| ip.to_string())
            }
        })
        .collect()
}

fn ip_from_octets(octets: &[u8]) -> Option<IpAddr> {
    match octets.len() {
        4 => {
            let raw: [u8; 4] = octets.try_into().ok()?;
            Some(IpAddr::from(raw))
        }
        16 => {
            let raw: [u8; 16] = octets.try_into().ok()?;
            Some(IpAddr::from(raw))
        }
        _ => None,
    }
}

/// A certificate signing request whose self-signature has been verified
pub struct ParsedCsr {
    pub public_key: PKey<Public>,
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl ParsedCsr {
    /// CN ∪ SANs, lowercased
    pub fn names(&self) -> BTreeSet<String> {
        self.common_name
            .iter()
            .cloned()
            .chain(self.dns_names.iter().cloned())
            .chain(self.ip_addresses.iter().map(|ip| ip.to_string()))
            .map(|n| n.to_ascii_lowercase())
            .collect()
    }
}

/// Parse a DER CSR and verify its signature
///
/// # Errors
/// Fails when the DER is malformed, the signature does not verify, or the
/// extension request cannot be decoded.
pub fn parse_csr(der: &[u8]) -> Result<ParsedCsr> {
    let req = X509Req::from_der(der).map_err(|e| anyhow!("Failed to parse CSR: {}", e))?;
    let public_key = req
        .public_key()
        .map_err(|e| anyhow!("Failed to read CSR public key: {}", e))?;
    if !req.verify(&public_key)? {
        bail!("CSR signature does not verify");
    }
    let common_name = common_name(req.subject_name());

    let parsed = CertReq::from_der(der).map_err(|e| anyhow!("Failed to decode CSR: {}", e))?;
    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    for attr in parsed.info.attributes.iter() {
        if attr.oid != EXTENSION_REQUEST_OID {
            continue;
        }
        for value in attr.values.iter() {
            let extensions = Extensions::from_der(&value.to_der()?)
                .map_err(|e| anyhow!("Failed to decode extension request: {}", e))?;
            for ext in extensions
                .iter()
                .filter(|ext| ext.extn_id == SUBJECT_ALT_NAME_OID)
            {
                let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                    .map_err(|e| anyhow!("Failed to decode subjectAltName: {}", e))?;
                for name in san.0 {
                    match name {
                        GeneralName::DnsName(dns) => dns_names.push(dns.to_string()),
                        GeneralName::IpAddress(octets) => {
                            let ip = ip_from_octets(octets.as_bytes())
                                .ok_or_else(|| anyhow!("invalid IP address in CSR"))?;
                            ip_addresses.push(ip);
                        }
                        _ => bail!("CSR requests an unsupported subjectAltName type"),
                    }
                }
            }
        }
    }

    Ok(ParsedCsr {
        public_key,
        common_name,
        dns_names,
        ip_addresses,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::csr_der;
    use super::*;

    #[test]
    fn test_random_token_is_url_safe() {
        let token = random_token(32).unwrap();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, random_token(32).unwrap());
    }

    #[test]
    fn test_encrypted_key_roundtrip() {
        let key = KeyAlgorithm::EcP256.generate().unwrap();
        let pw = SecretString::new("correct horse".to_string());
        let pem = encrypt_private_key(&key, &pw).unwrap();
        assert!(String::from_utf8_lossy(&pem).contains("ENCRYPTED PRIVATE KEY"));

        let decrypted = decrypt_private_key(&pem, &pw).unwrap();
        assert_eq!(key_hash(&key).unwrap(), key_hash(&decrypted).unwrap());

        let wrong = SecretString::new("wrong".to_string());
        assert!(decrypt_private_key(&pem, &wrong).is_err());
    }

    #[test]
    fn test_key_hash_is_stable_for_public_half() {
        let key = KeyAlgorithm::EcP256.generate().unwrap();
        let public =
            PKey::public_key_from_der(&key.public_key_to_der().unwrap()).unwrap();
        assert_eq!(key_hash(&key).unwrap(), key_hash(&public).unwrap());
        assert_eq!(key_hash(&key).unwrap().len(), 64);
    }

    #[test]
    fn test_parse_csr_names() {
        let key = KeyAlgorithm::EcP256.generate().unwrap();
        let der = csr_der(&key, "svc.local", &["svc.local", "Alt.Local"]);
        let csr = parse_csr(&der).unwrap();
        assert_eq!(csr.common_name.as_deref(), Some("svc.local"));
        assert_eq!(csr.dns_names, vec!["svc.local", "Alt.Local"]);
        let names: Vec<_> = csr.names().into_iter().collect();
        assert_eq!(names, vec!["alt.local", "svc.local"]);
        assert_eq!(
            key_hash(&csr.public_key).unwrap(),
            key_hash(&key).unwrap()
        );
    }

    #[test]
    fn test_parse_csr_rejects_garbage() {
        assert!(parse_csr(b"not a csr").is_err());
    }

    #[test]
    fn test_asn1_to_utc() {
        let t = Asn1Time::from_unix(1_700_000_000).unwrap();
        assert_eq!(asn1_to_utc(&t).unwrap().timestamp(), 1_700_000_000);
    }
}
