//! PKI Authority - Self-hosted Certificate Authority with an ACME endpoint
//!
//! A single-root certificate authority for private networks. It issues
//! server and client certificates on request, signs CSRs submitted through
//! an RFC 8555 (ACME) endpoint validated by HTTP-01, publishes a CRL, and
//! keeps everything in a plain directory tree with optional mirrors.
//!
//! # Overview
//!
//! ```text
//! CA (self-signed RSA-4096, 10 years)
//!   ├── server certificates   (RSA-2048, 1 year, serverAuth)
//!   ├── client certificates   (RSA-2048, 1 year, clientAuth, PKCS#12)
//!   └── ACME certificates     (CSR key, 1 year, serverAuth)
//! ```
//!
//! The file tree under the storage root is authoritative:
//!
//! ```text
//! ca/ca.pem  ca/ca.key  ca/ca.key.enc  ca/ca.crl  ca/crl/index.txt
//! <name>/<name>.crt  <name>/<name>.key  <name>/ca.crt  <name>/revoked
//! serials/<SERIAL>
//! acme/{accounts,orders,authz,challenges}/<id>.json
//! ca.pem  ca.crl  service.crt  service.key
//! ```
//!
//! Every write goes to the file tree first. The SQLite mirror, the object
//! store copy and the cache are best-effort and never fail a caller.
//!
//! # Quick Start
//!
//! ```bash
//! export CA_NAME="Home CA" ORGANIZATION="Home" COUNTRY=US
//! export CA_KEY_FILE=/run/secrets/ca_key STORAGE_PATH=/var/lib/pki
//! export ACME_BASE_URL=http://ca.home.arpa:8555
//! ./target/release/pki-authority
//! ```
//!
//! Then point any ACME client at `$ACME_BASE_URL/acme/directory`.
//!
//! ## As a Library
//!
//! ```no_run
//! use std::sync::Arc;
//! use pki_authority::audit::{Actor, AuditLog};
//! use pki_authority::ca_manager::CaConfig;
//! use pki_authority::issuance::{CertificateService, PkiEngine};
//! use pki_authority::storage::Storage;
//! use secrecy::SecretString;
//!
//! fn main() -> pki_authority::error::Result<()> {
//!     let storage = Arc::new(Storage::files_only(
//!         "/var/lib/pki",
//!         Arc::new(AuditLog::tracing_only()),
//!     )?);
//!     let pki = PkiEngine::new(storage);
//!     pki.ca().bootstrap(&CaConfig {
//!         name: "Home CA".into(),
//!         organization: "Home".into(),
//!         country: "US".into(),
//!         passphrase: SecretString::new("change me".into()),
//!     })?;
//!
//!     let web = pki.issue_server("web1", &[], &Actor::system())?;
//!     println!("issued {} valid until {}", web.serial, web.not_after);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`ca_manager`]: CA bootstrap, key checks, renewal, service certificate
//! - [`issuance`]: [`issuance::CertificateService`] and its implementation
//! - [`revocation`]: revocation index, CRL building and publishing
//! - [`storage`]: file tree, SQLite mirror, object-store copy, cache
//! - [`acme`]: JWS verification, nonces, account / order / challenge flow
//! - [`rate_limit`], [`cleanup`]: request throttling and periodic sweeps
//! - [`webserver`], [`app`]: listeners and process composition
//!
//! # Security Considerations
//!
//! - The CA key is stored PKCS#8 with mode 0600 next to an AES-256
//!   encrypted copy; startup refuses to continue if the two disagree.
//! - ACME requests are accepted only with a fresh single-use nonce, a
//!   matching URL and a valid signature from the account key.
//! - HTTP-01 validation follows no redirects and times out after 10 seconds.

pub mod acme;
pub mod app;
pub mod audit;
pub mod ca_manager;
pub mod cleanup;
pub mod configs;
pub mod error;
pub mod generate_leaf_cert;
pub mod generate_root_ca;
pub mod generate_service_tls;
pub mod issuance;
pub mod keys;
pub mod logging;
pub mod rate_limit;
pub mod revocation;
pub mod storage;
pub mod webserver;
