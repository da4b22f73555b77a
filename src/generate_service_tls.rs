//! TLS certificate for the HTTPS download/admin listener
//!
//! The service certificate is an ordinary leaf of kind `service` with a
//! 3-year validity. Its SAN list covers every way an operator may reach the
//! host: `localhost`, `127.0.0.1`, the host name, the CA name, and every
//! non-loopback IPv4 address of the host.

use std::net::IpAddr;

use anyhow::Result;
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::X509Ref;
use tracing::debug;

use crate::generate_leaf_cert::{CertificateKind, IssuedLeaf, LeafCertBuilder};

pub const SERVICE_VALIDITY_DAYS: u32 = 3 * 365;
pub const SERVICE_COMMON_NAME: &str = "localhost";

/// SAN entries for the service certificate
///
/// The CA name is only included when it is usable as a DNS name.
pub fn service_sans(ca_name: &str) -> Vec<String> {
    let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    match hostname::get() {
        Ok(host) => {
            let host = host.to_string_lossy().trim().to_string();
            if !host.is_empty() && crate::generate_leaf_cert::is_dns_name(&host) {
                sans.push(host);
            }
        }
        Err(e) => debug!(error = %e, "host name unavailable for service certificate"),
    }
    if crate::generate_leaf_cert::is_dns_name(ca_name) {
        sans.push(ca_name.to_string());
    }
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => {
            for iface in ifaces {
                if let IpAddr::V4(v4) = iface.ip() {
                    if !v4.is_loopback() {
                        sans.push(v4.to_string());
                    }
                }
            }
        }
        Err(e) => debug!(error = %e, "interface addresses unavailable for service certificate"),
    }
    sans
}

/// Issue the service certificate under the CA
pub fn build_service_certificate(
    ca_key: &PKeyRef<Private>,
    ca_cert: &X509Ref,
    ca_name: &str,
) -> Result<IssuedLeaf> {
    LeafCertBuilder::new(ca_key, ca_cert, CertificateKind::Service)
        .subject_common_name(SERVICE_COMMON_NAME.to_string())
        .subject_alt_names(service_sans(ca_name))
        .validity_days(SERVICE_VALIDITY_DAYS)
        .build()
}
