use std::fs;
use std::sync::Arc;

use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::x509::{X509Crl, X509};
use pki_authority::audit::{Actor, AuditLog};
use pki_authority::ca_manager::CaConfig;
use pki_authority::error::Error;
use pki_authority::generate_leaf_cert::CertificateKind;
use pki_authority::issuance::{CertificateService, PkiEngine};
use pki_authority::storage::Storage;
use secrecy::SecretString;
use tempfile::TempDir;

fn engine(dir: &TempDir) -> PkiEngine {
    let storage = Storage::files_only(dir.path(), Arc::new(AuditLog::tracing_only())).unwrap();
    let pki = PkiEngine::new(Arc::new(storage));
    pki.ca()
        .bootstrap(&CaConfig {
            name: "Test CA".into(),
            organization: "Acme".into(),
            country: "US".into(),
            passphrase: SecretString::new("correct horse".into()),
        })
        .unwrap();
    pki
}

fn entry(cert: &X509, nid: Nid) -> String {
    cert.subject_name()
        .entries_by_nid(nid)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string()
}

fn load(path: impl AsRef<std::path::Path>) -> X509 {
    X509::from_pem(&fs::read(path).unwrap()).unwrap()
}

fn crl_serials(dir: &TempDir) -> Vec<String> {
    let crl = X509Crl::from_der(&fs::read(dir.path().join("ca/ca.crl")).unwrap()).unwrap();
    crl.get_revoked()
        .map(|stack| {
            stack
                .iter()
                .map(|r| r.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn test_bootstrap_writes_ca_tree() {
    let dir = TempDir::new().unwrap();
    let pki = engine(&dir);

    let ca = load(dir.path().join("ca/ca.pem"));
    assert_eq!(entry(&ca, Nid::COMMONNAME), "Test CA");
    assert_eq!(entry(&ca, Nid::ORGANIZATIONNAME), "Acme");
    assert_eq!(entry(&ca, Nid::COUNTRYNAME), "US");
    assert!(dir.path().join("ca/ca.key").is_file());
    assert!(dir.path().join("ca/ca.key.enc").is_file());
    assert!(dir.path().join("ca.pem").is_file());
    assert!(crl_serials(&dir).is_empty());

    assert!(matches!(
        pki.ca().bootstrap(&CaConfig {
            name: "Other".into(),
            organization: "Acme".into(),
            country: "US".into(),
            passphrase: SecretString::new("x".into()),
        }),
        Err(Error::AlreadyInitialized)
    ));
    pki.ca()
        .verify_key_copy(&SecretString::new("correct horse".into()))
        .unwrap();
    assert!(pki
        .ca()
        .verify_key_copy(&SecretString::new("wrong".into()))
        .is_err());
}

#[test]
fn test_issue_server_and_revoke() {
    let dir = TempDir::new().unwrap();
    let pki = engine(&dir);
    let actor = Actor::system();

    let info = pki
        .issue_server("web1", &["web1.local".to_string()], &actor)
        .unwrap();
    assert_eq!(info.kind, CertificateKind::Server);
    assert!(!info.revoked);
    assert!(info.sans.contains(&"web1".to_string()));
    assert!(info.sans.contains(&"web1.local".to_string()));

    let leaf = load(dir.path().join("web1/web1.crt"));
    let ca = load(dir.path().join("ca/ca.pem"));
    assert!(leaf.verify(&ca.public_key().unwrap()).unwrap());
    assert!(dir.path().join("web1/web1.key").is_file());
    assert!(dir.path().join("web1/ca.crt").is_file());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dir.path().join("web1/web1.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let by_serial = pki.find_by_serial(&info.serial).unwrap().unwrap();
    assert_eq!(by_serial.name, "web1");

    let revoked = pki.revoke("web1", &actor).unwrap();
    assert!(revoked.revoked);
    assert!(dir.path().join("web1/revoked").is_file());
    assert_eq!(crl_serials(&dir), vec![info.serial.clone()]);
    let index = fs::read_to_string(dir.path().join("ca/crl/index.txt")).unwrap();
    assert!(index.starts_with("R\t"));
    assert!(index.contains(&info.serial));

    assert!(matches!(
        pki.revoke("web1", &actor),
        Err(Error::ConflictingState(_))
    ));
    assert!(matches!(pki.renew("web1", &actor), Err(Error::ConflictingState(_))));
    // the CRL still lists the serial exactly once
    assert_eq!(crl_serials(&dir).len(), 1);
}

#[test]
fn test_names_are_unique_and_validated() {
    let dir = TempDir::new().unwrap();
    let pki = engine(&dir);
    let actor = Actor::system();

    pki.issue_server("web1", &[], &actor).unwrap();
    assert!(matches!(
        pki.issue_server("web1", &[], &actor),
        Err(Error::ConflictingState(_))
    ));
    for bad in ["", "..", "we b", "ca"] {
        assert!(matches!(
            pki.issue_server(bad, &[], &actor),
            Err(Error::Validation(_))
        ));
    }
    assert!(matches!(pki.get_info("missing"), Err(Error::NotFound(_))));
}

#[test]
fn test_client_certificate_pkcs12() {
    let dir = TempDir::new().unwrap();
    let pki = engine(&dir);
    let password = SecretString::new("p12-secret".into());

    let info = pki.issue_client("alice", &password, &Actor::system()).unwrap();
    assert_eq!(info.kind, CertificateKind::Client);

    let der = fs::read(dir.path().join("alice/alice.p12")).unwrap();
    let parsed = Pkcs12::from_der(&der).unwrap().parse2("p12-secret").unwrap();
    let cert = parsed.cert.unwrap();
    assert_eq!(entry(&cert, Nid::COMMONNAME), "alice");
    assert!(parsed.pkey.is_some());
    assert!(matches!(
        pki.issue_client("bob", &SecretString::new(String::new()), &Actor::system()),
        Err(Error::Validation(_))
    ));
}

#[test]
fn test_renew_keeps_key_and_changes_serial() {
    let dir = TempDir::new().unwrap();
    let pki = engine(&dir);
    let actor = Actor::system();

    let first = pki.issue_server("api", &["10.0.0.5".to_string()], &actor).unwrap();
    let key_before = fs::read(dir.path().join("api/api.key")).unwrap();

    let renewed = pki.renew("api", &actor).unwrap();
    assert_ne!(first.serial, renewed.serial);
    assert_eq!(first.sans, renewed.sans);
    assert_eq!(fs::read(dir.path().join("api/api.key")).unwrap(), key_before);
    assert!(renewed.not_after >= first.not_after);
}

#[test]
fn test_list_and_delete() {
    let dir = TempDir::new().unwrap();
    let pki = engine(&dir);
    let actor = Actor::system();

    pki.issue_server("zeta", &[], &actor).unwrap();
    pki.issue_server("alpha", &[], &actor).unwrap();
    let names: Vec<String> = pki.list().unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);

    let serial = pki.get_info("zeta").unwrap().serial;
    pki.delete("zeta", &actor).unwrap();
    assert!(!dir.path().join("zeta").exists());
    assert!(pki.find_by_serial(&serial).unwrap().is_none());
    assert_eq!(pki.list().unwrap().len(), 1);

    let chain = pki.certificate_chain_pem("alpha").unwrap();
    let certs = X509::stack_from_pem(&chain).unwrap();
    assert_eq!(certs.len(), 2);
}
