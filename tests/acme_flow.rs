use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Crl, X509NameBuilder, X509ReqBuilder, X509};
use pki_authority::acme::jws::{self, Jwk};
use pki_authority::acme::{self, AcmeService, AcmeStore, ChallengeValidator, Problem};
use pki_authority::audit::{Actor, AuditLog};
use pki_authority::ca_manager::CaConfig;
use pki_authority::configs::AcmeSettings;
use pki_authority::issuance::{CertificateService, PkiEngine};
use pki_authority::keys::KeyAlgorithm;
use pki_authority::rate_limit::{RateLimiter, RateLimits};
use pki_authority::storage::Storage;
use secrecy::SecretString;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const BASE: &str = "http://localhost:8555";

/// Stands in for the web servers being validated: answers challenge URLs
/// from a table the test fills in
#[derive(Default)]
struct Responder {
    served: Mutex<HashMap<String, String>>,
    fetched: Mutex<Vec<String>>,
}

impl Responder {
    fn serve(&self, domain: &str, token: &str, body: String) {
        self.served
            .lock()
            .unwrap()
            .insert(format!("http://{domain}/.well-known/acme-challenge/{token}"), body);
    }
}

#[async_trait]
impl ChallengeValidator for Responder {
    async fn validate(&self, domain: &str, token: &str, expected: &str) -> Result<(), String> {
        let url = format!("http://{domain}/.well-known/acme-challenge/{token}");
        self.fetched.lock().unwrap().push(url.clone());
        let body = self.served.lock().unwrap().get(&url).cloned();
        match body {
            Some(body) if body.trim_end() == expected => Ok(()),
            Some(_) => Err(format!("{url} returned the wrong key authorization")),
            None => Err(format!("{url} answered 404")),
        }
    }
}

struct Harness {
    _dir: TempDir,
    root: std::path::PathBuf,
    app: Router,
    service: Arc<AcmeService>,
    pki: Arc<PkiEngine>,
    responder: Arc<Responder>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(
            AcmeSettings::default(),
            RateLimits {
                hourly_limit: 10_000,
                burst_limit: 10_000,
            },
        )
    }

    fn with_config(settings: AcmeSettings, limits: RateLimits) -> Self {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLog::tracing_only());
        let storage = Arc::new(Storage::files_only(dir.path(), audit.clone()).unwrap());
        let pki = Arc::new(PkiEngine::new(storage.clone()));
        pki.ca()
            .bootstrap(&CaConfig {
                name: "Test CA".into(),
                organization: "Acme".into(),
                country: "US".into(),
                passphrase: SecretString::new("correct horse".into()),
            })
            .unwrap();
        let responder = Arc::new(Responder::default());
        let service = Arc::new(AcmeService::new(
            settings,
            AcmeStore::open(storage).unwrap(),
            Arc::new(RateLimiter::new(limits)),
            pki.clone(),
            responder.clone(),
            audit,
        ));
        Self {
            root: dir.path().to_path_buf(),
            _dir: dir,
            app: acme::router(service.clone()),
            service,
            pki,
            responder,
        }
    }

    async fn send(&self, method: Method, path: &str, body: Vec<u8>) -> Reply {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/jose+json")
            .body(Body::from(body))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        Reply { status, headers, body }
    }

    async fn nonce(&self) -> String {
        let reply = self.send(Method::HEAD, "/acme/new-nonce", Vec::new()).await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);
        reply.header("replay-nonce")
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> String {
        self.headers[name].to_str().unwrap().to_string()
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn problem(&self) -> Problem {
        assert_eq!(self.headers["content-type"], "application/problem+json");
        serde_json::from_slice(&self.body).unwrap()
    }
}

fn path_of(url: &str) -> String {
    url.strip_prefix(BASE).unwrap().to_string()
}

struct Client {
    key: PKey<Private>,
    jwk: Jwk,
    kid: Option<String>,
}

impl Client {
    fn new() -> Self {
        let key = KeyAlgorithm::EcP256.generate().unwrap();
        let jwk = Jwk::from_public_key(&key).unwrap();
        Self { key, jwk, kid: None }
    }

    fn jws(&self, nonce: &str, path: &str, payload: Option<&Value>, use_jwk: bool) -> Vec<u8> {
        let mut header = json!({ "nonce": nonce, "url": format!("{BASE}{path}") });
        match (&self.kid, use_jwk) {
            (Some(kid), false) => header["kid"] = json!(kid),
            _ => header["jwk"] = serde_json::to_value(&self.jwk).unwrap(),
        }
        let payload = payload.map(|p| p.to_string().into_bytes()).unwrap_or_default();
        serde_json::to_vec(&jws::sign(&self.key, header, &payload).unwrap()).unwrap()
    }

    async fn post(&self, h: &Harness, path: &str, payload: Option<Value>) -> Reply {
        let nonce = h.nonce().await;
        let body = self.jws(&nonce, path, payload.as_ref(), false);
        h.send(Method::POST, path, body).await
    }

    async fn register(&mut self, h: &Harness) -> Reply {
        let nonce = h.nonce().await;
        let payload = json!({ "contact": ["mailto:a@x"], "termsOfServiceAgreed": true });
        let body = self.jws(&nonce, "/acme/new-account", Some(&payload), true);
        let reply = h.send(Method::POST, "/acme/new-account", body).await;
        if reply.status.is_success() {
            self.kid = Some(reply.header("location"));
        }
        reply
    }

    fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.jwk.thumbprint().unwrap())
    }
}

fn csr_der(key: &PKey<Private>, cn: &str, sans: &[&str]) -> Vec<u8> {
    let mut builder = X509ReqBuilder::new().unwrap();
    builder.set_pubkey(key).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    let mut san = SubjectAlternativeName::new();
    for s in sans {
        san.dns(s);
    }
    let ext = san.build(&builder.x509v3_context(None)).unwrap();
    let mut exts = Stack::new().unwrap();
    exts.push(ext).unwrap();
    builder.add_extensions(&exts).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

/// Create an order for `domain` and return (order path, challenge path, token)
async fn order_for(h: &Harness, client: &Client, domain: &str) -> (String, String, String) {
    let reply = client
        .post(h, "/acme/new-order", Some(json!({ "identifiers": [{ "type": "dns", "value": domain }] })))
        .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    let order_path = path_of(&reply.header("location"));
    let order = reply.json();
    assert_eq!(order["status"], "pending");
    let authz_path = path_of(order["authorizations"][0].as_str().unwrap());

    let authz = client.post(h, &authz_path, None).await.json();
    assert_eq!(authz["status"], "pending");
    assert_eq!(authz["identifier"]["value"], domain);
    let challenge = &authz["challenges"][0];
    assert_eq!(challenge["type"], "http-01");
    (
        order_path,
        path_of(challenge["url"].as_str().unwrap()),
        challenge["token"].as_str().unwrap().to_string(),
    )
}

/// Validate the order's challenge so the order becomes ready
async fn prove_control(h: &Harness, client: &Client, domain: &str) -> String {
    let (order_path, challenge_path, token) = order_for(h, client, domain).await;
    h.responder
        .serve(domain, &token, client.key_authorization(&token));
    let reply = client.post(h, &challenge_path, Some(json!({}))).await;
    assert_eq!(reply.json()["status"], "valid");
    order_path
}

/// Run a full order for `domain` and return the issued leaf
async fn issue(h: &Harness, client: &Client, domain: &str) -> X509 {
    let order_path = prove_control(h, client, domain).await;
    let cert_key = KeyAlgorithm::EcP256.generate().unwrap();
    let csr = URL_SAFE_NO_PAD.encode(csr_der(&cert_key, domain, &[domain]));
    let finalize_path = order_path.replace("/acme/order/", "/acme/finalize/");
    let reply = client.post(h, &finalize_path, Some(json!({ "csr": csr }))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let cert_path = path_of(reply.json()["certificate"].as_str().unwrap());
    let reply = client.post(h, &cert_path, None).await;
    X509::stack_from_pem(&reply.body).unwrap().remove(0)
}

fn crl_serials(h: &Harness) -> Vec<String> {
    let crl = X509Crl::from_der(&fs::read(h.root.join("ca/ca.crl")).unwrap()).unwrap();
    crl.get_revoked()
        .map(|stack| {
            stack
                .iter()
                .map(|r| r.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn serial_of(cert: &X509) -> String {
    cert.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string()
}

async fn revoke(h: &Harness, client: &Client, cert: &X509) -> Reply {
    let der = URL_SAFE_NO_PAD.encode(cert.to_der().unwrap());
    client
        .post(h, "/acme/revoke-cert", Some(json!({ "certificate": der })))
        .await
}

#[tokio::test]
async fn test_new_account_and_lookup() {
    let h = Harness::new();
    let mut client = Client::new();

    let created = client.register(&h).await;
    assert_eq!(created.status, StatusCode::CREATED);
    let location = created.header("location");
    assert!(location.starts_with(&format!("{BASE}/acme/account/")));
    assert_eq!(created.json()["status"], "valid");
    assert_eq!(created.json()["contact"][0], "mailto:a@x");

    // the same key finds the same account
    let again = client.register(&h).await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.header("location"), location);

    let stranger = Client::new();
    let nonce = h.nonce().await;
    let body = stranger.jws(
        &nonce,
        "/acme/new-account",
        Some(&json!({ "onlyReturnExisting": true })),
        true,
    );
    let reply = h.send(Method::POST, "/acme/new-account", body).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().kind(), "accountDoesNotExist");
}

#[tokio::test]
async fn test_nonce_is_single_use() {
    let h = Harness::new();
    let client = Client::new();
    let nonce = h.nonce().await;
    let payload = json!({ "contact": ["mailto:a@x"] });

    let body = client.jws(&nonce, "/acme/new-account", Some(&payload), true);
    let first = h.send(Method::POST, "/acme/new-account", body).await;
    assert_eq!(first.status, StatusCode::CREATED);

    let body = client.jws(&nonce, "/acme/new-account", Some(&payload), true);
    let replay = h.send(Method::POST, "/acme/new-account", body).await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    let problem = replay.problem();
    assert_eq!(problem.kind(), "badNonce");
    assert_eq!(problem.detail, "Invalid nonce");
    // a problem response still hands out a fresh nonce
    assert!(replay.headers.contains_key("replay-nonce"));
}

#[tokio::test]
async fn test_signed_url_must_match() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let nonce = h.nonce().await;
    let body = client.jws(&nonce, "/acme/new-order", Some(&json!({ "identifiers": [] })), false);
    let reply = h.send(Method::POST, "/acme/order/elsewhere", body).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.problem().kind(), "unauthorized");
}

#[tokio::test]
async fn test_http01_issuance_and_revocation() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let (order_path, challenge_path, token) = order_for(&h, &client, "svc.local").await;
    h.responder
        .serve("svc.local", &token, format!("{}\n", client.key_authorization(&token)));

    let reply = client.post(&h, &challenge_path, Some(json!({}))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["status"], "valid");
    assert!(reply.header("link").contains("rel=\"up\""));
    assert_eq!(
        h.responder.fetched.lock().unwrap().as_slice(),
        [format!("http://svc.local/.well-known/acme-challenge/{token}")]
    );

    let order = client.post(&h, &order_path, None).await.json();
    assert_eq!(order["status"], "ready");

    let cert_key = KeyAlgorithm::EcP256.generate().unwrap();
    let csr = URL_SAFE_NO_PAD.encode(csr_der(&cert_key, "svc.local", &["svc.local"]));
    let finalize_path = path_of(order["finalize"].as_str().unwrap());
    let reply = client.post(&h, &finalize_path, Some(json!({ "csr": csr }))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let order = reply.json();
    assert_eq!(order["status"], "valid");

    let cert_path = path_of(order["certificate"].as_str().unwrap());
    let reply = client.post(&h, &cert_path, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["content-type"], "application/pem-certificate-chain");
    let chain = X509::stack_from_pem(&reply.body).unwrap();
    assert_eq!(chain.len(), 2);
    let leaf = &chain[0];
    assert!(leaf.public_key().unwrap().public_eq(&cert_key));
    assert!(leaf.verify(&chain[1].public_key().unwrap()).unwrap());

    // plain GET serves the same chain
    let reply = h.send(Method::GET, &cert_path, Vec::new()).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(X509::stack_from_pem(&reply.body).unwrap().len(), 2);

    // the order cannot be finalized twice
    let reply = client.post(&h, &finalize_path, Some(json!({ "csr": csr }))).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.problem().kind(), "orderNotReady");

    let der = URL_SAFE_NO_PAD.encode(leaf.to_der().unwrap());
    let reply = client
        .post(&h, "/acme/revoke-cert", Some(json!({ "certificate": der })))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(h.pki.get_info("svc.local").unwrap().revoked);
    let crl = X509Crl::from_der(&fs::read(h.root.join("ca/ca.crl")).unwrap()).unwrap();
    assert_eq!(crl.get_revoked().map(|r| r.len()), Some(1));

    let reply = client
        .post(&h, "/acme/revoke-cert", Some(json!({ "certificate": der })))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().kind(), "alreadyRevoked");
}

#[tokio::test]
async fn test_failed_challenge_invalidates_order() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let (order_path, challenge_path, token) = order_for(&h, &client, "down.local").await;
    h.responder.serve("down.local", &token, "wrong".to_string());

    let reply = client.post(&h, &challenge_path, Some(json!({}))).await;
    assert_eq!(reply.status, StatusCode::OK);
    let challenge = reply.json();
    assert_eq!(challenge["status"], "invalid");
    assert_eq!(challenge["error"]["type"], "urn:ietf:params:acme:error:unauthorized");

    let order = client.post(&h, &order_path, None).await.json();
    assert_eq!(order["status"], "invalid");

    // terminal: asking again does not revalidate
    h.responder
        .serve("down.local", &token, client.key_authorization(&token));
    let reply = client.post(&h, &challenge_path, Some(json!({}))).await;
    assert_eq!(reply.json()["status"], "invalid");
    assert_eq!(h.responder.fetched.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_csr_must_match_identifiers() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let (order_path, challenge_path, token) = order_for(&h, &client, "svc.local").await;
    h.responder
        .serve("svc.local", &token, client.key_authorization(&token));
    client.post(&h, &challenge_path, Some(json!({}))).await;

    let cert_key = KeyAlgorithm::EcP256.generate().unwrap();
    let csr = URL_SAFE_NO_PAD.encode(csr_der(&cert_key, "svc.local", &["svc.local", "extra.local"]));
    let finalize_path = order_path.replace("/acme/order/", "/acme/finalize/");
    let reply = client.post(&h, &finalize_path, Some(json!({ "csr": csr }))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().kind(), "badCSR");

    let order = client.post(&h, &order_path, None).await.json();
    assert_eq!(order["status"], "invalid");
    assert!(h.pki.get_info("svc.local").is_err());
}

#[tokio::test]
async fn test_identifier_policy() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let reply = client
        .post(&h, "/acme/new-order", Some(json!({ "identifiers": [{ "type": "dns", "value": "*.svc.local" }] })))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().kind(), "rejectedIdentifier");

    let reply = client
        .post(&h, "/acme/new-order", Some(json!({ "identifiers": [{ "type": "ip", "value": "10.0.0.1" }] })))
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().kind(), "unsupportedIdentifier");

    let reply = client
        .post(&h, "/acme/new-order", Some(json!({ "identifiers": [
            { "type": "dns", "value": "Svc.Local" },
            { "type": "dns", "value": "svc.local" }
        ] })))
        .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    let order = reply.json();
    assert_eq!(order["identifiers"].as_array().unwrap().len(), 1);
    assert_eq!(order["identifiers"][0]["value"], "svc.local");
}

#[tokio::test]
async fn test_resources_belong_to_their_account() {
    let h = Harness::new();
    let mut owner = Client::new();
    owner.register(&h).await;
    let mut other = Client::new();
    other.register(&h).await;

    let (order_path, _, _) = order_for(&h, &owner, "svc.local").await;
    let reply = other.post(&h, &order_path, None).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.problem().kind(), "unauthorized");

    let reply = other.post(&h, "/acme/order/does-not-exist", None).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deactivated_account_is_refused() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;
    let account_path = path_of(client.kid.as_deref().unwrap());

    let reply = client.post(&h, &account_path, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["status"], "valid");

    let reply = client
        .post(&h, &account_path, Some(json!({ "status": "deactivated" })))
        .await;
    assert_eq!(reply.json()["status"], "deactivated");

    let reply = client
        .post(&h, "/acme/new-order", Some(json!({ "identifiers": [{ "type": "dns", "value": "svc.local" }] })))
        .await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.problem().kind(), "unauthorized");
}

#[tokio::test]
async fn test_key_change_is_refused() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;
    let reply = client.post(&h, "/acme/key-change", Some(json!({}))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().detail, "key rollover is not supported");
}

#[tokio::test]
async fn test_reregistering_returns_the_existing_account() {
    let h = Harness::new();
    let mut client = Client::new();
    let created = client.register(&h).await;
    assert_eq!(created.status, StatusCode::CREATED);
    let location = created.header("location");

    let again = client.register(&h).await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.header("location"), location);
    assert_eq!(again.json()["status"], "valid");
    assert_eq!(fs::read_dir(h.root.join("acme/accounts")).unwrap().count(), 1);
}

#[tokio::test]
async fn test_deactivated_account_is_refused_when_signing_with_its_key() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;
    let account_path = path_of(client.kid.as_deref().unwrap());
    let reply = client
        .post(&h, &account_path, Some(json!({ "status": "deactivated" })))
        .await;
    assert_eq!(reply.json()["status"], "deactivated");

    let nonce = h.nonce().await;
    let payload = json!({ "identifiers": [{ "type": "dns", "value": "svc.local" }] });
    let body = client.jws(&nonce, "/acme/new-order", Some(&payload), true);
    let reply = h.send(Method::POST, "/acme/new-order", body).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.problem().kind(), "unauthorized");

    // the key cannot come back through new-account either
    let reply = client.register(&h).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.problem().kind(), "unauthorized");
    assert!(h.service.store().orders.is_empty());
}

#[tokio::test]
async fn test_reissue_revokes_the_superseded_certificate() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let first = issue(&h, &client, "svc.local").await;
    let second = issue(&h, &client, "svc.local").await;
    assert_ne!(serial_of(&first), serial_of(&second));

    assert_eq!(crl_serials(&h), [serial_of(&first)]);
    let index = fs::read_to_string(h.root.join("ca/crl/index.txt")).unwrap();
    assert!(index.contains(",superseded"), "{index}");
    assert!(!h.pki.get_info("svc.local").unwrap().revoked);

    let reply = revoke(&h, &client, &first).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().kind(), "alreadyRevoked");

    let reply = revoke(&h, &client, &second).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(h.pki.get_info("svc.local").unwrap().revoked);
    assert_eq!(crl_serials(&h).len(), 2);
}

#[tokio::test]
async fn test_serial_replaced_by_renewal_can_be_revoked() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let original = issue(&h, &client, "svc.local").await;
    let renewed = h.pki.renew("svc.local", &Actor::system()).unwrap();
    assert_ne!(renewed.serial, serial_of(&original));
    assert!(crl_serials(&h).is_empty());

    let reply = revoke(&h, &client, &original).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(crl_serials(&h), [serial_of(&original)]);
    // the renewed certificate stays in service
    assert!(!h.pki.get_info("svc.local").unwrap().revoked);

    let reply = revoke(&h, &client, &original).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.problem().kind(), "alreadyRevoked");
}

#[tokio::test]
async fn test_new_nonce_burst_limit() {
    let h = Harness::with_config(AcmeSettings::default(), RateLimits::default());
    for _ in 0..20 {
        let reply = h.send(Method::HEAD, "/acme/new-nonce", Vec::new()).await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);
    }
    let reply = h.send(Method::HEAD, "/acme/new-nonce", Vec::new()).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(reply.problem().kind(), "rateLimited");
}

#[tokio::test]
async fn test_expired_order_cannot_be_validated() {
    let settings = AcmeSettings {
        order_ttl_hours: 0,
        ..AcmeSettings::default()
    };
    let h = Harness::with_config(
        settings,
        RateLimits {
            hourly_limit: 10_000,
            burst_limit: 10_000,
        },
    );
    let mut client = Client::new();
    client.register(&h).await;

    let (order_path, challenge_path, token) = order_for(&h, &client, "svc.local").await;
    h.responder
        .serve("svc.local", &token, client.key_authorization(&token));
    let reply = client.post(&h, &challenge_path, Some(json!({}))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    let problem = reply.problem();
    assert_eq!(problem.kind(), "malformed");
    assert!(problem.detail.contains("expired"), "{}", problem.detail);
    assert!(h.responder.fetched.lock().unwrap().is_empty());

    let order = client.post(&h, &order_path, None).await.json();
    assert_eq!(order["status"], "invalid");
    let authz_path = path_of(order["authorizations"][0].as_str().unwrap());
    let authz = client.post(&h, &authz_path, None).await.json();
    assert_eq!(authz["status"], "expired");
}

#[tokio::test]
async fn test_expired_order_cannot_be_finalized() {
    let h = Harness::new();
    let mut client = Client::new();
    client.register(&h).await;

    let order_path = prove_control(&h, &client, "svc.local").await;
    let order_id = order_path.rsplit('/').next().unwrap().to_string();
    h.service
        .store()
        .update_order(&order_id, |o| {
            o.expires = Utc::now() - chrono::Duration::minutes(1);
            Ok(())
        })
        .unwrap();

    let cert_key = KeyAlgorithm::EcP256.generate().unwrap();
    let csr = URL_SAFE_NO_PAD.encode(csr_der(&cert_key, "svc.local", &["svc.local"]));
    let finalize_path = order_path.replace("/acme/order/", "/acme/finalize/");
    let reply = client.post(&h, &finalize_path, Some(json!({ "csr": csr }))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(reply.problem().detail.contains("expired"));

    let order = client.post(&h, &order_path, None).await.json();
    assert_eq!(order["status"], "invalid");
    assert!(h.pki.get_info("svc.local").is_err());
}
