//! ACME request handling
//!
//! Every POST goes through [`AcmeService::authenticate`]: parse the JWS,
//! consume its nonce, check its URL, resolve the key (inline `jwk` or the
//! account named by `kid`), verify the signature and charge the account's
//! rate bucket. Handlers then run the order / authorization / challenge
//! state machines against [`AcmeStore`]. No store lock is held across the
//! HTTP-01 fetch or certificate signing.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::StatusCode;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{Duration, Utc};
use openssl::x509::X509;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::http01::ChallengeValidator;
use super::jws::{self, JwsRequest, Verified};
use super::nonce::NonceStore;
use super::problem::Problem;
use super::store::AcmeStore;
use super::types::{
    Account, AccountDocument, AccountStatus, Authorization, AuthorizationDocument,
    AuthorizationStatus, Challenge, ChallengeDocument, ChallengeStatus, ChallengeType,
    DirectoryDocument, DirectoryMeta, Identifier, Order, OrderDocument, OrderStatus, Urls,
};
use crate::audit::{Actor, AuditEvent, AuditSink};
use crate::configs::AcmeSettings;
use crate::error::Error;
use crate::generate_leaf_cert::is_dns_name;
use crate::issuance::CertificateService;
use crate::keys;
use crate::rate_limit::RateLimiter;
use crate::storage::SafeName;

const ID_BYTES: usize = 16;
const TOKEN_BYTES: usize = 32;

pub type AcmeResult<T = AcmeReply> = Result<T, Problem>;

pub enum ReplyBody {
    Json(Value),
    PemChain(Vec<u8>),
    Empty,
}

/// A successful ACME response before the transport adds headers
pub struct AcmeReply {
    pub status: StatusCode,
    pub location: Option<String>,
    /// `Link: <..>;rel="up"`
    pub up: Option<String>,
    pub body: ReplyBody,
}

impl AcmeReply {
    fn json(status: StatusCode, body: impl serde::Serialize) -> AcmeResult {
        let value = serde_json::to_value(body).map_err(|e| Problem::from(Error::from(e)))?;
        Ok(Self {
            status,
            location: None,
            up: None,
            body: ReplyBody::Json(value),
        })
    }

    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            location: None,
            up: None,
            body: ReplyBody::Empty,
        }
    }

    fn with_location(mut self, location: String) -> Self {
        self.location = Some(location);
        self
    }

    fn with_up(mut self, up: String) -> Self {
        self.up = Some(up);
        self
    }
}

/// A verified request and the account it resolved to
struct Authenticated {
    verified: Verified,
    account: Option<Account>,
}

impl Authenticated {
    fn require_account(&self) -> AcmeResult<&Account> {
        self.account
            .as_ref()
            .ok_or_else(|| Problem::malformed("this request must be signed with the account kid"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAccountPayload {
    #[serde(default)]
    contact: Vec<String>,
    #[serde(default)]
    terms_of_service_agreed: bool,
    #[serde(default)]
    only_return_existing: bool,
}

#[derive(Debug, Default, Deserialize)]
struct AccountUpdatePayload {
    #[serde(default)]
    status: Option<AccountStatus>,
    #[serde(default)]
    contact: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderPayload {
    identifiers: Vec<Identifier>,
    #[serde(default)]
    not_before: Option<String>,
    #[serde(default)]
    not_after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinalizePayload {
    csr: String,
}

#[derive(Debug, Deserialize)]
struct RevokePayload {
    certificate: String,
    #[serde(default)]
    reason: Option<u8>,
}

pub struct AcmeService {
    urls: Urls,
    settings: AcmeSettings,
    store: AcmeStore,
    nonces: NonceStore,
    limiter: Arc<RateLimiter>,
    pki: Arc<dyn CertificateService>,
    validator: Arc<dyn ChallengeValidator>,
    audit: Arc<dyn AuditSink>,
}

fn new_id() -> AcmeResult<String> {
    keys::random_token(ID_BYTES).map_err(|e| Problem::from(Error::from(e)))
}

/// Wire name of a status enum, e.g. `deactivated`
fn status_name(status: &impl serde::Serialize) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn validate_contacts(contact: &[String]) -> AcmeResult<()> {
    for c in contact {
        let Some(address) = c.strip_prefix("mailto:") else {
            return Err(Problem::malformed(format!("unsupported contact {c:?}")));
        };
        if !address.contains('@') || address.contains(',') {
            return Err(Problem::malformed(format!("invalid contact {c:?}")));
        }
    }
    Ok(())
}

/// Accounts that are no longer valid may not act, whichever way they sign
fn active(account: Account) -> AcmeResult<Account> {
    if account.status != AccountStatus::Valid {
        return Err(Problem::unauthorized(format!(
            "account is {}",
            status_name(&account.status)
        )));
    }
    Ok(account)
}

impl AcmeService {
    pub fn new(
        settings: AcmeSettings,
        store: AcmeStore,
        limiter: Arc<RateLimiter>,
        pki: Arc<dyn CertificateService>,
        validator: Arc<dyn ChallengeValidator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            urls: Urls::new(&settings.base_url),
            nonces: NonceStore::new(Duration::seconds(settings.nonce_ttl_secs)),
            settings,
            store,
            limiter,
            pki,
            validator,
            audit,
        }
    }

    pub fn urls(&self) -> &Urls {
        &self.urls
    }

    pub fn store(&self) -> &AcmeStore {
        &self.store
    }

    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fresh value for the `Replay-Nonce` header
    pub fn issue_nonce(&self) -> AcmeResult<String> {
        self.nonces.issue().map_err(Problem::from)
    }

    pub fn directory(&self) -> AcmeResult {
        AcmeReply::json(
            StatusCode::OK,
            DirectoryDocument {
                new_nonce: self.urls.new_nonce(),
                new_account: self.urls.new_account(),
                new_order: self.urls.new_order(),
                revoke_cert: self.urls.revoke_cert(),
                key_change: self.urls.key_change(),
                meta: DirectoryMeta {
                    terms_of_service: self.settings.terms_of_service.clone(),
                    website: self.settings.website.clone(),
                    caa_identities: self.settings.caa_identities.clone(),
                },
            },
        )
    }

    fn audit(&self, event: AuditEvent, actor: &Actor) {
        self.audit.record(event.actor(actor.clone()));
    }

    fn lookup_kid(&self, kid: &str) -> Option<openssl::pkey::PKey<openssl::pkey::Public>> {
        let id = self.urls.account_id_from_kid(kid)?;
        self.store.accounts.get(id)?.public_key().ok()
    }

    fn authenticate(&self, body: &[u8], url: &str) -> AcmeResult<Authenticated> {
        let request = JwsRequest::parse(body)?;
        let nonce = request.header.nonce.clone().ok_or_else(Problem::bad_nonce)?;
        if !self.nonces.consume(&nonce) {
            return Err(Problem::bad_nonce());
        }
        let verified = request.verify(None, Some(url), |kid| self.lookup_kid(kid))?;

        let account = match &verified.header.kid {
            Some(kid) => {
                let id = self
                    .urls
                    .account_id_from_kid(kid)
                    .ok_or_else(Problem::account_does_not_exist)?;
                let account = self.store.accounts.require(id).map_err(|_| Problem::account_does_not_exist())?;
                Some(active(account)?)
            }
            None => {
                let hash = keys::key_hash(&verified.key).map_err(|e| Problem::from(Error::from(e)))?;
                self.store.account_by_key_hash(&hash).map(active).transpose()?
            }
        };
        if let Some(account) = &account {
            self.limiter
                .check(&RateLimiter::account_key(&account.id))
                .map_err(Problem::from)?;
        }
        Ok(Authenticated { verified, account })
    }

    /// The authenticated account must own `owner_id`
    fn require_owner<'a>(&self, auth: &'a Authenticated, owner_id: &str) -> AcmeResult<&'a Account> {
        let account = auth.require_account()?;
        if account.id != owner_id {
            return Err(Problem::unauthorized("resource belongs to another account"));
        }
        Ok(account)
    }

    pub fn new_account(&self, body: &[u8], actor: &Actor) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.new_account())?;
        let Some(jwk) = auth.verified.header.jwk.clone() else {
            return Err(Problem::malformed("new-account must carry a jwk, not a kid"));
        };
        let payload: NewAccountPayload = auth.verified.payload_json()?;

        if let Some(existing) = &auth.account {
            return Ok(AcmeReply::json(StatusCode::OK, AccountDocument::new(existing, &self.urls))?
                .with_location(self.urls.account(&existing.id)));
        }
        if payload.only_return_existing {
            return Err(Problem::account_does_not_exist());
        }
        validate_contacts(&payload.contact)?;
        if self.settings.terms_of_service.is_some() && !payload.terms_of_service_agreed {
            return Err(Problem::malformed("terms of service must be agreed to"));
        }

        let key_der = auth
            .verified
            .key
            .public_key_to_der()
            .map_err(|e| Problem::from(Error::from(e)))?;
        let account = Account {
            id: new_id()?,
            key_hash: keys::key_hash(&auth.verified.key).map_err(|e| Problem::from(Error::from(e)))?,
            key_der: STANDARD.encode(key_der),
            jwk,
            contact: payload.contact,
            status: AccountStatus::Valid,
            terms_of_service_agreed: payload.terms_of_service_agreed,
            created_at: Utc::now(),
        };
        self.store.insert_account(account.clone())?;
        info!(account = %account.id, "ACME account created");
        self.audit(AuditEvent::new("create", "acme_account", account.id.clone()), actor);

        Ok(AcmeReply::json(StatusCode::CREATED, AccountDocument::new(&account, &self.urls))?
            .with_location(self.urls.account(&account.id)))
    }

    /// View the account, update contacts or deactivate it
    pub fn account(&self, id: &str, body: &[u8], actor: &Actor) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.account(id))?;
        let account = self.require_owner(&auth, id)?;
        if auth.verified.is_post_as_get() {
            return AcmeReply::json(StatusCode::OK, AccountDocument::new(account, &self.urls));
        }
        let payload: AccountUpdatePayload = auth.verified.payload_json()?;
        if let Some(contact) = &payload.contact {
            validate_contacts(contact)?;
        }
        let deactivate = match payload.status {
            None => false,
            Some(AccountStatus::Deactivated) => true,
            Some(other) => {
                return Err(Problem::malformed(format!(
                    "account status cannot be set to {}",
                    status_name(&other)
                )))
            }
        };
        let (updated, _) = self.store.update_account(id, |a| {
            if let Some(contact) = payload.contact {
                a.contact = contact;
            }
            if deactivate {
                a.status = AccountStatus::Deactivated;
            }
            Ok(())
        })?;
        if deactivate {
            info!(account = %id, "ACME account deactivated");
            self.audit(AuditEvent::new("deactivate", "acme_account", id), actor);
        }
        AcmeReply::json(StatusCode::OK, AccountDocument::new(&updated, &self.urls))
    }

    pub fn key_change(&self, _body: &[u8]) -> AcmeResult {
        Err(Problem::malformed("key rollover is not supported"))
    }

    fn check_identifiers(identifiers: Vec<Identifier>) -> AcmeResult<Vec<Identifier>> {
        if identifiers.is_empty() {
            return Err(Problem::malformed("order has no identifiers"));
        }
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for identifier in identifiers {
            if identifier.kind != "dns" {
                return Err(Problem::unsupported_identifier(format!(
                    "identifier type {:?} is not supported",
                    identifier.kind
                )));
            }
            let value = identifier.value.trim().trim_end_matches('.').to_ascii_lowercase();
            if value.starts_with("*.") {
                return Err(Problem::rejected_identifier(
                    "wildcard identifiers need dns-01, which is not offered",
                ));
            }
            if !is_dns_name(&value) || SafeName::certificate(&value).is_err() {
                return Err(Problem::rejected_identifier(format!("invalid DNS name {value:?}")));
            }
            if seen.insert(value.clone()) {
                out.push(Identifier::dns(value));
            }
        }
        Ok(out)
    }

    pub fn new_order(&self, body: &[u8], actor: &Actor) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.new_order())?;
        let account = auth.require_account()?;
        let payload: NewOrderPayload = auth.verified.payload_json()?;
        let identifiers = Self::check_identifiers(payload.identifiers)?;

        let now = Utc::now();
        let expires = now + Duration::hours(self.settings.order_ttl_hours);
        let order_id = new_id()?;
        let mut authz_ids = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            let authz_id = new_id()?;
            let challenge_id = new_id()?;
            let token = keys::random_token(TOKEN_BYTES).map_err(|e| Problem::from(Error::from(e)))?;
            let key_authorization = jws::key_authorization(&token, &account.jwk)?;
            self.store.insert_authorization(Authorization {
                id: authz_id.clone(),
                order_id: order_id.clone(),
                account_id: account.id.clone(),
                identifier: identifier.clone(),
                status: AuthorizationStatus::Pending,
                expires,
                challenges: vec![challenge_id.clone()],
                wildcard: false,
            })?;
            self.store.insert_challenge(Challenge {
                id: challenge_id,
                authorization_id: authz_id.clone(),
                account_id: account.id.clone(),
                kind: ChallengeType::Http01,
                status: ChallengeStatus::Pending,
                token,
                key_authorization,
                validated: None,
                error: None,
            })?;
            authz_ids.push(authz_id);
        }

        let order = Order {
            id: order_id.clone(),
            account_id: account.id.clone(),
            status: OrderStatus::Pending,
            expires,
            identifiers,
            authorizations: authz_ids,
            finalize_url: self.urls.finalize(&order_id),
            certificate_url: None,
            not_before: payload.not_before,
            not_after: payload.not_after,
            csr: None,
            certificate_name: None,
            certificate_serial: None,
            error: None,
            created_at: now,
        };
        self.store.insert_order(order.clone())?;
        info!(order = %order.id, account = %account.id, identifiers = order.identifiers.len(), "ACME order created");
        self.audit(
            AuditEvent::new("create", "acme_order", order.id.clone())
                .field("account", account.id.clone())
                .field(
                    "identifiers",
                    order.identifiers.iter().map(|i| i.value.clone()).collect::<Vec<_>>(),
                ),
            actor,
        );
        Ok(AcmeReply::json(StatusCode::CREATED, OrderDocument::new(&order, &self.urls))?
            .with_location(self.urls.order(&order.id)))
    }

    pub fn order(&self, id: &str, body: &[u8]) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.order(id))?;
        let order = self.store.orders.require(id)?;
        self.require_owner(&auth, &order.account_id)?;
        AcmeReply::json(StatusCode::OK, OrderDocument::new(&order, &self.urls))
    }

    pub fn authorization(&self, id: &str, body: &[u8]) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.authz(id))?;
        let authz = self.store.authorizations.require(id)?;
        self.require_owner(&auth, &authz.account_id)?;
        let challenges = self.store.challenges_of(&authz);
        AcmeReply::json(
            StatusCode::OK,
            AuthorizationDocument::new(&authz, &challenges, &self.urls),
        )
    }

    /// Run HTTP-01 validation for a pending challenge
    ///
    /// POST-as-GET, or a challenge that is no longer pending, returns the
    /// challenge as it stands.
    pub async fn challenge(&self, id: &str, body: &[u8], actor: &Actor) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.challenge(id))?;
        let current = self.store.challenges.require(id)?;
        self.require_owner(&auth, &current.account_id)?;
        let authz = self.store.authorizations.require(&current.authorization_id)?;
        if authz.status == AuthorizationStatus::Pending {
            let order = self.store.orders.require(&authz.order_id)?;
            let now = Utc::now();
            if authz.expires <= now || order.expires <= now {
                return Err(self.expire_order(&order));
            }
        }

        let respond_only = auth.verified.is_post_as_get()
            || current.status != ChallengeStatus::Pending
            || authz.status != AuthorizationStatus::Pending;
        if respond_only {
            return Ok(AcmeReply::json(StatusCode::OK, ChallengeDocument::new(&current, &self.urls))?
                .with_up(self.urls.authz(&authz.id)));
        }
        let (challenge, _) = self
            .store
            .update_challenge(id, |c| c.transition(ChallengeStatus::Processing))?;

        let outcome = self
            .validator
            .validate(&authz.identifier.value, &challenge.token, &challenge.key_authorization)
            .await;

        let challenge = match outcome {
            Ok(()) => self.challenge_succeeded(&challenge, &authz, actor)?,
            Err(reason) => self.challenge_failed(&challenge, &authz, reason, actor)?,
        };
        Ok(AcmeReply::json(StatusCode::OK, ChallengeDocument::new(&challenge, &self.urls))?
            .with_up(self.urls.authz(&authz.id)))
    }

    fn challenge_succeeded(&self, challenge: &Challenge, authz: &Authorization, actor: &Actor) -> AcmeResult<Challenge> {
        let (challenge, _) = self.store.update_challenge(&challenge.id, |c| {
            c.transition(ChallengeStatus::Valid)?;
            c.validated = Some(Utc::now());
            Ok(())
        })?;
        self.store
            .update_authorization(&authz.id, |a| a.transition(AuthorizationStatus::Valid))?;

        let order = self.store.orders.require(&authz.order_id)?;
        let all_valid = order.authorizations.iter().all(|id| {
            self.store
                .authorizations
                .get(id)
                .is_some_and(|a| a.status == AuthorizationStatus::Valid)
        });
        if all_valid {
            let (order, moved) = self.store.update_order(&order.id, |o| {
                if o.status == OrderStatus::Pending {
                    o.transition(OrderStatus::Ready)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            if moved {
                info!(order = %order.id, "ACME order ready");
            }
        }
        info!(challenge = %challenge.id, domain = %authz.identifier.value, "HTTP-01 challenge valid");
        self.audit(
            AuditEvent::new("validate", "acme_challenge", challenge.id.clone())
                .field("domain", authz.identifier.value.clone()),
            actor,
        );
        Ok(challenge)
    }

    fn challenge_failed(
        &self,
        challenge: &Challenge,
        authz: &Authorization,
        reason: String,
        actor: &Actor,
    ) -> AcmeResult<Challenge> {
        warn!(challenge = %challenge.id, domain = %authz.identifier.value, reason = %reason, "HTTP-01 challenge failed");
        let problem = Problem::challenge_failed(reason.clone());
        let (challenge, _) = self.store.update_challenge(&challenge.id, |c| {
            c.transition(ChallengeStatus::Invalid)?;
            c.error = Some(problem.clone());
            Ok(())
        })?;
        // the HTTP-01 challenge is the only one offered, so nothing else can succeed
        self.store
            .update_authorization(&authz.id, |a| a.transition(AuthorizationStatus::Invalid))?;
        self.store.update_order(&authz.order_id, |o| {
            if !o.status.is_terminal() {
                o.transition(OrderStatus::Invalid)?;
                o.error = Some(problem.clone());
            }
            Ok(())
        })?;
        self.audit(
            AuditEvent::new("validate", "acme_challenge", challenge.id.clone())
                .field("domain", authz.identifier.value.clone())
                .failed(&reason),
            actor,
        );
        Ok(challenge)
    }

    fn invalidate_order(&self, order_id: &str, problem: &Problem) {
        let result = self.store.update_order(order_id, |o| {
            if !o.status.is_terminal() {
                o.transition(OrderStatus::Invalid)?;
                o.error = Some(problem.clone());
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(order = %order_id, error = %e, "failed to invalidate order");
        }
    }

    /// Invalidate an order past its expiry and expire its open authorizations
    fn expire_order(&self, order: &Order) -> Problem {
        info!(order = %order.id, expires = %order.expires, "ACME order expired");
        let problem = Problem::malformed(format!("order expired at {}", order.expires.to_rfc3339()));
        for authz_id in &order.authorizations {
            let result = self.store.update_authorization(authz_id, |a| {
                if matches!(a.status, AuthorizationStatus::Pending | AuthorizationStatus::Valid) {
                    a.transition(AuthorizationStatus::Expired)?;
                }
                Ok(())
            });
            if let Err(e) = result {
                warn!(authz = %authz_id, error = %e, "failed to expire authorization");
            }
        }
        self.invalidate_order(&order.id, &problem);
        problem
    }

    /// Check the CSR against the order and issue the certificate
    pub async fn finalize(&self, id: &str, body: &[u8], actor: &Actor) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.finalize(id))?;
        let order = self.store.orders.require(id)?;
        self.require_owner(&auth, &order.account_id)?;
        if matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) && order.expires <= Utc::now() {
            return Err(self.expire_order(&order));
        }
        if order.status != OrderStatus::Ready {
            return Err(Problem::order_not_ready(format!(
                "order is {}",
                status_name(&order.status)
            )));
        }
        let payload: FinalizePayload = auth.verified.payload_json()?;

        let csr_der = URL_SAFE_NO_PAD
            .decode(payload.csr.trim_end_matches('='))
            .map_err(|_| Problem::bad_csr("csr is not base64url"))?;
        let csr = match keys::parse_csr(&csr_der) {
            Ok(csr) => csr,
            Err(e) => {
                let problem = Problem::bad_csr(format!("{e:#}"));
                self.invalidate_order(id, &problem);
                return Err(problem);
            }
        };
        let wanted: BTreeSet<String> = order.identifiers.iter().map(|i| i.value.clone()).collect();
        if csr.names() != wanted {
            let problem = Problem::bad_csr(format!(
                "CSR names {:?} do not match the order identifiers {:?}",
                csr.names(),
                wanted
            ));
            self.invalidate_order(id, &problem);
            return Err(problem);
        }

        let encoded_csr = STANDARD.encode(&csr_der);
        self.store.update_order(id, |o| {
            o.transition(OrderStatus::Processing)?;
            o.csr = Some(encoded_csr);
            Ok(())
        })?;

        let name = order
            .identifiers
            .first()
            .map(|i| i.value.clone())
            .ok_or_else(|| Problem::malformed("order has no identifiers"))?;
        let pki = self.pki.clone();
        let signer_actor = actor.clone();
        let signing_name = name.clone();
        let issued = tokio::task::spawn_blocking(move || pki.sign_csr(&signing_name, &csr, &signer_actor))
            .await
            .map_err(|e| Error::Fatal(anyhow::anyhow!("signing task failed: {e}")))
            .and_then(|r| r);

        let record = match issued {
            Ok(record) => record,
            Err(e) => {
                let problem = Problem::from(e);
                self.invalidate_order(id, &problem);
                return Err(problem);
            }
        };
        let certificate_url = self.urls.certificate(id);
        let (order, _) = self.store.update_order(id, |o| {
            o.transition(OrderStatus::Valid)?;
            o.certificate_url = Some(certificate_url);
            o.certificate_name = Some(record.name.clone());
            o.certificate_serial = Some(record.serial.clone());
            Ok(())
        })?;
        info!(order = %id, name = %name, serial = %record.serial, "ACME order finalized");
        self.audit(
            AuditEvent::new("finalize", "acme_order", id)
                .field("name", name)
                .field("serial", record.serial.clone()),
            actor,
        );
        Ok(AcmeReply::json(StatusCode::OK, OrderDocument::new(&order, &self.urls))?
            .with_location(self.urls.order(id)))
    }

    /// PEM chain of a finalized order; `body` is `None` for plain GET
    pub fn certificate(&self, id: &str, body: Option<&[u8]>) -> AcmeResult {
        let order = match body {
            Some(body) => {
                let auth = self.authenticate(body, &self.urls.certificate(id))?;
                let order = self.store.orders.require(id)?;
                self.require_owner(&auth, &order.account_id)?;
                order
            }
            None => self.store.orders.require(id)?,
        };
        let (Some(name), Some(serial)) = (&order.certificate_name, &order.certificate_serial) else {
            return Err(Problem::not_found("order has no certificate"));
        };
        let current = self.pki.get_info(name)?;
        if &current.serial != serial {
            return Err(Problem::not_found("certificate was replaced by a newer order"));
        }
        let chain = self.pki.certificate_chain_pem(name)?;
        Ok(AcmeReply {
            status: StatusCode::OK,
            location: None,
            up: None,
            body: ReplyBody::PemChain(chain),
        })
    }

    /// Revoke by certificate DER; the signer must own the issuing account or
    /// the certificate key
    pub async fn revoke_cert(&self, body: &[u8], actor: &Actor) -> AcmeResult {
        let auth = self.authenticate(body, &self.urls.revoke_cert())?;
        let payload: RevokePayload = auth.verified.payload_json()?;
        let der = URL_SAFE_NO_PAD
            .decode(payload.certificate.trim_end_matches('='))
            .map_err(|_| Problem::malformed("certificate is not base64url"))?;
        let cert = X509::from_der(&der).map_err(|_| Problem::malformed("certificate is not valid DER"))?;
        let serial = keys::serial_hex(&cert).map_err(|e| Problem::from(Error::from(e)))?;

        let record = self
            .pki
            .find_by_serial(&serial)?
            .ok_or_else(|| Problem::not_found("certificate was not issued by this CA"))?;
        // an older serial of the same name is revoked on its own, without
        // touching the current certificate
        let current = record.serial == serial;
        let revoked = if current {
            record.revoked
        } else {
            self.pki.is_serial_revoked(&serial)?
        };
        if revoked {
            return Err(Problem::already_revoked());
        }

        let cert_key = cert
            .public_key()
            .and_then(|k| k.public_key_to_der())
            .map_err(|e| Problem::from(Error::from(e)))?;
        let signer_key = auth
            .verified
            .key
            .public_key_to_der()
            .map_err(|e| Problem::from(Error::from(e)))?;
        let holds_key = cert_key == signer_key;
        let owns_order = auth.account.as_ref().is_some_and(|account| {
            self.store
                .orders
                .find(|o| o.account_id == account.id && o.certificate_serial.as_deref() == Some(serial.as_str()))
                .is_some()
        });
        if !holds_key && !owns_order {
            return Err(Problem::unauthorized(
                "requester neither owns the order nor holds the certificate key",
            ));
        }

        let pki = self.pki.clone();
        let name = record.name.clone();
        let revoke_actor = actor.clone();
        tokio::task::spawn_blocking(move || {
            if current {
                pki.revoke(&name, &revoke_actor).map(|_| ())
            } else {
                pki.revoke_retired(&name, &cert, &revoke_actor)
            }
        })
        .await
        .map_err(|e| Error::Fatal(anyhow::anyhow!("revocation task failed: {e}")))
        .and_then(|r| r)
        .map_err(|e| match e {
            Error::ConflictingState(_) => Problem::already_revoked(),
            other => Problem::from(other),
        })?;
        info!(name = %record.name, serial = %serial, reason = ?payload.reason, "certificate revoked through ACME");
        Ok(AcmeReply::empty(StatusCode::OK))
    }
}
