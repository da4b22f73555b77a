//! ACME records, their state machines and the JSON documents sent to clients
//!
//! Records reference each other by id only (order → authorizations →
//! challenges); relationships are resolved through the store at query time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use openssl::pkey::{PKey, Public};
use serde::{Deserialize, Serialize};

use super::jws::Jwk;
use super::problem::Problem;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Invalid)
                | (Ready, Processing)
                | (Ready, Invalid)
                | (Processing, Valid)
                | (Processing, Invalid)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    pub fn can_transition_to(self, next: AuthorizationStatus) -> bool {
        use AuthorizationStatus::*;
        matches!(
            (self, next),
            (Pending, Valid)
                | (Pending, Invalid)
                | (Pending, Expired)
                | (Pending, Deactivated)
                | (Valid, Revoked)
                | (Valid, Deactivated)
                | (Valid, Expired)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    pub fn can_transition_to(self, next: ChallengeStatus) -> bool {
        use ChallengeStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Valid) | (Processing, Invalid)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".into(),
            value: value.into(),
        }
    }
}

/// Refuse a state change the machine does not allow
pub fn ensure_transition(allowed: bool, what: &str, from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Result<()> {
    if allowed {
        Ok(())
    } else {
        Err(Error::ConflictingState(format!(
            "{what} cannot move from {from:?} to {to:?}"
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    /// PKIX DER of the account key, standard base64
    pub key_der: String,
    /// SHA-256 (hex) of the PKIX DER; the account's identity
    pub key_hash: String,
    pub jwk: Jwk,
    #[serde(default)]
    pub contact: Vec<String>,
    pub status: AccountStatus,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn public_key(&self) -> Result<PKey<Public>> {
        let der = STANDARD
            .decode(&self.key_der)
            .map_err(|e| Error::Fatal(anyhow::anyhow!("account {} key: {}", self.id, e)))?;
        Ok(PKey::public_key_from_der(&der)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub status: OrderStatus,
    pub expires: DateTime<Utc>,
    pub identifiers: Vec<Identifier>,
    /// Authorization ids, one per identifier
    pub authorizations: Vec<String>,
    pub finalize_url: String,
    #[serde(default)]
    pub certificate_url: Option<String>,
    #[serde(default)]
    pub not_before: Option<String>,
    #[serde(default)]
    pub not_after: Option<String>,
    /// DER CSR, standard base64
    #[serde(default)]
    pub csr: Option<String>,
    #[serde(default)]
    pub certificate_name: Option<String>,
    #[serde(default)]
    pub certificate_serial: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn transition(&mut self, next: OrderStatus) -> Result<()> {
        ensure_transition(self.status.can_transition_to(next), "order", self.status, next)?;
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Authorization {
    pub id: String,
    pub order_id: String,
    pub account_id: String,
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires: DateTime<Utc>,
    pub challenges: Vec<String>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    pub fn transition(&mut self, next: AuthorizationStatus) -> Result<()> {
        ensure_transition(self.status.can_transition_to(next), "authorization", self.status, next)?;
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Challenge {
    pub id: String,
    pub authorization_id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub status: ChallengeStatus,
    pub token: String,
    pub key_authorization: String,
    #[serde(default)]
    pub validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<Problem>,
}

impl Challenge {
    pub fn transition(&mut self, next: ChallengeStatus) -> Result<()> {
        ensure_transition(self.status.can_transition_to(next), "challenge", self.status, next)?;
        self.status = next;
        Ok(())
    }
}

/// Absolute URLs of every ACME resource
#[derive(Debug, Clone)]
pub struct Urls {
    base: String,
}

impl Urls {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn join(&self, path: &str) -> String {
        format!("{}/acme/{}", self.base, path)
    }

    pub fn directory(&self) -> String {
        self.join("directory")
    }

    pub fn new_nonce(&self) -> String {
        self.join("new-nonce")
    }

    pub fn new_account(&self) -> String {
        self.join("new-account")
    }

    pub fn new_order(&self) -> String {
        self.join("new-order")
    }

    pub fn revoke_cert(&self) -> String {
        self.join("revoke-cert")
    }

    pub fn key_change(&self) -> String {
        self.join("key-change")
    }

    pub fn account(&self, id: &str) -> String {
        self.join(&format!("account/{id}"))
    }

    pub fn order(&self, id: &str) -> String {
        self.join(&format!("order/{id}"))
    }

    pub fn authz(&self, id: &str) -> String {
        self.join(&format!("authz/{id}"))
    }

    pub fn challenge(&self, id: &str) -> String {
        self.join(&format!("challenge/{id}"))
    }

    pub fn finalize(&self, id: &str) -> String {
        self.join(&format!("finalize/{id}"))
    }

    pub fn certificate(&self, id: &str) -> String {
        self.join(&format!("certificate/{id}"))
    }

    /// Account id named by a `kid` URL
    pub fn account_id_from_kid<'a>(&self, kid: &'a str) -> Option<&'a str> {
        let prefix = self.join("account/");
        kid.strip_prefix(prefix.as_str())
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub caa_identities: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryDocument {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,
    pub key_change: String,
    pub meta: DirectoryMeta,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDocument {
    pub status: AccountStatus,
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    pub orders: String,
    pub created_at: String,
}

impl AccountDocument {
    pub fn new(account: &Account, urls: &Urls) -> Self {
        Self {
            status: account.status,
            contact: account.contact.clone(),
            terms_of_service_agreed: account.terms_of_service_agreed,
            orders: format!("{}/orders", urls.account(&account.id)),
            created_at: rfc3339(&account.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDocument {
    pub status: OrderStatus,
    pub expires: String,
    pub identifiers: Vec<Identifier>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl OrderDocument {
    pub fn new(order: &Order, urls: &Urls) -> Self {
        Self {
            status: order.status,
            expires: rfc3339(&order.expires),
            identifiers: order.identifiers.clone(),
            authorizations: order.authorizations.iter().map(|id| urls.authz(id)).collect(),
            finalize: order.finalize_url.clone(),
            certificate: order.certificate_url.clone(),
            not_before: order.not_before.clone(),
            not_after: order.not_after.clone(),
            error: order.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeDocument {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    pub url: String,
    pub status: ChallengeStatus,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl ChallengeDocument {
    pub fn new(challenge: &Challenge, urls: &Urls) -> Self {
        Self {
            kind: challenge.kind,
            url: urls.challenge(&challenge.id),
            status: challenge.status,
            token: challenge.token.clone(),
            validated: challenge.validated.as_ref().map(rfc3339),
            error: challenge.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationDocument {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires: String,
    pub challenges: Vec<ChallengeDocument>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub wildcard: bool,
}

impl AuthorizationDocument {
    pub fn new(authz: &Authorization, challenges: &[Challenge], urls: &Urls) -> Self {
        Self {
            identifier: authz.identifier.clone(),
            status: authz.status,
            expires: rfc3339(&authz.expires),
            challenges: challenges
                .iter()
                .map(|c| ChallengeDocument::new(c, urls))
                .collect(),
            wildcard: authz.wildcard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_terminal_states_never_move() {
        use OrderStatus::*;
        for terminal in [Valid, Invalid] {
            assert!(terminal.is_terminal());
            for next in [Pending, Ready, Processing, Valid, Invalid] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Pending.can_transition_to(Ready));
        assert!(!Pending.can_transition_to(Valid));
        assert!(Ready.can_transition_to(Processing));
    }

    #[test]
    fn test_challenge_transitions() {
        use ChallengeStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Valid));
        assert!(Processing.can_transition_to(Invalid));
        assert!(!Valid.can_transition_to(Processing));
    }

    #[test]
    fn test_kid_parsing() {
        let urls = Urls::new("https://ca.local:8555/");
        assert_eq!(urls.account("abc"), "https://ca.local:8555/acme/account/abc");
        assert_eq!(
            urls.account_id_from_kid("https://ca.local:8555/acme/account/abc"),
            Some("abc")
        );
        assert_eq!(urls.account_id_from_kid("https://other/acme/account/abc"), None);
        assert_eq!(urls.account_id_from_kid("https://ca.local:8555/acme/account/"), None);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(OrderStatus::Processing).unwrap(), "processing");
        assert_eq!(serde_json::to_value(ChallengeType::Http01).unwrap(), "http-01");
    }
}
