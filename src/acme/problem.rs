//! ACME problem documents (RFC 7807 shaped, RFC 8555 error registry)

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::jws::JwsError;
use crate::error::Error;

const ERROR_NS: &str = "urn:ietf:params:acme:error:";
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub detail: String,
    pub status: u16,
}

impl Problem {
    fn new(status: StatusCode, kind: &str, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("{ERROR_NS}{kind}"),
            detail: detail.into(),
            status: status.as_u16(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Error name without the URN prefix, e.g. `badNonce`
    pub fn kind(&self) -> &str {
        self.problem_type
            .strip_prefix(ERROR_NS)
            .unwrap_or(&self.problem_type)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "malformed", detail)
    }

    pub fn bad_nonce() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "badNonce", "Invalid nonce")
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "unauthorized", detail)
    }

    pub fn account_does_not_exist() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "accountDoesNotExist",
            "no account exists for this key",
        )
    }

    pub fn bad_public_key(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "badPublicKey", detail)
    }

    pub fn bad_signature_algorithm(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "badSignatureAlgorithm", detail)
    }

    pub fn rejected_identifier(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "rejectedIdentifier", detail)
    }

    pub fn unsupported_identifier(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unsupportedIdentifier", detail)
    }

    pub fn order_not_ready(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "orderNotReady", detail)
    }

    pub fn bad_csr(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "badCSR", detail)
    }

    pub fn already_revoked() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "alreadyRevoked",
            "certificate is already revoked",
        )
    }

    pub fn rate_limited() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rateLimited", "Rate limit exceeded")
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "malformed", detail)
    }

    /// Recorded on a challenge whose HTTP-01 fetch did not match
    pub fn challenge_failed(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "unauthorized", detail)
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "serverInternal", detail)
    }
}

impl From<Error> for Problem {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(what) => Problem::not_found(format!("{what} not found")),
            Error::Unauthorized(detail) => Problem::unauthorized(detail),
            Error::RateLimited => Problem::rate_limited(),
            Error::Validation(detail) => Problem::malformed(detail),
            Error::ConflictingState(detail) => Problem::malformed(detail),
            Error::NotInitialized => Problem::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "serverInternal",
                "certificate authority is not initialized",
            ),
            Error::Transient(_) => Problem::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "serverInternal",
                "temporarily unavailable",
            ),
            other => {
                tracing::error!(error = %other, "ACME request failed");
                Problem::server_internal("internal error")
            }
        }
    }
}

impl From<JwsError> for Problem {
    fn from(err: JwsError) -> Self {
        match err {
            JwsError::Malformed(detail) => Problem::malformed(detail),
            JwsError::BadNonce => Problem::bad_nonce(),
            JwsError::UrlMismatch => Problem::unauthorized("JWS url does not match the request URL"),
            JwsError::UnsupportedKey(detail) => Problem::bad_public_key(detail),
            JwsError::UnsupportedAlgorithm(detail) => Problem::bad_signature_algorithm(detail),
            JwsError::BadSignature => Problem::unauthorized("JWS signature does not verify"),
            JwsError::AccountNotFound => Problem::account_does_not_exist(),
        }
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)], Json(self)).into_response()
    }
}
