//! Error kinds shared by every component.
//!
//! Builders and other low-level helpers return `anyhow::Result` and attach
//! context the same way the certificate builders do; component boundaries
//! (CA manager, issuance, storage, ACME) return [`Result`] so callers can
//! branch on the kind. [`Error::status`] is the only place kinds are mapped
//! to HTTP statuses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration at startup
    #[error("configuration error: {0}")]
    Config(String),

    #[error("certificate authority is not initialized")]
    NotInitialized,

    #[error("certificate authority is already initialized")]
    AlreadyInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("validation failed: {0}")]
    Validation(String),

    /// A state machine was asked to leave a terminal state
    #[error("conflicting state: {0}")]
    ConflictingState(String),

    /// Cache or mirror I/O failure; never fatal for the caller
    #[error("transient failure: {0}")]
    Transient(String),

    /// Primary storage or signing failure
    #[error("{0:#}")]
    Fatal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Fatal(anyhow::Error::new(e))
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Fatal(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Fatal(anyhow::Error::new(e))
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Config(_) | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            Error::AlreadyInitialized | Error::ConflictingState(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code carried in admin-style error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::NotInitialized => "not_initialized",
            Error::AlreadyInitialized => "already_initialized",
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::RateLimited => "rate_limited",
            Error::Validation(_) => "validation_error",
            Error::ConflictingState(_) => "conflicting_state",
            Error::Transient(_) => "transient",
            Error::Fatal(_) => "internal_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Error::RateLimited => "Rate limit exceeded".to_string(),
            // Storage internals stay in the logs
            Error::Fatal(e) => {
                tracing::error!(error = %format!("{e:#}"), "request failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "success": false,
            "message": message,
            "data": { "code": self.code() },
        }));
        (status, body).into_response()
    }
}
