//! ACME HTTP surface
//!
//! Every response carries a fresh `Replay-Nonce` and the security headers;
//! every request is charged to the caller's IP bucket before routing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::problem::Problem;
use super::service::{AcmeReply, AcmeResult, AcmeService, ReplyBody};
use crate::audit::Actor;
use crate::rate_limit::RateLimiter;

pub const REPLAY_NONCE: &str = "replay-nonce";
const PEM_CHAIN_CONTENT_TYPE: &str = "application/pem-certificate-chain";

impl IntoResponse for AcmeReply {
    fn into_response(self) -> Response {
        let mut response = match self.body {
            ReplyBody::Json(value) => (self.status, axum::Json(value)).into_response(),
            ReplyBody::PemChain(pem) => (
                self.status,
                [(header::CONTENT_TYPE, PEM_CHAIN_CONTENT_TYPE)],
                pem,
            )
                .into_response(),
            ReplyBody::Empty => self.status.into_response(),
        };
        let headers = response.headers_mut();
        if let Some(location) = self.location.and_then(|l| HeaderValue::from_str(&l).ok()) {
            headers.insert(header::LOCATION, location);
        }
        if let Some(up) = self
            .up
            .and_then(|u| HeaderValue::from_str(&format!("<{u}>;rel=\"up\"")).ok())
        {
            headers.append(header::LINK, up);
        }
        response
    }
}

/// Client address: first `X-Forwarded-For` hop, else the peer
fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match forwarded {
        Some(ip) => Some(ip.to_string()),
        None => extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string()),
    }
}

pub struct Client(pub Actor);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Client {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Client(Actor::new(
            client_ip(&parts.headers, &parts.extensions),
            user_agent,
        )))
    }
}

async fn rate_limit(State(acme): State<Arc<AcmeService>>, request: Request, next: Next) -> Response {
    let ip = client_ip(request.headers(), request.extensions()).unwrap_or_else(|| "unknown".into());
    if acme.limiter().check(&RateLimiter::ip_key(&ip)).is_err() {
        debug!(ip = %ip, "request rejected by IP rate limit");
        return Problem::rate_limited().into_response();
    }
    next.run(request).await
}

async fn replay_nonce(State(acme): State<Arc<AcmeService>>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    match acme.issue_nonce() {
        Ok(nonce) => {
            if let Ok(value) = HeaderValue::from_str(&nonce) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REPLAY_NONCE), value);
            }
        }
        Err(e) => tracing::error!(error = %e.detail, "failed to issue nonce"),
    }
    response
}

/// Add the security headers to every response of `router`
pub fn with_security_headers(router: Router) -> Router {
    router
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'none'"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ))
}

async fn directory(State(acme): State<Arc<AcmeService>>) -> AcmeResult {
    acme.directory()
}

async fn new_nonce() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, [(header::CACHE_CONTROL, "no-store")])
}

async fn new_account(State(acme): State<Arc<AcmeService>>, Client(actor): Client, body: Bytes) -> AcmeResult {
    acme.new_account(&body, &actor)
}

async fn account(
    State(acme): State<Arc<AcmeService>>,
    Path(id): Path<String>,
    Client(actor): Client,
    body: Bytes,
) -> AcmeResult {
    acme.account(&id, &body, &actor)
}

async fn key_change(State(acme): State<Arc<AcmeService>>, body: Bytes) -> AcmeResult {
    acme.key_change(&body)
}

async fn new_order(State(acme): State<Arc<AcmeService>>, Client(actor): Client, body: Bytes) -> AcmeResult {
    acme.new_order(&body, &actor)
}

async fn order(State(acme): State<Arc<AcmeService>>, Path(id): Path<String>, body: Bytes) -> AcmeResult {
    acme.order(&id, &body)
}

async fn authorization(
    State(acme): State<Arc<AcmeService>>,
    Path(id): Path<String>,
    body: Bytes,
) -> AcmeResult {
    acme.authorization(&id, &body)
}

async fn challenge(
    State(acme): State<Arc<AcmeService>>,
    Path(id): Path<String>,
    Client(actor): Client,
    body: Bytes,
) -> AcmeResult {
    acme.challenge(&id, &body, &actor).await
}

async fn finalize(
    State(acme): State<Arc<AcmeService>>,
    Path(id): Path<String>,
    Client(actor): Client,
    body: Bytes,
) -> AcmeResult {
    acme.finalize(&id, &body, &actor).await
}

async fn certificate_post(
    State(acme): State<Arc<AcmeService>>,
    Path(id): Path<String>,
    body: Bytes,
) -> AcmeResult {
    acme.certificate(&id, Some(&body))
}

async fn certificate_get(State(acme): State<Arc<AcmeService>>, Path(id): Path<String>) -> AcmeResult {
    acme.certificate(&id, None)
}

async fn revoke_cert(State(acme): State<Arc<AcmeService>>, Client(actor): Client, body: Bytes) -> AcmeResult {
    acme.revoke_cert(&body, &actor).await
}

async fn not_found() -> Problem {
    Problem::not_found("no such ACME resource")
}

/// The `/acme/*` router
pub fn router(acme: Arc<AcmeService>) -> Router {
    let routes = Router::new()
        .route("/acme/directory", get(directory))
        .route("/acme/new-nonce", get(new_nonce))
        .route("/acme/new-account", post(new_account))
        .route("/acme/account/:id", post(account))
        .route("/acme/key-change", post(key_change))
        .route("/acme/new-order", post(new_order))
        .route("/acme/order/:id", post(order))
        .route("/acme/authz/:id", post(authorization))
        .route("/acme/challenge/:id", post(challenge))
        .route("/acme/finalize/:id", post(finalize))
        .route("/acme/certificate/:id", post(certificate_post).get(certificate_get))
        .route("/acme/revoke-cert", post(revoke_cert))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(acme.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(acme.clone(), replay_nonce))
        .layer(TraceLayer::new_for_http())
        .with_state(acme);
    with_security_headers(routes)
}
