use crate::acme::routes::with_security_headers;
use crate::configs::ServerConfig;
use crate::storage::Paths;
use anyhow::{anyhow, Context, Result};
use axum::{routing::get, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Public downloads: `/ca.pem`, `/ca.crl` and `/health`
pub fn public_router(paths: &Paths) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route_service("/ca.pem", ServeFile::new(paths.public_ca_cert()))
        .route_service("/ca.crl", ServeFile::new(paths.public_crl()))
        .layer(TraceLayer::new_for_http());
    with_security_headers(router)
}

/// Certificate and key served on the HTTPS listener
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| anyhow!("Invalid listen address {}:{}: {}", host, port, e))
}

/// Run the ACME, HTTP and optional HTTPS listeners until `cancel` fires
///
/// In-flight requests get `shutdown_grace_secs` to finish once the token is
/// cancelled.
pub async fn serve(
    config: &ServerConfig,
    acme: Router,
    public: Router,
    tls: Option<TlsFiles>,
    cancel: CancellationToken,
) -> Result<()> {
    let handle = Handle::new();
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            info!(grace_secs = grace.as_secs(), "shutting down listeners");
            handle.graceful_shutdown(Some(grace));
        });
    }

    let acme_addr = socket_addr(&config.host, config.acme_port)?;
    let http_addr = socket_addr(&config.host, config.http_port)?;
    info!(address = %acme_addr, "ACME listener starting");
    info!(address = %http_addr, "HTTP listener starting");

    let acme_server = axum_server::bind(acme_addr)
        .handle(handle.clone())
        .serve(acme.into_make_service_with_connect_info::<SocketAddr>());
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(public.clone().into_make_service_with_connect_info::<SocketAddr>());

    match tls {
        Some(files) => {
            let rustls = RustlsConfig::from_pem_file(&files.cert, &files.key)
                .await
                .with_context(|| {
                    format!(
                        "Failed to load TLS certificate {} / {}",
                        files.cert.display(),
                        files.key.display()
                    )
                })?;
            let https_addr = socket_addr(&config.host, config.https_port)?;
            info!(address = %https_addr, cert = %files.cert.display(), "HTTPS listener starting");
            let https_server = axum_server::bind_rustls(https_addr, rustls)
                .handle(handle)
                .serve(public.into_make_service_with_connect_info::<SocketAddr>());
            tokio::try_join!(acme_server, http_server, https_server)
                .context("listener failed")?;
        }
        None => {
            tokio::try_join!(acme_server, http_server).context("listener failed")?;
        }
    }
    info!("listeners stopped");
    Ok(())
}
