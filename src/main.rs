//! PKI Authority - Self-hosted Certificate Authority
//!
//! Loads configuration from `config.toml` / `PKI_CONFIG` and the
//! environment, brings the CA up (bootstrapping it on first start) and
//! serves the ACME endpoint and the public downloads until Ctrl-C or
//! SIGTERM.

use anyhow::{Context, Result};
use pki_authority::app::Application;
use pki_authority::configs::AppConfig;
use pki_authority::logging;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    logging::init(&config.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        storage = %config.storage.path.display(),
        ca = %config.ca.name,
        "starting PKI authority"
    );

    let app = tokio::task::spawn_blocking(move || Application::build(config))
        .await
        .context("Startup task failed")?
        .context("Failed to initialize the certificate authority")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    app.run(cancel).await
}
