//! Process composition: storage, CA, ACME service, workers and listeners

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acme::{self, AcmeService, AcmeStore, Http01Validator};
use crate::audit::{AuditLog, AuditSink};
use crate::ca_manager::CaConfig;
use crate::cleanup::{spawn_cleanup_task, CleanupConfig, Sweeper};
use crate::configs::AppConfig;
use crate::error::Result;
use crate::issuance::PkiEngine;
use crate::rate_limit::RateLimiter;
use crate::storage::Storage;
use crate::webserver::{self, TlsFiles};

pub struct Application {
    config: AppConfig,
    pki: Arc<PkiEngine>,
    acme: Arc<AcmeService>,
}

impl Application {
    /// Open storage and bring the CA into a usable state
    ///
    /// Bootstraps the CA on first start; afterwards checks the encrypted key
    /// copy against the configured passphrase. Rotates the service
    /// certificate and seeds the email settings.
    pub fn build(config: AppConfig) -> Result<Self> {
        let audit: Arc<dyn AuditSink> = Arc::new(AuditLog::new(config.storage.audit_log_path()));
        let storage = Arc::new(Storage::open(&config.storage, &config.cache, audit.clone())?);
        let pki = Arc::new(PkiEngine::new(storage.clone()));

        let ca_config = CaConfig::from_settings(&config.ca)?;
        if pki.ca().exists() {
            pki.ca().verify_key_copy(&ca_config.passphrase)?;
            info!(name = %config.ca.name, "certificate authority loaded");
        } else {
            pki.ca().bootstrap(&ca_config)?;
        }
        if pki.ca().ensure_service_cert()? {
            info!("service certificate rotated");
        }
        if storage.seed_email_settings(&config.email)? {
            info!("email settings seeded from the environment");
        }
        if let Err(e) = storage.warm_cache() {
            warn!(error = %e, "initial cache warm-up failed");
        }

        let validator = Http01Validator::default().with_port(config.acme.http01_port);
        let acme = Arc::new(AcmeService::new(
            config.acme.clone(),
            AcmeStore::open(storage)?,
            Arc::new(RateLimiter::default()),
            pki.clone(),
            Arc::new(validator),
            audit,
        ));
        Ok(Self { config, pki, acme })
    }

    /// Serve until `cancel` fires, then stop the workers
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let sweeper = Arc::new(Sweeper::new(
            self.acme.clone(),
            self.pki.clone(),
            CleanupConfig {
                interval: Duration::from_secs(self.config.acme.cleanup_interval_secs),
                ..CleanupConfig::default()
            },
        ));
        let cleanup = spawn_cleanup_task(sweeper, cancel.child_token());

        let paths = self.pki.storage().paths();
        let tls = self.config.server.tls_enabled.then(|| TlsFiles {
            cert: paths.service_cert(),
            key: paths.service_key(),
        });
        let result = webserver::serve(
            &self.config.server,
            acme::router(self.acme.clone()),
            webserver::public_router(paths),
            tls,
            cancel.clone(),
        )
        .await;

        cancel.cancel();
        cleanup.await.context("cleanup task failed")?;
        result
    }
}
