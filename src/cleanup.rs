//! Periodic maintenance sweeps
//!
//! One background task runs every sweep kind in turn on a fixed interval,
//! so no kind ever overlaps itself. Each sweep takes the same lock as the
//! request path for its component and only for as long as it scans.
//!
//! Sweeps:
//! 1. expired replay nonces
//! 2. idle rate-limit buckets
//! 3. admin session files idle for more than 8 hours
//! 4. expired ACME orders and authorizations
//! 5. cache warm-up (purges expired entries, reloads hot keys)
//! 6. CRL re-signing once the published CRL is a day old

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acme::AcmeService;
use crate::error::Result;
use crate::issuance::PkiEngine;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub session_ttl: Duration,
    /// Re-sign the CRL when the published copy is older than this
    pub crl_refresh_age: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            session_ttl: Duration::from_secs(8 * 3600),
            crl_refresh_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Totals of one pass over every sweep kind
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub nonces: usize,
    pub rate_buckets: usize,
    pub sessions: usize,
    pub orders: usize,
    pub authorizations: usize,
    pub challenges: usize,
    pub cache_entries: usize,
    pub crl_refreshed: bool,
}

pub struct Sweeper {
    acme: Arc<AcmeService>,
    pki: Arc<PkiEngine>,
    config: CleanupConfig,
}

impl Sweeper {
    pub fn new(acme: Arc<AcmeService>, pki: Arc<PkiEngine>, config: CleanupConfig) -> Self {
        Self { acme, pki, config }
    }

    /// Remove session files whose last activity is older than the TTL
    pub fn sweep_sessions(&self, now: SystemTime) -> Result<usize> {
        let dir = self.pki.storage().paths().sessions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let idle = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if idle > self.config.session_ttl {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove session"),
                }
            }
        }
        Ok(removed)
    }

    /// Re-sign the CRL if it is missing or older than the refresh age
    pub fn refresh_crl(&self) -> Result<bool> {
        if !self.pki.ca().exists() {
            return Ok(false);
        }
        let stale = self
            .pki
            .revocations()
            .crl_age()
            .map_or(true, |age| age > self.config.crl_refresh_age);
        if !stale {
            return Ok(false);
        }
        let signer = self.pki.ca().signer()?;
        self.pki.revocations().refresh(&signer)?;
        Ok(true)
    }

    /// Run every sweep once; a failing sweep does not stop the others
    pub fn run_once(&self) -> SweepReport {
        let mut report = SweepReport {
            nonces: self.acme.nonces().purge_expired(),
            rate_buckets: self.acme.limiter().purge_expired(),
            ..SweepReport::default()
        };

        match self.sweep_sessions(SystemTime::now()) {
            Ok(n) => report.sessions = n,
            Err(e) => warn!(error = %e, "session sweep failed"),
        }

        let expired = self.acme.store().delete_expired(Utc::now());
        report.orders = expired.orders;
        report.authorizations = expired.authorizations;
        report.challenges = expired.challenges;

        match self.pki.storage().warm_cache() {
            Ok(n) => report.cache_entries = n,
            Err(e) => warn!(error = %e, "cache warm-up failed"),
        }

        match self.refresh_crl() {
            Ok(refreshed) => report.crl_refreshed = refreshed,
            Err(e) => warn!(error = %e, "CRL refresh failed"),
        }
        report
    }
}

/// Start the sweep loop; it stops when `cancel` fires
pub fn spawn_cleanup_task(sweeper: Arc<Sweeper>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweeper.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = sweeper.config.interval.as_secs(), "cleanup task started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cleanup task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let worker = sweeper.clone();
                    match tokio::task::spawn_blocking(move || worker.run_once()).await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(?report, "cleanup sweep completed");
                        }
                        Ok(_) => debug!("cleanup sweep: nothing to do"),
                        Err(e) => warn!(error = %e, "cleanup sweep panicked"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::http01::Http01Validator;
    use crate::acme::AcmeStore;
    use crate::audit::AuditLog;
    use crate::ca_manager::CaConfig;
    use crate::configs::AcmeSettings;
    use crate::rate_limit::RateLimiter;
    use crate::storage::Storage;
    use secrecy::SecretString;
    use tempfile::TempDir;

    fn sweeper(dir: &TempDir) -> Sweeper {
        let audit = Arc::new(AuditLog::tracing_only());
        let storage = Arc::new(Storage::files_only(dir.path(), audit.clone()).unwrap());
        let pki = Arc::new(PkiEngine::new(storage.clone()));
        let acme = AcmeService::new(
            AcmeSettings::default(),
            AcmeStore::open(storage).unwrap(),
            Arc::new(RateLimiter::default()),
            pki.clone(),
            Arc::new(Http01Validator::default()),
            audit,
        );
        Sweeper::new(Arc::new(acme), pki, CleanupConfig::default())
    }

    #[test]
    fn test_default_config() {
        let config = CleanupConfig::default();
        assert_eq!(config.interval, Duration::from_secs(600));
        assert_eq!(config.session_ttl, Duration::from_secs(28_800));
    }

    #[test]
    fn test_idle_sessions_are_removed() {
        let dir = TempDir::new().unwrap();
        let sweeper = sweeper(&dir);
        let sessions = dir.path().join("sessions");
        fs::create_dir_all(&sessions).unwrap();
        fs::write(sessions.join("tok1"), b"{}").unwrap();

        assert_eq!(sweeper.sweep_sessions(SystemTime::now()).unwrap(), 0);
        let later = SystemTime::now() + Duration::from_secs(9 * 3600);
        assert_eq!(sweeper.sweep_sessions(later).unwrap(), 1);
        assert!(!sessions.join("tok1").exists());
    }

    #[test]
    fn test_crl_refresh_needs_a_ca() {
        let dir = TempDir::new().unwrap();
        let sweeper = sweeper(&dir);
        assert!(!sweeper.refresh_crl().unwrap());

        sweeper
            .pki
            .ca()
            .bootstrap(&CaConfig {
                name: "Test CA".into(),
                organization: "Acme".into(),
                country: "US".into(),
                passphrase: SecretString::new("hunter2".into()),
            })
            .unwrap();
        // bootstrap just published a CRL
        assert!(!sweeper.refresh_crl().unwrap());
        fs::remove_file(dir.path().join("ca/ca.crl")).unwrap();
        assert!(sweeper.refresh_crl().unwrap());
        assert!(dir.path().join("ca/ca.crl").exists());
    }

    #[test]
    fn test_run_once_sweeps_nonces() {
        let dir = TempDir::new().unwrap();
        let sweeper = sweeper(&dir);
        sweeper.acme.issue_nonce().unwrap();
        let report = sweeper.run_once();
        // fresh nonces survive
        assert_eq!(report.nonces, 0);
        assert_eq!(sweeper.acme.nonces().len(), 1);
    }
}
