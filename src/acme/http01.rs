//! HTTP-01 challenge validation
//!
//! Fetches `http://<domain>/.well-known/acme-challenge/<token>` with a
//! 10 second timeout and no redirects. The name is resolved up front, with
//! up to three attempts, and the client is pinned to the resolved address.
//! At most [`MAX_BODY_BYTES`] of the response are read.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tracing::{debug, warn};

pub const HTTP01_TIMEOUT: Duration = Duration::from_secs(10);
const RESOLVE_ATTEMPTS: usize = 3;
const RESOLVE_BACKOFF: Duration = Duration::from_millis(250);
/// A key authorization is well under 200 bytes
pub const MAX_BODY_BYTES: usize = 4096;

/// Proves control of `domain` by fetching a challenge response
#[async_trait]
pub trait ChallengeValidator: Send + Sync {
    /// `Ok` iff the response matches `expected`; `Err` carries the reason
    async fn validate(&self, domain: &str, token: &str, expected: &str) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct Http01Validator {
    port: u16,
    timeout: Duration,
}

impl Default for Http01Validator {
    fn default() -> Self {
        Self {
            port: 80,
            timeout: HTTP01_TIMEOUT,
        }
    }
}

impl Http01Validator {
    /// Validate against a non-standard port (development setups)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn resolve(&self, domain: &str) -> Result<SocketAddr, String> {
        let mut last_error = String::from("no addresses");
        for attempt in 1..=RESOLVE_ATTEMPTS {
            match tokio::net::lookup_host((domain, self.port)).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        return Ok(addr);
                    }
                }
                Err(e) => last_error = e.to_string(),
            }
            debug!(domain, attempt, error = %last_error, "HTTP-01 resolution failed");
            if attempt < RESOLVE_ATTEMPTS {
                tokio::time::sleep(RESOLVE_BACKOFF).await;
            }
        }
        Err(format!("could not resolve {domain}: {last_error}"))
    }
}

#[async_trait]
impl ChallengeValidator for Http01Validator {
    async fn validate(&self, domain: &str, token: &str, expected: &str) -> Result<(), String> {
        let addr = self.resolve(domain).await?;
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(Policy::none())
            .resolve(domain, addr)
            .build()
            .map_err(|e| format!("HTTP client: {e}"))?;

        let authority = if self.port == 80 {
            domain.to_string()
        } else {
            format!("{domain}:{}", self.port)
        };
        let url = format!("http://{authority}/.well-known/acme-challenge/{token}");
        let mut response = client.get(&url).send().await.map_err(|e| {
            warn!(url = %url, error = %e, "HTTP-01 fetch failed");
            format!("fetching {url}: {e}")
        })?;
        if response.status() != StatusCode::OK {
            return Err(format!("{url} answered {}", response.status()));
        }
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| format!("reading {url}: {e}"))?
        {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(format!("{url} response exceeds {MAX_BODY_BYTES} bytes"));
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body);
        if body.trim_end() != expected {
            return Err(format!("{url} did not return the expected key authorization"));
        }
        Ok(())
    }
}
