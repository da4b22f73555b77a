//! Request rate limiting
//!
//! Each bucket (`ip:<addr>` or `account:<id>`) keeps the instants of its
//! accepted requests. A request is accepted only if fewer than
//! `hourly_limit` were accepted in the past hour and fewer than
//! `burst_limit` in the past minute. Rejected requests are not recorded.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

const HOUR: Duration = Duration::from_secs(3600);
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub hourly_limit: usize,
    pub burst_limit: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            hourly_limit: 100,
            burst_limit: 20,
        }
    }
}

pub struct RateLimiter {
    limits: RateLimits,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn ip_key(ip: &str) -> String {
        format!("ip:{ip}")
    }

    pub fn account_key(id: &str) -> String {
        format!("account:{id}")
    }

    /// Charge one request to `key`
    ///
    /// # Errors
    /// [`Error::RateLimited`] when either window is full.
    pub fn check(&self, key: &str) -> Result<()> {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let log = buckets.entry(key.to_string()).or_default();
        while log
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
        {
            log.pop_front();
        }
        let last_minute = log
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < MINUTE)
            .count();
        if log.len() >= self.limits.hourly_limit || last_minute >= self.limits.burst_limit {
            debug!(bucket = key, hourly = log.len(), minute = last_minute, "rate limit exceeded");
            return Err(Error::RateLimited);
        }
        log.push_back(now);
        Ok(())
    }

    /// Drop buckets with no request in the past hour
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, log| {
            log.back()
                .is_some_and(|t| now.saturating_duration_since(*t) < HOUR)
        });
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
