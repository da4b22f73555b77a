//! Replay nonces
//!
//! A nonce is valid once: consuming it removes it from the live map under
//! the same lock acquisition that checks it.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::keys;

const NONCE_BYTES: usize = 16;

pub struct NonceStore {
    ttl: Duration,
    nonces: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NonceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a nonce valid for the configured TTL
    pub fn issue(&self) -> Result<String> {
        self.issue_at(Utc::now())
    }

    fn issue_at(&self, now: DateTime<Utc>) -> Result<String> {
        let nonce = keys::random_token(NONCE_BYTES)?;
        self.nonces.lock().insert(nonce.clone(), now + self.ttl);
        Ok(nonce)
    }

    /// True iff `nonce` was live and unexpired; it is removed either way
    pub fn consume(&self, nonce: &str) -> bool {
        self.consume_at(nonce, Utc::now())
    }

    pub fn consume_at(&self, nonce: &str, now: DateTime<Utc>) -> bool {
        match self.nonces.lock().remove(nonce) {
            Some(expires) => now < expires,
            None => false,
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut nonces = self.nonces.lock();
        let before = nonces.len();
        nonces.retain(|_, expires| *expires > now);
        before - nonces.len()
    }

    pub fn len(&self) -> usize {
        self.nonces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
