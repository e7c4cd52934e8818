//! Per-sender nonce cache guarding nonce-bearing submissions.
//!
//! A submission is only allowed once the sender's on-chain nonce has moved
//! past the last observed value (the previous transaction was mined) or the
//! observation is older than [`SAFE_DURATION`]. The first observation of a
//! sender never allows a submission.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ethers::types::U256;
use tracing::debug;

use crate::config::SAFE_DURATION;
use crate::errors::Result;
use crate::rpc::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedNonce {
    pub nonce: U256,
    pub observed_at: Instant,
}

#[derive(Debug)]
pub struct NonceCache {
    entries: HashMap<String, CachedNonce>,
    safe_duration: Duration,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(SAFE_DURATION)
    }
}

impl NonceCache {
    pub fn new(safe_duration: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            safe_duration,
        }
    }

    pub fn get(&self, sender: &str) -> Option<&CachedNonce> {
        self.entries.get(&sender.to_lowercase())
    }

    pub fn record(&mut self, sender: &str, nonce: U256, now: Instant) {
        self.entries.insert(
            sender.to_lowercase(),
            CachedNonce {
                nonce,
                observed_at: now,
            },
        );
    }

    /// Decide whether `sender` may submit given its latest on-chain nonce.
    /// First sight only records the observation.
    pub fn check(&mut self, sender: &str, latest: U256, now: Instant) -> bool {
        match self.get(sender).copied() {
            None => {
                self.record(sender, latest, now);
                false
            }
            Some(cached) => {
                debug!(
                    "Cached nonce {} of {sender}, observed {:?} ago",
                    cached.nonce,
                    now.saturating_duration_since(cached.observed_at)
                );
                latest > cached.nonce
                    || now.saturating_duration_since(cached.observed_at) > self.safe_duration
            }
        }
    }

    /// Run `action` only when the guard allows it, refreshing the cache after
    /// a successful submission. Returns whether the action ran.
    pub async fn guarded<F, Fut>(&mut self, ledger: &dyn Ledger, sender: &str, action: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let latest = ledger.transaction_count(sender).await?;
        if !self.check(sender, latest, Instant::now()) {
            return Ok(false);
        }
        action().await?;
        self.record(sender, latest, Instant::now());
        Ok(true)
    }
}
