//! Commit-reveal randomness driver.
//!
//! Once per [`REVEAL_INTERVAL`] the driver either tops up the pool of
//! committed secrets (when at most [`COMMIT_THRESHOLD`] remain unconsumed)
//! or reveals the oldest committed secret.

use std::time::{Duration, Instant};

use ethers::types::H256;
use ethers::utils::keccak256;
use rand::RngCore;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::{COMMIT_THRESHOLD, DIGEST_BATCH_SIZE, REVEAL_INTERVAL};
use crate::db;
use crate::errors::{OracleError, Result};
use crate::rpc::OracleContract;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleAction {
    /// Interval not yet elapsed.
    Skipped,
    /// Number of new digests committed.
    Committed(usize),
    /// Id of the revealed secret.
    Revealed(i64),
}

#[derive(Debug)]
pub struct OracleDriver {
    last_reveal: Instant,
    reveal_interval: Duration,
    commit_threshold: i64,
    digest_batch_size: usize,
}

impl OracleDriver {
    /// The gate starts closed: the first action happens one interval after start.
    pub fn new(now: Instant) -> Self {
        Self {
            last_reveal: now,
            reveal_interval: REVEAL_INTERVAL,
            commit_threshold: COMMIT_THRESHOLD,
            digest_batch_size: DIGEST_BATCH_SIZE,
        }
    }

    pub fn last_reveal(&self) -> Instant {
        self.last_reveal
    }

    pub async fn tick(
        &mut self,
        pool: &SqlitePool,
        contract: &dyn OracleContract,
        now: Instant,
    ) -> Result<OracleAction> {
        if now.saturating_duration_since(self.last_reveal) < self.reveal_interval {
            debug!("Skip reveal and commit");
            return Ok(OracleAction::Skipped);
        }

        let remaining = db::count_unconsumed_digests(pool).await?;
        if remaining <= self.commit_threshold {
            let committed = commit(pool, contract, self.digest_batch_size).await?;
            Ok(OracleAction::Committed(committed))
        } else {
            let revealed = reveal(pool, contract).await?;
            self.last_reveal = now;
            Ok(OracleAction::Revealed(revealed))
        }
    }
}

/// Fresh 32-byte secret and its `keccak256` commitment.
pub fn new_secret() -> (H256, H256) {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    (H256::from(secret), H256::from(keccak256(secret)))
}

/// Commit `count` new digests on-chain, then store their secrets as unconsumed.
async fn commit(pool: &SqlitePool, contract: &dyn OracleContract, count: usize) -> Result<usize> {
    let secrets: Vec<(H256, H256)> = (0..count).map(|_| new_secret()).collect();
    let digests: Vec<H256> = secrets.iter().map(|(_, digest)| *digest).collect();

    let tx_hash = contract.commit(&digests).await?;

    let mut tx = pool.begin().await?;
    for (secret, digest) in &secrets {
        db::insert_digest(&mut *tx, &format!("{secret:?}"), &format!("{digest:?}")).await?;
    }
    tx.commit().await?;

    info!("Committed {count} digests, tx: {tx_hash}");
    Ok(count)
}

/// Reveal the oldest committed secret and consume it.
async fn reveal(pool: &SqlitePool, contract: &dyn OracleContract) -> Result<i64> {
    let digest = db::oldest_unconsumed_digest(pool)
        .await?
        .ok_or_else(|| OracleError::Integrity("no committed secret to reveal".to_string()))?;
    let secret: H256 = digest
        .secret
        .parse()
        .map_err(|_| OracleError::Decode(format!("stored secret #{} is not 32 bytes", digest.id)))?;

    let tx_hash = contract.reveal(secret).await?;
    db::mark_digest_consumed(pool, digest.id).await?;

    info!("Revealed secret #{} ({}), tx: {tx_hash}", digest.id, digest.digest);
    Ok(digest.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_pool;
    use crate::rpc::tests::{ContractCall, MockContract};

    async fn fill_pool(pool: &SqlitePool, count: usize) {
        for _ in 0..count {
            let (secret, digest) = new_secret();
            db::insert_digest(pool, &format!("{secret:?}"), &format!("{digest:?}"))
                .await
                .unwrap();
        }
    }

    fn after_interval(start: Instant) -> Instant {
        start + REVEAL_INTERVAL + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn closed_gate_skips() {
        let pool = test_pool().await;
        let contract = MockContract::new();
        let start = Instant::now();
        let mut driver = OracleDriver::new(start);

        let action = driver
            .tick(&pool, &contract, start + Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(action, OracleAction::Skipped);
        assert!(contract.calls().is_empty());
    }

    #[tokio::test]
    async fn reveals_when_pool_above_threshold() {
        let pool = test_pool().await;
        fill_pool(&pool, 11).await;
        let contract = MockContract::new();
        let start = Instant::now();
        let mut driver = OracleDriver::new(start);
        let now = after_interval(start);

        let action = driver.tick(&pool, &contract, now).await.unwrap();
        assert!(matches!(action, OracleAction::Revealed(_)));
        assert_eq!(db::count_unconsumed_digests(&pool).await.unwrap(), 10);
        assert_eq!(driver.last_reveal(), now);
        assert!(matches!(contract.calls()[..], [ContractCall::Reveal(_)]));
    }

    #[tokio::test]
    async fn commits_when_pool_at_or_below_threshold() {
        let pool = test_pool().await;
        fill_pool(&pool, 9).await;
        let contract = MockContract::new();
        let start = Instant::now();
        let mut driver = OracleDriver::new(start);

        let action = driver
            .tick(&pool, &contract, after_interval(start))
            .await
            .unwrap();
        assert_eq!(action, OracleAction::Committed(20));
        assert_eq!(contract.calls(), vec![ContractCall::Commit(20)]);
        assert_eq!(db::count_unconsumed_digests(&pool).await.unwrap(), 29);
        // Commit leaves the gate open so the next cycle can reveal.
        assert_eq!(driver.last_reveal(), start);
    }

    #[tokio::test]
    async fn failed_commit_stores_nothing() {
        let pool = test_pool().await;
        let contract = MockContract::new();
        contract.set_fail(true);
        let start = Instant::now();
        let mut driver = OracleDriver::new(start);

        assert!(driver
            .tick(&pool, &contract, after_interval(start))
            .await
            .is_err());
        assert_eq!(db::count_unconsumed_digests(&pool).await.unwrap(), 0);
    }

    #[test]
    fn secret_matches_its_digest() {
        let (secret, digest) = new_secret();
        assert_eq!(H256::from(keccak256(secret.as_bytes())), digest);
    }
}
