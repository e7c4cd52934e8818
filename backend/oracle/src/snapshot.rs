//! Immutable per-run view of the watched chain: its configuration plus the
//! token and wallet watch-lists keyed by lower-cased address.

use std::collections::HashMap;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db;
use crate::errors::{OracleError, Result};
use crate::events::{ChainConfig, TokenKind, WatchPurpose, WatchedToken, WatchedWallet};

#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub chain: ChainConfig,
    tokens: HashMap<String, WatchedToken>,
    wallets: HashMap<String, WatchedWallet>,
}

impl ChainSnapshot {
    /// Load the chain row and its watch-lists. A missing chain is fatal.
    pub async fn load(pool: &SqlitePool, chain_record_id: i64) -> Result<Self> {
        let chain = db::get_chain(pool, chain_record_id).await?.ok_or_else(|| {
            OracleError::Config(format!(
                "Unable to load blockchain data, blockchain id: {chain_record_id}"
            ))
        })?;
        info!("Loading blockchain data: {} ({})", chain.name, chain.chain_id);

        let mut tokens = Vec::new();
        for row in db::get_tokens(pool, chain.id).await? {
            match TokenKind::from_code(row.kind) {
                Some(kind) => tokens.push(WatchedToken {
                    id: row.id,
                    name: row.name,
                    address: row.address,
                    kind,
                }),
                None => warn!("Ignoring token {} with unknown kind {}", row.address, row.kind),
            }
        }

        let mut wallets = Vec::new();
        for row in db::get_watching(pool, chain.id).await? {
            match WatchPurpose::from_name(&row.purpose) {
                Some(purpose) => wallets.push(WatchedWallet {
                    name: row.name,
                    address: row.address,
                    purpose,
                }),
                None => warn!("Ignoring wallet {} with purpose {}", row.address, row.purpose),
            }
        }

        let snapshot = Self::new(chain, tokens, wallets);
        for token in snapshot.tokens.values() {
            info!(
                "Start watching {} ({}) tokens on {}",
                token.name, token.address, snapshot.chain.name
            );
        }
        for wallet in snapshot.wallets.values() {
            info!(
                "Start watching {} ({}) address on {}",
                wallet.name, wallet.address, snapshot.chain.name
            );
        }
        Ok(snapshot)
    }

    pub fn new(chain: ChainConfig, tokens: Vec<WatchedToken>, wallets: Vec<WatchedWallet>) -> Self {
        Self {
            chain,
            tokens: tokens
                .into_iter()
                .map(|t| (t.address.to_lowercase(), t))
                .collect(),
            wallets: wallets
                .into_iter()
                .map(|w| (w.address.to_lowercase(), w))
                .collect(),
        }
    }

    pub fn token(&self, address: &str) -> Option<&WatchedToken> {
        self.tokens.get(&address.to_lowercase())
    }

    pub fn wallet(&self, address: &str) -> Option<&WatchedWallet> {
        self.wallets.get(&address.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{seed_chain, test_pool};

    #[tokio::test]
    async fn load_keys_by_lowercase_address() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        sqlx::query(
            "INSERT INTO watching (blockchain_id, name, address, purpose) \
             VALUES (1, 'treasury', '0x00000000000000000000000000000000000000DD', 'donation'), \
                    (1, 'broken', '0x00000000000000000000000000000000000000EE', 'unknown')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let snapshot = ChainSnapshot::load(&pool, 1).await.unwrap();
        assert_eq!(snapshot.chain.chain_id, 56);
        let token = snapshot
            .token("0x00000000000000000000000000000000000000AA")
            .unwrap();
        assert_eq!(token.kind, TokenKind::Fungible);
        let wallet = snapshot
            .wallet("0x00000000000000000000000000000000000000dd")
            .unwrap();
        assert_eq!(wallet.purpose, WatchPurpose::Donation);
        assert!(snapshot
            .wallet("0x00000000000000000000000000000000000000ee")
            .is_none());
    }

    #[tokio::test]
    async fn missing_chain_is_a_config_error() {
        let pool = test_pool().await;
        let result = ChainSnapshot::load(&pool, 42).await;
        assert!(matches!(result, Err(OracleError::Config(_))));
    }
}
