//! Sync window bookkeeping.
//!
//! Each chain owns one `{start, synced, target}` row. `target` trails the
//! chain head by [`SAFE_CONFIRMATIONS`] and is only moved forward when the
//! window is close to exhausted, so head polling stays rare.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::{SAFE_CONFIRMATIONS, SYNC_BATCH_SIZE};
use crate::db;
use crate::errors::Result;
use crate::rpc::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncCursor {
    pub id: i64,
    pub blockchain_id: i64,
    pub start_block: i64,
    pub synced_block: i64,
    pub target_block: i64,
}

impl SyncCursor {
    /// Blocks between the last ingested block and the target.
    pub fn remaining(&self) -> i64 {
        self.target_block - self.synced_block
    }
}

fn safe_head(head: i64) -> i64 {
    (head - SAFE_CONFIRMATIONS).max(0)
}

/// Load the chain's cursor, seeding it at `head - SAFE_CONFIRMATIONS` on first run.
pub async fn ensure_cursor(
    pool: &SqlitePool,
    ledger: &dyn Ledger,
    blockchain_id: i64,
) -> Result<SyncCursor> {
    if let Some(cursor) = db::get_cursor(pool, blockchain_id).await? {
        return Ok(cursor);
    }
    let start = safe_head(ledger.block_number().await?);
    let cursor = db::create_cursor(pool, blockchain_id, start).await?;
    info!("Created sync cursor for chain #{blockchain_id} at block {start}");
    Ok(cursor)
}

/// Repair and extend the window. Returns `true` when the row was rewritten.
pub async fn retarget(
    pool: &SqlitePool,
    ledger: &dyn Ledger,
    cursor: &mut SyncCursor,
) -> Result<bool> {
    let mut changed = false;

    if cursor.start_block > cursor.synced_block {
        warn!(
            "Synced block {} is behind start block {}, resetting",
            cursor.synced_block, cursor.start_block
        );
        cursor.synced_block = cursor.start_block;
        changed = true;
    }

    if cursor.remaining() < SYNC_BATCH_SIZE {
        let candidate = safe_head(ledger.block_number().await?);
        if candidate > cursor.target_block {
            debug!(
                "Retarget {} -> {candidate} (synced {})",
                cursor.target_block, cursor.synced_block
            );
            cursor.target_block = candidate;
            changed = true;
        }
    }

    if cursor.target_block < cursor.synced_block {
        cursor.target_block = cursor.synced_block;
        changed = true;
    }

    if changed {
        db::save_cursor_window(pool, cursor.id, cursor.synced_block, cursor.target_block).await?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{seed_chain, test_pool};
    use crate::rpc::tests::MockLedger;

    #[tokio::test]
    async fn seeds_cursor_behind_head() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        let ledger = MockLedger::new(1000);

        let cursor = ensure_cursor(&pool, &ledger, 1).await.unwrap();
        assert_eq!(
            (cursor.start_block, cursor.synced_block, cursor.target_block),
            (994, 994, 994)
        );

        // A second call loads the existing row even if the head moved.
        ledger.set_head(2000);
        let again = ensure_cursor(&pool, &ledger, 1).await.unwrap();
        assert_eq!(again, cursor);
    }

    #[tokio::test]
    async fn retarget_only_polls_when_window_is_short() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        let ledger = MockLedger::new(1000);
        let mut cursor = ensure_cursor(&pool, &ledger, 1).await.unwrap();

        ledger.set_head(1050);
        assert!(retarget(&pool, &ledger, &mut cursor).await.unwrap());
        assert_eq!(cursor.target_block, 1044);

        // 50 blocks remain: no head poll, target stays put.
        let polls = ledger.head_polls();
        ledger.set_head(5000);
        assert!(!retarget(&pool, &ledger, &mut cursor).await.unwrap());
        assert_eq!(ledger.head_polls(), polls);
        assert_eq!(cursor.target_block, 1044);

        let stored = db::get_cursor(&pool, 1).await.unwrap().unwrap();
        assert_eq!(stored.target_block, 1044);
    }

    #[tokio::test]
    async fn target_never_moves_backwards() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        let ledger = MockLedger::new(1000);
        let mut cursor = ensure_cursor(&pool, &ledger, 1).await.unwrap();

        // A lagging node reports an older head.
        ledger.set_head(900);
        assert!(!retarget(&pool, &ledger, &mut cursor).await.unwrap());
        assert_eq!(cursor.target_block, 994);
        assert!(cursor.start_block <= cursor.synced_block);
        assert!(cursor.synced_block <= cursor.target_block);
    }

    #[tokio::test]
    async fn synced_is_raised_to_start() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        let ledger = MockLedger::new(1000);
        let mut cursor = ensure_cursor(&pool, &ledger, 1).await.unwrap();
        db::save_synced_block(&pool, cursor.id, 900).await.unwrap();
        cursor.synced_block = 900;

        assert!(retarget(&pool, &ledger, &mut cursor).await.unwrap());
        assert_eq!(cursor.synced_block, 994);
        let stored = db::get_cursor(&pool, 1).await.unwrap().unwrap();
        assert_eq!(stored.synced_block, 994);
    }
}
