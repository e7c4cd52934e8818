//! Per-chain worker state and the scheduler tasks that operate on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::cursor::{self, SyncCursor};
use crate::errors::Result;
use crate::events::EventStatus;
use crate::indexer;
use crate::issuance;
use crate::lootbox::{current_stage, LootBoxPricing, Stage};
use crate::nonce::NonceCache;
use crate::oracle::{OracleAction, OracleDriver};
use crate::rpc::{Ledger, OracleContract};
use crate::scheduler::{Scheduler, TaskFuture};
use crate::snapshot::ChainSnapshot;

/// Oracle-side state, present only on the active chain.
pub struct OracleState {
    pub contract: Arc<dyn OracleContract>,
    pub driver: OracleDriver,
    pub nonces: NonceCache,
}

impl OracleState {
    pub fn new(contract: Arc<dyn OracleContract>) -> Self {
        Self {
            contract,
            driver: OracleDriver::new(Instant::now()),
            nonces: NonceCache::default(),
        }
    }
}

pub struct ChainWorker {
    pub pool: SqlitePool,
    pub ledger: Arc<dyn Ledger>,
    pub snapshot: Arc<ChainSnapshot>,
    pub pricing: Arc<dyn LootBoxPricing>,
    pub campaign_id: i64,
    pub genesis_end: i64,
    pub cursor: Option<SyncCursor>,
    pub oracle: Option<OracleState>,
}

impl ChainWorker {
    /// Load (or seed) the cursor and move its target towards the safe head.
    pub async fn update_sync(&mut self) -> Result<()> {
        if self.cursor.is_none() {
            let loaded = cursor::ensure_cursor(&self.pool, &*self.ledger, self.snapshot.chain.id).await?;
            self.cursor = Some(loaded);
        }
        if let Some(current) = self.cursor.as_mut() {
            let result = cursor::retarget(&self.pool, &*self.ledger, current).await;
            if result.is_err() {
                // Reload from the database next cycle.
                self.cursor = None;
            }
            result?;
        }
        Ok(())
    }

    pub async fn sync_events(&mut self) -> Result<()> {
        let Some(current) = self.cursor.as_mut() else {
            return Ok(());
        };
        indexer::ingest(&self.pool, &*self.ledger, &self.snapshot, current).await?;
        Ok(())
    }

    /// Donations only earn loot boxes during genesis.
    pub async fn process_donation(&mut self) -> Result<()> {
        if current_stage(self.genesis_end) != Stage::Genesis {
            return Ok(());
        }
        issuance::process_next_payment(
            &self.pool,
            &*self.pricing,
            self.snapshot.chain.id,
            EventStatus::NewDonate,
            self.campaign_id,
        )
        .await?;
        Ok(())
    }

    pub async fn process_payment(&mut self) -> Result<()> {
        issuance::process_next_payment(
            &self.pool,
            &*self.pricing,
            self.snapshot.chain.id,
            EventStatus::NewPayment,
            self.campaign_id,
        )
        .await?;
        Ok(())
    }

    pub async fn observe_rng(&mut self) -> Result<()> {
        let Some(oracle) = self.oracle.as_mut() else {
            return Ok(());
        };
        let action = oracle
            .driver
            .tick(&self.pool, &*oracle.contract, Instant::now())
            .await?;
        if action != OracleAction::Skipped {
            info!("Oracle rng observer: {action:?}");
        }
        Ok(())
    }

    /// Open the next issuance once the oracle sender has no transaction in flight.
    pub async fn open_loot_boxes(&mut self) -> Result<()> {
        let Some(oracle) = self.oracle.as_mut() else {
            return Ok(());
        };
        let contract = oracle.contract.clone();
        let sender = contract.sender().to_string();
        let pool = &self.pool;
        let dispatched = oracle
            .nonces
            .guarded(&*self.ledger, &sender, || async move {
                issuance::open_next_issuance(pool, &*contract).await.map(|_| ())
            })
            .await?;
        if !dispatched {
            debug!("Oracle {sender} has a pending transaction, skip opening");
        }
        Ok(())
    }
}

fn update_sync(worker: &mut ChainWorker) -> TaskFuture<'_> {
    Box::pin(worker.update_sync())
}

fn sync_events(worker: &mut ChainWorker) -> TaskFuture<'_> {
    Box::pin(worker.sync_events())
}

fn process_donation(worker: &mut ChainWorker) -> TaskFuture<'_> {
    Box::pin(worker.process_donation())
}

fn process_payment(worker: &mut ChainWorker) -> TaskFuture<'_> {
    Box::pin(worker.process_payment())
}

fn observe_rng(worker: &mut ChainWorker) -> TaskFuture<'_> {
    Box::pin(worker.observe_rng())
}

fn open_loot_boxes(worker: &mut ChainWorker) -> TaskFuture<'_> {
    Box::pin(worker.open_loot_boxes())
}

/// Task list for `worker`; the oracle tasks are only registered on the active chain.
pub fn build_scheduler(worker: &ChainWorker, delay: Duration) -> Scheduler<ChainWorker> {
    let scheduler = Scheduler::new(delay)
        .add("update sync status", update_sync)
        .add("syncing event from blockchain", sync_events)
        .add("oracle processor donate", process_donation);

    if worker.oracle.is_none() {
        return scheduler;
    }
    scheduler
        .add("oracle schedule loot boxes opening", process_payment)
        .add("oracle rng observer", observe_rng)
        .add("oracle open loot boxes", open_loot_boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H160;

    use crate::db;
    use crate::db::tests::{seed_chain, test_pool};
    use crate::events::tests::transfer_log;
    use crate::events::{IssuanceStatus, WatchPurpose};
    use crate::lootbox::FlatPricing;
    use crate::rpc::tests::{ContractCall, MockContract, MockLedger};

    const PAYMENT_WALLET: &str = "0x00000000000000000000000000000000000000d1";

    async fn worker(
        pool: &SqlitePool,
        ledger: Arc<MockLedger>,
        contract: Option<Arc<MockContract>>,
    ) -> ChainWorker {
        sqlx::query(
            "INSERT INTO watching (blockchain_id, name, address, purpose) VALUES (1, 'shop', ?1, 'payment')",
        )
        .bind(PAYMENT_WALLET)
        .execute(pool)
        .await
        .unwrap();
        let snapshot = ChainSnapshot::load(pool, 1).await.unwrap();
        assert_eq!(
            snapshot.wallet(PAYMENT_WALLET).map(|w| w.purpose),
            Some(WatchPurpose::Payment)
        );

        ChainWorker {
            pool: pool.clone(),
            ledger,
            snapshot: Arc::new(snapshot),
            pricing: Arc::new(FlatPricing::new(pool.clone(), 10.0, 10)),
            campaign_id: 3,
            genesis_end: 0,
            cursor: None,
            oracle: contract.map(|c| OracleState::new(c as Arc<dyn OracleContract>)),
        }
    }

    #[tokio::test]
    async fn inactive_chain_only_indexes() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        let ledger = Arc::new(MockLedger::new(1000));
        let worker = worker(&pool, ledger, None).await;

        let names = build_scheduler(&worker, Duration::from_millis(1)).task_names();
        assert_eq!(
            names,
            vec![
                "update sync status",
                "syncing event from blockchain",
                "oracle processor donate"
            ]
        );
    }

    #[tokio::test]
    async fn payment_flows_from_log_to_opened_boxes() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        let ledger = Arc::new(MockLedger::new(1000));
        let contract = Arc::new(MockContract::new());
        let mut worker = worker(&pool, ledger.clone(), Some(contract.clone())).await;
        let scheduler = build_scheduler(&worker, Duration::from_millis(1));
        assert_eq!(scheduler.task_names().len(), 6);

        // Cycle 1: cursor seeded at 994, nothing to scan yet.
        let reports = scheduler.run_cycle(&mut worker).await;
        assert!(reports.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(worker.cursor.unwrap().target_block, 994);

        // A 50-token payment lands in block 1000 (token without decimals).
        sqlx::query("UPDATE token SET decimals = 0 WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();
        ledger.push_log(transfer_log(
            H160::from_low_u64_be(0xaa),
            H160::from_low_u64_be(0xbeef),
            PAYMENT_WALLET.parse().unwrap(),
            50,
            1000,
            0,
            false,
        ));
        ledger.set_head(1010);

        // Cycle 2: ingestion records the payment and issuance consumes it in the
        // same cycle; opening only observes the oracle nonce.
        let reports = scheduler.run_cycle(&mut worker).await;
        assert!(reports.iter().all(|r| r.outcome.is_ok()), "{reports:?}");
        assert_eq!(worker.cursor.unwrap().synced_block, 1004);
        let rows = db::get_issuances(&pool, None, None, 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].number_of_box, 5);
        assert_eq!(rows[0].phase, 3);
        assert!(contract.calls().is_empty());

        // Cycle 3: nonce unchanged and fresh, still waiting.
        scheduler.run_cycle(&mut worker).await;
        assert!(contract.calls().is_empty());

        // Cycle 4: the oracle's nonce moved, the box is opened.
        ledger.set_nonce(MockContract::SENDER, 1);
        scheduler.run_cycle(&mut worker).await;
        assert_eq!(
            contract.calls(),
            vec![ContractCall::OpenBox(3, rows[0].owner.clone(), 5)]
        );
        let rows = db::get_issuances(&pool, Some(IssuanceStatus::Opened), None, 0, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn failing_ledger_does_not_stop_later_tasks() {
        let pool = test_pool().await;
        seed_chain(&pool).await;
        let ledger = Arc::new(MockLedger::new(1000));
        let mut worker = worker(&pool, ledger.clone(), None).await;
        let scheduler = build_scheduler(&worker, Duration::from_millis(1));

        scheduler.run_cycle(&mut worker).await;
        ledger.set_head(1100);
        ledger.fail_logs_from(Some(0));

        let reports = scheduler.run_cycle(&mut worker).await;
        assert!(reports[0].outcome.is_ok());
        assert!(reports[1].outcome.is_err());
        assert!(reports[2].outcome.is_ok());
        assert_eq!(worker.cursor.unwrap().synced_block, 994);
    }
}
