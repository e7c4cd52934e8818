//! Loot-box pricing and campaign stage.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::Result;

/// Lifecycle stage of the campaign. Donations are only honoured in genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Genesis,
    Sale,
}

/// Stage at `now` (unix seconds) for a genesis phase ending at `genesis_end`.
pub fn stage_at(genesis_end: i64, now: i64) -> Stage {
    if now < genesis_end {
        Stage::Genesis
    } else {
        Stage::Sale
    }
}

pub fn current_stage(genesis_end: i64) -> Stage {
    stage_at(genesis_end, Utc::now().timestamp())
}

/// Turns a payment into a number of boxes and splits that number into
/// issuance records.
#[async_trait]
pub trait LootBoxPricing: Send + Sync {
    async fn discount_for(&self, address: &str) -> Result<f64>;

    fn box_count_for(&self, amount: f64, discount: f64) -> i64;

    fn distribution(&self, total_boxes: i64) -> Vec<i64>;
}

/// Fixed unit price with per-address discounts from the `discount` table.
#[derive(Debug, Clone)]
pub struct FlatPricing {
    pool: SqlitePool,
    box_price: f64,
    max_per_record: i64,
}

impl FlatPricing {
    pub fn new(pool: SqlitePool, box_price: f64, max_per_record: i64) -> Self {
        Self {
            pool,
            box_price,
            max_per_record: max_per_record.max(1),
        }
    }
}

#[async_trait]
impl LootBoxPricing for FlatPricing {
    async fn discount_for(&self, address: &str) -> Result<f64> {
        db::get_discount(&self.pool, address).await
    }

    fn box_count_for(&self, amount: f64, discount: f64) -> i64 {
        let unit = self.box_price * (1.0 - discount);
        if !amount.is_finite() || !unit.is_finite() || unit <= 0.0 {
            return 0;
        }
        (amount / unit).floor() as i64
    }

    fn distribution(&self, total_boxes: i64) -> Vec<i64> {
        let mut remaining = total_boxes.max(0);
        let mut items = Vec::new();
        while remaining > 0 {
            let item = remaining.min(self.max_per_record);
            items.push(item);
            remaining -= item;
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_pool;

    #[test]
    fn stage_switches_at_genesis_end() {
        assert_eq!(stage_at(1_000, 999), Stage::Genesis);
        assert_eq!(stage_at(1_000, 1_000), Stage::Sale);
        assert_eq!(stage_at(0, 1), Stage::Sale);
    }

    #[tokio::test]
    async fn box_count_applies_discount() {
        let pricing = FlatPricing::new(test_pool().await, 10.0, 10);
        assert_eq!(pricing.box_count_for(100.0, 0.0), 10);
        assert_eq!(pricing.box_count_for(100.0, 0.2), 12);
        assert_eq!(pricing.box_count_for(9.99, 0.0), 0);
        assert_eq!(pricing.box_count_for(f64::NAN, 0.0), 0);
    }

    #[tokio::test]
    async fn distribution_conserves_total() {
        let pricing = FlatPricing::new(test_pool().await, 10.0, 10);
        let items = pricing.distribution(23);
        assert_eq!(items, vec![10, 10, 3]);
        assert_eq!(items.iter().sum::<i64>(), 23);
        assert!(pricing.distribution(0).is_empty());
    }
}
