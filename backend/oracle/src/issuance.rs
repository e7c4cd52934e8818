//! Loot-box issuance.
//!
//! A recorded payment (or genesis donation) is turned into a batch of
//! `nft_issuance` rows inside a single transaction. When any step fails the
//! transaction is rolled back and the source event is flagged `error`
//! afterwards, on the pool, so the flag survives the rollback and the event
//! is never picked up again without an operator.

use ethers::types::U256;
use ethers::utils::format_units;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{self, NewIssuance};
use crate::errors::{OracleError, Result};
use crate::events::{EventStatus, IssuanceStatus, PaymentEvent};
use crate::lootbox::LootBoxPricing;
use crate::rpc::OracleContract;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedBatch {
    pub event_id: i64,
    pub issuance_uuid: String,
    pub owner: String,
    pub total_boxes: i64,
    pub records: usize,
}

/// Decimal amount of a hex-encoded integer value with `decimals` precision.
pub fn hex_to_amount(value: &str, decimals: i64) -> Result<f64> {
    let digits = value.trim_start_matches("0x");
    let raw = U256::from_str_radix(digits, 16)
        .map_err(|_| OracleError::Decode(format!("invalid hex value {value}")))?;
    let decimals = u32::try_from(decimals)
        .map_err(|_| OracleError::Decode(format!("invalid token decimals {decimals}")))?;
    let formatted = format_units(raw, decimals)?;
    formatted
        .parse::<f64>()
        .map_err(|_| OracleError::Decode(format!("cannot read {formatted} as a number")))
}

/// Issue loot boxes for the oldest event in `source` status.
///
/// Returns `Ok(None)` when nothing is waiting. On failure the event is marked
/// `error`, unless it already left `source`, and the original error is returned.
pub async fn process_next_payment(
    pool: &SqlitePool,
    pricing: &dyn LootBoxPricing,
    blockchain_id: i64,
    source: EventStatus,
    phase: i64,
) -> Result<Option<IssuedBatch>> {
    let Some(payment) = db::next_payment_event(pool, blockchain_id, source).await? else {
        return Ok(None);
    };

    match issue_batch(pool, pricing, &payment, source, phase).await {
        Ok(batch) => {
            info!(
                "Issued {} loot boxes in {} records for {} (event #{})",
                batch.total_boxes, batch.records, batch.owner, batch.event_id
            );
            Ok(Some(batch))
        }
        Err(e) => {
            error!("Can not perform batch issuance for event #{}: {e}", payment.id);
            // Only flag the event if it is still ours; a concurrent winner keeps `success`.
            if !db::claim_event(pool, payment.id, source, EventStatus::Error).await? {
                warn!("Event #{} left {source:?} before it could be flagged", payment.id);
            }
            Err(e)
        }
    }
}

async fn issue_batch(
    pool: &SqlitePool,
    pricing: &dyn LootBoxPricing,
    payment: &PaymentEvent,
    source: EventStatus,
    phase: i64,
) -> Result<IssuedBatch> {
    let amount = hex_to_amount(&payment.value, payment.token_decimals)?;
    let discount = pricing.discount_for(&payment.sender).await?;
    let total_boxes = pricing.box_count_for(amount, discount);
    debug!(
        "Processing {amount} for: {} discount: {}%",
        payment.sender,
        discount * 100.0
    );

    if !amount.is_finite() || amount < 0.0 || total_boxes <= 0 {
        return Err(OracleError::Integrity(format!(
            "Unexpected result, value: {amount}, No boxes {total_boxes}"
        )));
    }

    let distribution = pricing.distribution(total_boxes);
    let distributed: i64 = distribution.iter().sum();
    if distributed != total_boxes {
        return Err(OracleError::Integrity(format!(
            "distribution {distribution:?} does not add up to {total_boxes}"
        )));
    }

    let mut tx = pool.begin().await?;

    // Claim first so a concurrent worker can't allocate the same event twice.
    if !db::claim_event(&mut *tx, payment.id, source, EventStatus::Success).await? {
        return Err(OracleError::Integrity(format!(
            "event #{} was already consumed",
            payment.id
        )));
    }

    let issuance_uuid = Uuid::new_v4().to_string();
    let owner = payment.sender.to_lowercase();
    for number_of_box in &distribution {
        db::insert_issuance(
            &mut *tx,
            &NewIssuance {
                phase,
                issuance_uuid: &issuance_uuid,
                event_id: payment.id,
                owner: &owner,
                number_of_box: *number_of_box,
                total_boxes,
            },
        )
        .await?;
    }

    tx.commit().await?;

    Ok(IssuedBatch {
        event_id: payment.id,
        issuance_uuid,
        owner,
        total_boxes,
        records: distribution.len(),
    })
}

/// Submit `openBox` for the oldest new issuance record.
///
/// The record is marked `opening` before submission and `opened` with the
/// transaction hash afterwards; a failed submission marks it `error`.
pub async fn open_next_issuance(
    pool: &SqlitePool,
    contract: &dyn OracleContract,
) -> Result<Option<i64>> {
    let Some(issuance) = db::next_new_issuance(pool).await? else {
        debug!("We run out of schedule to open loot boxes");
        return Ok(None);
    };

    info!(
        "Trying to issue: {} loot boxes for {}, id: {}",
        issuance.number_of_box, issuance.owner, issuance.id
    );
    db::set_issuance_status(pool, issuance.id, IssuanceStatus::Opening, None).await?;

    let submitted = contract
        .open_box(issuance.phase, &issuance.owner, issuance.number_of_box)
        .await;
    match submitted {
        Ok(tx_hash) => {
            db::set_issuance_status(pool, issuance.id, IssuanceStatus::Opened, Some(&tx_hash))
                .await?;
            Ok(Some(issuance.id))
        }
        Err(e) => {
            error!("Can not open loot boxes #{}: {e}", issuance.id);
            db::set_issuance_status(pool, issuance.id, IssuanceStatus::Error, None).await?;
            Err(e)
        }
    }
}
