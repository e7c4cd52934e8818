//! Transfer-log ingestion.
//!
//! One call scans at most [`SYNC_BATCH_SIZE`] blocks past the synced block,
//! in sub-ranges of [`WORKER_SPLIT`] blocks. The cursor is persisted after
//! every sub-range, so a crash replays at most one sub-range; replayed logs
//! are dropped by their event id.

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::{SYNC_BATCH_SIZE, WORKER_SPLIT};
use crate::cursor::SyncCursor;
use crate::db;
use crate::errors::Result;
use crate::events::{transfer_topic, EventStatus, NewEvent, TokenKind, TransferLog, WatchPurpose};
use crate::rpc::Ledger;
use crate::snapshot::ChainSnapshot;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    /// Sub-ranges fetched.
    pub ranges: usize,
    /// Events written.
    pub inserted: usize,
    /// Watched logs already on record.
    pub duplicates: usize,
}

/// `[from, to]` sub-ranges of at most `split` blocks covering the window.
pub fn split_range(from: i64, to: i64, split: i64) -> Vec<(i64, i64)> {
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = (start + split - 1).min(to);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Status a watched transfer is stored with, `None` when it is irrelevant.
pub fn classify(snapshot: &ChainSnapshot, kind: TokenKind, transfer: &TransferLog) -> Option<EventStatus> {
    match kind {
        TokenKind::Fungible => {
            snapshot
                .wallet(&transfer.to_address())
                .map(|wallet| match wallet.purpose {
                    WatchPurpose::Donation => EventStatus::NewDonate,
                    WatchPurpose::Payment => EventStatus::NewPayment,
                })
        }
        TokenKind::NonFungible => Some(EventStatus::NftTransfer),
        TokenKind::Router => None,
    }
}

/// Ingest the next chunk of the window and advance `cursor`.
pub async fn ingest(
    pool: &SqlitePool,
    ledger: &dyn Ledger,
    snapshot: &ChainSnapshot,
    cursor: &mut SyncCursor,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    let to_block = (cursor.synced_block + SYNC_BATCH_SIZE).min(cursor.target_block);
    if to_block - cursor.synced_block < 2 {
        debug!(
            "{} > Waiting for more blocks (synced {}, target {})",
            snapshot.chain.name, cursor.synced_block, cursor.target_block
        );
        return Ok(report);
    }

    for (from, to) in split_range(cursor.synced_block + 1, to_block, WORKER_SPLIT) {
        debug!(
            "{} > Scanning events from block: {from} to block: {to}",
            snapshot.chain.name
        );
        let (inserted, duplicates) = scan_range(pool, ledger, snapshot, from, to).await?;
        report.ranges += 1;
        report.inserted += inserted;
        report.duplicates += duplicates;

        db::save_synced_block(pool, cursor.id, to).await?;
        cursor.synced_block = to;
    }

    if report.inserted > 0 {
        info!(
            "{} > Stored {} new events up to block {}",
            snapshot.chain.name, report.inserted, cursor.synced_block
        );
    }
    Ok(report)
}

async fn scan_range(
    pool: &SqlitePool,
    ledger: &dyn Ledger,
    snapshot: &ChainSnapshot,
    from: i64,
    to: i64,
) -> Result<(usize, usize)> {
    let logs = ledger.logs(from, to, transfer_topic()).await?;
    let mut inserted = 0;
    let mut duplicates = 0;

    for log in &logs {
        let Some(token) = snapshot.token(&format!("{:?}", log.address)) else {
            continue;
        };
        let transfer = match TransferLog::decode(log) {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!("Skipping malformed {} transfer: {e}", token.name);
                continue;
            }
        };
        if db::event_exists(pool, &transfer.event_id).await? {
            duplicates += 1;
            continue;
        }
        let Some(status) = classify(snapshot, token.kind, &transfer) else {
            continue;
        };

        info!(
            "New event, {} transfer {} -> {} {}",
            token.name,
            transfer.from_address(),
            transfer.to_address(),
            transfer.value
        );
        let event = NewEvent {
            blockchain_id: snapshot.chain.id,
            token_id: token.id,
            status,
            transfer,
        };
        if db::insert_event(pool, &event).await? {
            inserted += 1;
        } else {
            duplicates += 1;
        }
    }
    Ok((inserted, duplicates))
}
