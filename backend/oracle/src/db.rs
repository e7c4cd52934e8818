//! Database layer: migrations, watch-list loading, cursor and event
//! persistence, secret digests and loot-box issuance rows.

use sqlx::{sqlite::SqlitePoolOptions, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::cursor::SyncCursor;
use crate::errors::Result;
use crate::events::{
    ChainConfig, EventRecord, EventStatus, IssuanceStatus, NewEvent, NftIssuance, PaymentEvent,
    TokenRow, WatchingRow,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    // Make sure the file is created if it doesn't exist yet.
    let url = if url.contains('?') || url.contains(":memory:") {
        url
    } else {
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Chain & watch-lists
// ─────────────────────────────────────────────────────────

pub async fn get_chain(pool: &SqlitePool, id: i64) -> Result<Option<ChainConfig>> {
    let row = sqlx::query_as::<_, ChainConfig>(
        "SELECT id, name, chain_id, url FROM blockchain WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_tokens(pool: &SqlitePool, blockchain_id: i64) -> Result<Vec<TokenRow>> {
    let rows = sqlx::query_as::<_, TokenRow>(
        r#"
        SELECT id, kind, name, address
        FROM   token
        WHERE  blockchain_id = ?1
        "#,
    )
    .bind(blockchain_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_watching(pool: &SqlitePool, blockchain_id: i64) -> Result<Vec<WatchingRow>> {
    let rows = sqlx::query_as::<_, WatchingRow>(
        "SELECT name, address, purpose FROM watching WHERE blockchain_id = ?1",
    )
    .bind(blockchain_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

pub async fn get_cursor(pool: &SqlitePool, blockchain_id: i64) -> Result<Option<SyncCursor>> {
    let row = sqlx::query_as::<_, SyncCursor>(
        r#"
        SELECT id, blockchain_id, start_block, synced_block, target_block
        FROM   sync_cursor
        WHERE  blockchain_id = ?1
        "#,
    )
    .bind(blockchain_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Insert a collapsed window `{start = synced = target = block}`.
pub async fn create_cursor(pool: &SqlitePool, blockchain_id: i64, block: i64) -> Result<SyncCursor> {
    let row = sqlx::query_as::<_, SyncCursor>(
        r#"
        INSERT INTO sync_cursor (blockchain_id, start_block, synced_block, target_block)
        VALUES (?1, ?2, ?2, ?2)
        RETURNING id, blockchain_id, start_block, synced_block, target_block
        "#,
    )
    .bind(blockchain_id)
    .bind(block)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn save_cursor_window(
    pool: &SqlitePool,
    id: i64,
    synced_block: i64,
    target_block: i64,
) -> Result<()> {
    sqlx::query("UPDATE sync_cursor SET synced_block = ?1, target_block = ?2 WHERE id = ?3")
        .bind(synced_block)
        .bind(target_block)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn save_synced_block(pool: &SqlitePool, id: i64, synced_block: i64) -> Result<()> {
    sqlx::query("UPDATE sync_cursor SET synced_block = ?1 WHERE id = ?2")
        .bind(synced_block)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Event writes
// ─────────────────────────────────────────────────────────

pub async fn event_exists(pool: &SqlitePool, event_id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM event WHERE event_id = ?1")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Persist one event. A duplicate `event_id` is silently ignored; the return
/// value tells whether a row was actually written.
pub async fn insert_event(pool: &SqlitePool, event: &NewEvent) -> Result<bool> {
    let transfer = &event.transfer;
    let topics = serde_json::to_string(&transfer.topics)?;
    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO event
            (event_id, blockchain_id, token_id, event_name, sender, receiver, value,
             block_number, block_hash, transaction_hash, contract_address, topics,
             raw_data, json_data, status)
        VALUES (?1, ?2, ?3, 'Transfer', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
    )
    .bind(&transfer.event_id)
    .bind(event.blockchain_id)
    .bind(event.token_id)
    .bind(transfer.from_address())
    .bind(transfer.to_address())
    .bind(transfer.value_hex())
    .bind(transfer.block_number)
    .bind(&transfer.block_hash)
    .bind(&transfer.transaction_hash)
    .bind(&transfer.contract_address)
    .bind(topics)
    .bind(&transfer.raw_data)
    .bind(transfer.json_data().to_string())
    .bind(event.status.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected > 0)
}

/// Move an event from `from` to `to` only if it is still in `from`.
/// Returns `false` when another worker already moved it.
pub async fn claim_event<'e>(
    executor: impl SqliteExecutor<'e>,
    id: i64,
    from: EventStatus,
    to: EventStatus,
) -> Result<bool> {
    let rows_affected = sqlx::query("UPDATE event SET status = ?1 WHERE id = ?2 AND status = ?3")
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .execute(executor)
        .await?
        .rows_affected();
    Ok(rows_affected == 1)
}

// ─────────────────────────────────────────────────────────
// Event reads
// ─────────────────────────────────────────────────────────

/// Fetch events, optionally filtered by status, ordered by block ascending.
pub async fn get_events(
    pool: &SqlitePool,
    status: Option<EventStatus>,
    offset: i64,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, event_id, blockchain_id, token_id, event_name, sender, receiver, value,
               block_number, block_hash, transaction_hash, contract_address, topics,
               raw_data, json_data, status, created_at
        FROM   event
        WHERE  ?1 IS NULL OR status = ?1
        ORDER  BY block_number ASC, id ASC
        LIMIT  ?2 OFFSET ?3
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Oldest event still waiting in `status`, with its token's decimals.
pub async fn next_payment_event(
    pool: &SqlitePool,
    blockchain_id: i64,
    status: EventStatus,
) -> Result<Option<PaymentEvent>> {
    let row = sqlx::query_as::<_, PaymentEvent>(
        r#"
        SELECT e.id, e.sender, e.value, t.decimals AS token_decimals
        FROM   event e
        JOIN   token t ON t.id = e.token_id
        WHERE  e.blockchain_id = ?1 AND e.status = ?2
        ORDER  BY e.id ASC
        LIMIT  1
        "#,
    )
    .bind(blockchain_id)
    .bind(status.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Secret digests
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretDigest {
    pub id: i64,
    pub secret: String,
    pub digest: String,
    pub consumed: bool,
}

pub async fn count_unconsumed_digests(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM secret_digest WHERE consumed = 0")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn insert_digest<'e>(
    executor: impl SqliteExecutor<'e>,
    secret: &str,
    digest: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO secret_digest (secret, digest) VALUES (?1, ?2)")
        .bind(secret)
        .bind(digest)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn oldest_unconsumed_digest(pool: &SqlitePool) -> Result<Option<SecretDigest>> {
    let row = sqlx::query_as::<_, SecretDigest>(
        r#"
        SELECT id, secret, digest, consumed
        FROM   secret_digest
        WHERE  consumed = 0
        ORDER  BY id ASC
        LIMIT  1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn mark_digest_consumed(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE secret_digest SET consumed = 1 WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Discounts
// ─────────────────────────────────────────────────────────

/// Discount rate granted to `address`, `0.0` when none is configured.
pub async fn get_discount(pool: &SqlitePool, address: &str) -> Result<f64> {
    let row: Option<(f64,)> = sqlx::query_as("SELECT rate FROM discount WHERE address = ?1")
        .bind(address.to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(rate,)| rate).unwrap_or(0.0))
}

// ─────────────────────────────────────────────────────────
// Loot-box issuance
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewIssuance<'a> {
    pub phase: i64,
    pub issuance_uuid: &'a str,
    pub event_id: i64,
    pub owner: &'a str,
    pub number_of_box: i64,
    pub total_boxes: i64,
}

pub async fn insert_issuance<'e>(
    executor: impl SqliteExecutor<'e>,
    issuance: &NewIssuance<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO nft_issuance
            (phase, issuance_uuid, event_id, owner, number_of_box, total_boxes, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(issuance.phase)
    .bind(issuance.issuance_uuid)
    .bind(issuance.event_id)
    .bind(issuance.owner)
    .bind(issuance.number_of_box)
    .bind(issuance.total_boxes)
    .bind(IssuanceStatus::New.code())
    .execute(executor)
    .await?;
    Ok(())
}

const ISSUANCE_COLUMNS: &str = "id, phase, issuance_uuid, event_id, owner, number_of_box, \
     total_boxes, status, transaction_hash, created_at, updated_at";

pub async fn next_new_issuance(pool: &SqlitePool) -> Result<Option<NftIssuance>> {
    let row = sqlx::query_as::<_, NftIssuance>(&format!(
        "SELECT {ISSUANCE_COLUMNS} FROM nft_issuance WHERE status = ?1 ORDER BY id ASC LIMIT 1"
    ))
    .bind(IssuanceStatus::New.code())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn set_issuance_status<'e>(
    executor: impl SqliteExecutor<'e>,
    id: i64,
    status: IssuanceStatus,
    transaction_hash: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE nft_issuance
        SET    status = ?1,
               transaction_hash = COALESCE(?2, transaction_hash),
               updated_at = strftime('%s', 'now')
        WHERE  id = ?3
        "#,
    )
    .bind(status.code())
    .bind(transaction_hash)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_issuances(
    pool: &SqlitePool,
    status: Option<IssuanceStatus>,
    owner: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Vec<NftIssuance>> {
    let rows = sqlx::query_as::<_, NftIssuance>(&format!(
        r#"
        SELECT {ISSUANCE_COLUMNS}
        FROM   nft_issuance
        WHERE  (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR owner = ?2)
        ORDER  BY id ASC
        LIMIT  ?3 OFFSET ?4
        "#
    ))
    .bind(status.map(|s| s.code()))
    .bind(owner.map(str::to_lowercase))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
