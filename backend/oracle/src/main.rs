//! Loot-box oracle entry point.
//!
//! Runs one scheduler per process for the chain selected by
//! `CHAIN_RECORD_ID`: it indexes ERC-20/721 transfers into SQLite, turns
//! payments into loot-box issuance records and, on the active chain, drives
//! the commit-reveal randomness oracle and box opening. A small Axum REST
//! API exposes the indexed data.

mod api;
mod config;
mod cursor;
mod db;
mod errors;
mod events;
mod indexer;
mod issuance;
mod lootbox;
mod nonce;
mod oracle;
mod rpc;
mod scheduler;
mod snapshot;
mod worker;

use std::sync::Arc;

use axum::{routing::get, Router};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use lootbox::FlatPricing;
use rpc::{OracleClient, RpcClient};
use snapshot::ChainSnapshot;
use worker::{ChainWorker, OracleState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // Watched chain and its watch-lists; an unknown chain is fatal.
    let snapshot = Arc::new(ChainSnapshot::load(&pool, config.chain_record_id).await?);

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let rpc = RpcClient::new(client, snapshot.chain.url.clone());

    let oracle = if snapshot.chain.chain_id == config.active_chain_id {
        let (sender, contract) = config.oracle_accounts()?;
        info!("Oracle enabled on {} with sender {sender}", snapshot.chain.name);
        Some(OracleState::new(Arc::new(OracleClient::new(
            rpc.clone(),
            sender,
            contract,
        ))))
    } else {
        None
    };

    // ─── Background scheduler ─────────────────────────────
    let worker = ChainWorker {
        pool: pool.clone(),
        ledger: Arc::new(rpc),
        snapshot: snapshot.clone(),
        pricing: Arc::new(FlatPricing::new(
            pool.clone(),
            config.box_price,
            config.max_boxes_per_record,
        )),
        campaign_id: config.active_campaign_id,
        genesis_end: config.genesis_end,
        cursor: None,
        oracle,
    };
    let scheduler = worker::build_scheduler(&worker, config.cycle_delay);
    let cancel = CancellationToken::new();
    let scheduler_handle = tokio::spawn(scheduler.run(worker, cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { pool });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/events", get(api::get_events))
        .route("/api/v1/boxSchedule", get(api::get_box_schedule))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    scheduler_handle.await?;
    Ok(())
}
