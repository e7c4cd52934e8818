//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Log decode error: {0}")]
    Decode(String),

    /// Data that must never be persisted (non-finite amounts, empty batches…).
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Unit conversion error: {0}")]
    Conversion(#[from] ethers::utils::ConversionError),
}

pub type Result<T> = std::result::Result<T, OracleError>;
