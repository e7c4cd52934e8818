//! Domain records: watched tokens and wallets, indexed transfer events and
//! loot-box issuance rows, plus decoding of ERC-20/721 `Transfer` logs.

use ethers::types::{Log, H160, H256, U256};
use ethers::utils::{keccak256, to_checksum};
use serde::{Deserialize, Serialize};

use crate::errors::{OracleError, Result};

/// `keccak256("Transfer(address,address,uint256)")`, shared by ERC-20 and ERC-721.
pub fn transfer_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Router,
    Fungible,
    NonFungible,
}

impl TokenKind {
    /// Decode the numeric kind stored in the `token` table.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Router),
            20 => Some(Self::Fungible),
            721 => Some(Self::NonFungible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchPurpose {
    Donation,
    Payment,
}

impl WatchPurpose {
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw {
            "donation" => Some(Self::Donation),
            "payment" => Some(Self::Payment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainConfig {
    pub id: i64,
    pub name: String,
    pub chain_id: i64,
    pub url: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRow {
    pub id: i64,
    pub kind: i64,
    pub name: String,
    pub address: String,
}

/// A token whose transfers are indexed.
#[derive(Debug, Clone)]
pub struct WatchedToken {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatchingRow {
    pub name: String,
    pub address: String,
    pub purpose: String,
}

/// A wallet whose inbound fungible transfers trigger loot-box issuance.
#[derive(Debug, Clone)]
pub struct WatchedWallet {
    pub name: String,
    pub address: String,
    pub purpose: WatchPurpose,
}

/// Processing state of an indexed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    NewPayment,
    NewDonate,
    NftTransfer,
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewPayment => "new_payment",
            Self::NewDonate => "new_donate",
            Self::NftTransfer => "nft_transfer",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn from_name(raw: &str) -> Option<Self> {
        match raw {
            "new_payment" => Some(Self::NewPayment),
            "new_donate" => Some(Self::NewDonate),
            "nft_transfer" => Some(Self::NftTransfer),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A decoded `Transfer` log, ready to be classified and stored.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub event_id: String,
    pub contract_address: String,
    pub from: H160,
    pub to: H160,
    pub value: U256,
    pub block_number: i64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub topics: Vec<H256>,
    pub raw_data: Vec<u8>,
}

impl TransferLog {
    pub fn decode(log: &Log) -> Result<Self> {
        if log.topics.first() != Some(&transfer_topic()) {
            return Err(OracleError::Decode("not a Transfer log".to_string()));
        }
        if log.topics.len() < 3 {
            return Err(OracleError::Decode(format!(
                "Transfer log with {} topics",
                log.topics.len()
            )));
        }

        // ERC-721 indexes the token id as a fourth topic, ERC-20 puts the amount in data.
        let value = match log.topics.get(3) {
            Some(token_id) => U256::from_big_endian(token_id.as_bytes()),
            None if log.data.len() >= 32 => U256::from_big_endian(&log.data[..32]),
            None => {
                return Err(OracleError::Decode(format!(
                    "Transfer data too short: {} bytes",
                    log.data.len()
                )))
            }
        };

        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| OracleError::Decode("log without transaction hash".to_string()))?;
        let log_index = log
            .log_index
            .ok_or_else(|| OracleError::Decode("log without log index".to_string()))?;
        let block_number = log
            .block_number
            .ok_or_else(|| OracleError::Decode("log without block number".to_string()))?;

        Ok(Self {
            event_id: event_id(transaction_hash, log_index),
            contract_address: format!("{:?}", log.address),
            from: H160::from(log.topics[1]),
            to: H160::from(log.topics[2]),
            value,
            block_number: block_number.as_u64() as i64,
            block_hash: log.block_hash.map(|h| format!("{h:?}")).unwrap_or_default(),
            transaction_hash: format!("{transaction_hash:?}"),
            topics: log.topics.clone(),
            raw_data: log.data.to_vec(),
        })
    }

    pub fn from_address(&self) -> String {
        format!("{:?}", self.from)
    }

    pub fn to_address(&self) -> String {
        format!("{:?}", self.to)
    }

    /// Canonical lower-case hex of the transferred value / token id.
    pub fn value_hex(&self) -> String {
        format!("{:#x}", self.value)
    }

    /// Structured mirror of the decoded fields, stored next to the raw bytes.
    pub fn json_data(&self) -> serde_json::Value {
        serde_json::json!({
            "eventName": "Transfer",
            "from": to_checksum(&self.from, None),
            "to": to_checksum(&self.to, None),
            "value": self.value.to_string(),
        })
    }
}

/// Deterministic id of a log: `keccak256(tx_hash ‖ log_index)`.
pub fn event_id(transaction_hash: H256, log_index: U256) -> String {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(transaction_hash.as_bytes());
    log_index.to_big_endian(&mut preimage[32..]);
    format!("0x{}", hex::encode(keccak256(preimage)))
}

/// An event row to be inserted.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub blockchain_id: i64,
    pub token_id: i64,
    pub status: EventStatus,
    pub transfer: TransferLog,
}

/// A stored event row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub event_id: String,
    pub blockchain_id: i64,
    pub token_id: i64,
    pub event_name: String,
    pub sender: String,
    pub receiver: String,
    pub value: String,
    pub block_number: i64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub contract_address: String,
    pub topics: String,
    #[serde(skip)]
    pub raw_data: Vec<u8>,
    pub json_data: String,
    pub status: String,
    pub created_at: i64,
}

/// A payment or donation event joined with the paying token's precision.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentEvent {
    pub id: i64,
    pub sender: String,
    pub value: String,
    pub token_decimals: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceStatus {
    New,
    Opening,
    Opened,
    ResultArrived,
    Error,
}

impl IssuanceStatus {
    pub fn code(&self) -> i64 {
        match self {
            Self::New => 0,
            Self::Opening => 1,
            Self::Opened => 2,
            Self::ResultArrived => 3,
            Self::Error => 255,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::New),
            1 => Some(Self::Opening),
            2 => Some(Self::Opened),
            3 => Some(Self::ResultArrived),
            255 => Some(Self::Error),
            _ => None,
        }
    }
}

/// One allocation of loot boxes to an owner.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NftIssuance {
    pub id: i64,
    pub phase: i64,
    pub issuance_uuid: String,
    pub event_id: i64,
    pub owner: String,
    pub number_of_box: i64,
    pub total_boxes: i64,
    pub status: i64,
    pub transaction_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
