use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::FromRow;

use crate::types::{TransferEvent, TransferRecord};

// Amounts and nonces are NUMERIC(78,0) in the database. They are bound as text and cast
// with $n::NUMERIC on write, and selected with ::TEXT on read, so no big-decimal type is
// needed on the Rust side.

/// Column list for SELECTs that decode into [`TransferRow`]
pub(crate) const TRANSFER_COLUMNS: &str = r#"nonce::TEXT AS nonce, source_chain_id, block_number,
    log_index, source_tx_hash, from_address, to_address, amount::TEXT AS amount, event_timestamp,
    signature, status, destination_tx_hash, attempt_count, last_attempt_at, last_error,
    account_nonce, gas_price::TEXT AS gas_price, submitted_at, created_at, updated_at"#;

/// A row of the `transfers` table
#[derive(Debug, Clone, FromRow)]
pub struct TransferRow {
    pub nonce: String,
    pub source_chain_id: i64,
    pub block_number: i64,
    pub log_index: i64,
    pub source_tx_hash: Option<String>,
    pub from_address: String,
    pub to_address: String,
    pub amount: String,
    pub event_timestamp: i64,
    pub signature: Vec<u8>,
    pub status: String,
    pub destination_tx_hash: Option<String>,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub account_nonce: Option<i64>,
    pub gas_price: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_u256(value: &str, field: &str) -> Result<U256> {
    U256::from_str_radix(value, 10).map_err(|e| eyre!("Invalid {} '{}': {}", field, value, e))
}

fn parse_hash(value: &str, field: &str) -> Result<B256> {
    value
        .parse::<B256>()
        .wrap_err_with(|| format!("Invalid {} '{}'", field, value))
}

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("Negative {}: {}", field, value))
}

impl From<&TransferRecord> for TransferRow {
    fn from(record: &TransferRecord) -> Self {
        let event = &record.event;
        Self {
            nonce: event.nonce.to_string(),
            source_chain_id: event.source_chain_id as i64,
            block_number: event.block_number as i64,
            log_index: event.log_index as i64,
            source_tx_hash: event.source_tx_hash.map(|h| h.to_string()),
            from_address: event.from.to_string(),
            to_address: event.to.to_string(),
            amount: event.amount.to_string(),
            event_timestamp: event.timestamp as i64,
            signature: event.signature.to_vec(),
            status: record.status.as_str().to_string(),
            destination_tx_hash: record.destination_tx_hash.map(|h| h.to_string()),
            attempt_count: record.attempt_count as i32,
            last_attempt_at: record.last_attempt_at,
            last_error: record.last_error.clone(),
            account_nonce: record.account_nonce.map(|n| n as i64),
            gas_price: record.gas_price.map(|p| p.to_string()),
            submitted_at: record.submitted_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = eyre::Report;

    fn try_from(row: TransferRow) -> Result<Self> {
        let event = TransferEvent {
            source_chain_id: to_u64(row.source_chain_id, "source_chain_id")?,
            block_number: to_u64(row.block_number, "block_number")?,
            log_index: to_u64(row.log_index, "log_index")?,
            source_tx_hash: row
                .source_tx_hash
                .as_deref()
                .map(|h| parse_hash(h, "source_tx_hash"))
                .transpose()?,
            from: row
                .from_address
                .parse::<Address>()
                .wrap_err("Invalid from_address")?,
            to: row
                .to_address
                .parse::<Address>()
                .wrap_err("Invalid to_address")?,
            amount: parse_u256(&row.amount, "amount")?,
            nonce: parse_u256(&row.nonce, "nonce")?,
            timestamp: to_u64(row.event_timestamp, "event_timestamp")?,
            signature: Bytes::from(row.signature),
        };

        Ok(TransferRecord {
            event,
            status: row.status.parse()?,
            destination_tx_hash: row
                .destination_tx_hash
                .as_deref()
                .map(|h| parse_hash(h, "destination_tx_hash"))
                .transpose()?,
            attempt_count: u32::try_from(row.attempt_count)
                .map_err(|_| eyre!("Negative attempt_count: {}", row.attempt_count))?,
            last_attempt_at: row.last_attempt_at,
            last_error: row.last_error,
            account_nonce: row
                .account_nonce
                .map(|n| to_u64(n, "account_nonce"))
                .transpose()?,
            gas_price: row
                .gas_price
                .as_deref()
                .map(|p| p.parse::<u128>().wrap_err("Invalid gas_price"))
                .transpose()?,
            submitted_at: row.submitted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
