//! Core relay types
//!
//! `TransferEvent` is the immutable fact read from the source chain and
//! `TransferRecord` is the mutable relay state the engine keeps per event.

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Relay status of a transfer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl Status {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Submitted => "submitted",
            Status::Confirmed => "confirmed",
            Status::Failed => "failed",
        }
    }

    /// Resolved records no longer hold back the scan cursor
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Status::Pending)
    }

    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::Submitted,
        Status::Confirmed,
        Status::Failed,
    ];
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "submitted" => Ok(Status::Submitted),
            "confirmed" => Ok(Status::Confirmed),
            "failed" => Ok(Status::Failed),
            other => Err(eyre::eyre!("unknown transfer status: {}", other)),
        }
    }
}

/// A bridge transfer observed on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub source_chain_id: u64,
    pub block_number: u64,
    pub log_index: u64,
    pub source_tx_hash: Option<B256>,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    /// Contract-assigned transfer nonce, the cross-chain deduplication key
    pub nonce: U256,
    /// Source block time as emitted by the contract
    pub timestamp: u64,
    /// Authorizes the mint on the destination side; forwarded untouched
    pub signature: Bytes,
}

impl TransferEvent {
    /// Position of the event in source-chain order
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Relay state for one transfer, keyed by `event.nonce`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub event: TransferEvent,
    pub status: Status,
    pub destination_tx_hash: Option<B256>,
    /// Also serves as the version for compare-and-set transitions
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Destination account nonce reserved by the latest attempt
    pub account_nonce: Option<u64>,
    /// Gas price (wei) of the latest attempt
    pub gas_price: Option<u128>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Fresh `Pending` record for a newly observed event
    pub fn pending(event: TransferEvent) -> Self {
        let now = Utc::now();
        Self {
            event,
            status: Status::Pending,
            destination_tx_hash: None,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            account_nonce: None,
            gas_price: None,
            submitted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn nonce(&self) -> U256 {
        self.event.nonce
    }

    /// Claim the next attempt: bumps the version and reserves nonce and price
    pub fn claimed(&self, account_nonce: u64, gas_price: u128) -> Self {
        let now = Utc::now();
        Self {
            attempt_count: self.attempt_count + 1,
            last_attempt_at: Some(now),
            account_nonce: Some(account_nonce),
            gas_price: Some(gas_price),
            updated_at: now,
            ..self.clone()
        }
    }

    /// Count an attempt that never reached the network (e.g. estimation kept failing)
    pub fn attempt_failed(&self, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            attempt_count: self.attempt_count + 1,
            last_attempt_at: Some(now),
            last_error: Some(error.into()),
            updated_at: now,
            ..self.clone()
        }
    }

    /// Keep the record `Pending` and note why the claimed attempt did not land
    pub fn retry_later(&self, error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn submitted(&self, tx_hash: B256) -> Self {
        let now = Utc::now();
        Self {
            status: Status::Submitted,
            destination_tx_hash: Some(tx_hash),
            last_error: None,
            submitted_at: Some(now),
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn confirmed(&self) -> Self {
        Self {
            status: Status::Confirmed,
            last_error: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn failed(&self, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            last_error: Some(reason.into()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Return a submitted record to `Pending` so it is re-attempted with a fresh quote.
    /// The account nonce and price are kept so the next attempt replaces the stale transaction.
    pub fn reset_to_pending(&self, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Pending,
            last_error: Some(reason.into()),
            submitted_at: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Return a submitted record to `Pending` after its transaction reverted on chain.
    /// The reverted transaction consumed its account nonce, so the reservation is dropped.
    pub fn reverted(&self, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Pending,
            last_error: Some(reason.into()),
            account_nonce: None,
            gas_price: None,
            submitted_at: None,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Drop the account nonce reservation after the destination reported a nonce conflict
    pub fn release_account_nonce(&self, reason: impl Into<String>) -> Self {
        Self {
            account_nonce: None,
            gas_price: None,
            last_error: Some(reason.into()),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Per-status record counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub submitted: i64,
    pub confirmed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: Status, count: i64) {
        match status {
            Status::Pending => self.pending += count,
            Status::Submitted => self.submitted += count,
            Status::Confirmed => self.confirmed += count,
            Status::Failed => self.failed += count,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_event(nonce: u64, block_number: u64, log_index: u64) -> TransferEvent {
    TransferEvent {
        source_chain_id: 5,
        block_number,
        log_index,
        source_tx_hash: Some(B256::repeat_byte(0xaa)),
        from: Address::repeat_byte(0x11),
        to: Address::repeat_byte(0x22),
        amount: U256::from(1000u64),
        nonce: U256::from(nonce),
        timestamp: 1_700_000_000,
        signature: Bytes::from(vec![0x5a; 65]),
    }
}
