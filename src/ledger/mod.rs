//! Ledger access
//!
//! The engine talks to both chains exclusively through these traits so the
//! relay logic can be driven by in-memory ledgers in tests and by alloy
//! providers in production (see [`evm`]).

pub mod evm;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::error::RelayError;

/// A raw log as returned by the source node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: Option<B256>,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Log filter: emitting contract and event topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
}

/// Destination call: target contract and ABI-encoded call data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayload {
    pub to: Address,
    pub data: Bytes,
}

/// Gas parameters for one submission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasQuote {
    /// Legacy gas price in wei
    pub gas_price: u128,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub payload: TxPayload,
    pub gas: GasQuote,
    /// Destination account nonce
    pub account_nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub hash: B256,
    /// EIP-2718 encoded envelope
    pub raw: Bytes,
}

/// Destination-side status of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Not yet included (or unknown to the node)
    Pending,
    /// Included and successful; `depth` blocks have been built on top of it
    Confirmed { depth: u64 },
    /// Included but reverted
    Reverted,
}

/// Read access to the chain the bridge events originate from
#[async_trait]
pub trait SourceLedger: Send + Sync {
    /// Logs matching `filter` in the inclusive block range
    async fn fetch_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, RelayError>;

    async fn current_block_height(&self) -> Result<u64, RelayError>;

    fn chain_id(&self) -> u64;
}

/// Read/write access to the chain the mints are submitted to
#[async_trait]
pub trait DestinationLedger: Send + Sync {
    async fn estimate_gas(&self, payload: &TxPayload, sender: Address) -> Result<u64, RelayError>;

    async fn current_gas_price(&self) -> Result<u128, RelayError>;

    /// Next account nonce including transactions still in the mempool
    async fn pending_nonce(&self, account: Address) -> Result<u64, RelayError>;

    /// Broadcast a signed transaction, returning its hash
    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<B256, RelayError>;

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, RelayError>;

    /// Whether the bridge contract already minted `nonce` for `from`
    async fn is_processed(&self, from: Address, nonce: U256) -> Result<bool, RelayError>;

    async fn account_balance(&self, account: Address) -> Result<U256, RelayError>;
}

/// Opaque signing capability for the relayer account
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, RelayError>;
}
