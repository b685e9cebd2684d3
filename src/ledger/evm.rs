//! alloy-backed ledger clients
//!
//! Node errors are surfaced as strings by alloy, so every call maps its error
//! through the classifier in [`crate::error::RelayError`].

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use super::{
    DestinationLedger, LogFilter, RawLog, SignedTransaction, Signer, SourceLedger, TxPayload,
    TxStatus, UnsignedTransaction,
};
use crate::contracts::BridgeBase;
use crate::error::RelayError;

fn transient(e: impl std::fmt::Display) -> RelayError {
    RelayError::TransientNetwork(e.to_string())
}

fn connect(rpc_url: &str) -> Result<RootProvider<Http<Client>>> {
    let url = rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
    Ok(ProviderBuilder::new().on_http(url))
}

async fn verify_chain_id(provider: &RootProvider<Http<Client>>, expected: u64, side: &str) -> Result<()> {
    let actual = provider
        .get_chain_id()
        .await
        .map_err(|e| eyre!("Failed to query {} chain id: {}", side, e))?;
    if actual != expected {
        return Err(eyre!(
            "{} RPC reports chain id {} but {} is configured",
            side,
            actual,
            expected
        ));
    }
    Ok(())
}

/// Source chain reader
pub struct EvmSourceClient {
    provider: RootProvider<Http<Client>>,
    chain_id: u64,
}

impl EvmSourceClient {
    /// Connect and verify the node serves `chain_id`
    pub async fn new(rpc_url: &str, chain_id: u64) -> Result<Self> {
        let provider = connect(rpc_url)?;
        verify_chain_id(&provider, chain_id, "source").await?;

        info!(chain_id, "Source client connected");

        Ok(Self { provider, chain_id })
    }
}

#[async_trait]
impl SourceLedger for EvmSourceClient {
    async fn fetch_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, RelayError> {
        let query = Filter::new()
            .address(filter.address)
            .event_signature(filter.topic0)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&query)
            .await
            .map_err(|e| RelayError::from_filter_message(&e.to_string()))?;

        let mut raw = Vec::with_capacity(logs.len());
        for log in logs {
            let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index) else {
                // Only mined logs carry a position; the range is below the safe head
                warn!(tx_hash = ?log.transaction_hash, "Skipping log without block position");
                continue;
            };
            raw.push(RawLog {
                block_number,
                log_index,
                tx_hash: log.transaction_hash,
                topics: log.topics().to_vec(),
                data: log.inner.data.data.clone(),
            });
        }

        Ok(raw)
    }

    async fn current_block_height(&self) -> Result<u64, RelayError> {
        self.provider.get_block_number().await.map_err(transient)
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// Destination chain client
pub struct EvmDestinationClient {
    provider: RootProvider<Http<Client>>,
    bridge_address: Address,
}

impl EvmDestinationClient {
    /// Connect and verify the node serves `chain_id`
    pub async fn new(rpc_url: &str, bridge_address: Address, chain_id: u64) -> Result<Self> {
        let provider = connect(rpc_url)?;
        verify_chain_id(&provider, chain_id, "destination").await?;

        info!(chain_id, bridge = %bridge_address, "Destination client connected");

        Ok(Self {
            provider,
            bridge_address,
        })
    }
}

#[async_trait]
impl DestinationLedger for EvmDestinationClient {
    async fn estimate_gas(&self, payload: &TxPayload, sender: Address) -> Result<u64, RelayError> {
        let request = TransactionRequest::default()
            .with_from(sender)
            .with_to(payload.to)
            .with_input(payload.data.clone());

        self.provider
            .estimate_gas(&request)
            .await
            .map_err(|e| RelayError::from_estimation_message(&e.to_string()))
    }

    async fn current_gas_price(&self) -> Result<u128, RelayError> {
        self.provider.get_gas_price().await.map_err(transient)
    }

    async fn pending_nonce(&self, account: Address) -> Result<u64, RelayError> {
        self.provider
            .get_transaction_count(account)
            .pending()
            .await
            .map_err(transient)
    }

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<B256, RelayError> {
        match self.provider.send_raw_transaction(&tx.raw).await {
            Ok(pending) => Ok(*pending.tx_hash()),
            Err(e) => {
                let message = e.to_string();
                // Same bytes already in the mempool: the broadcast already happened
                if message.to_lowercase().contains("already known") {
                    debug!(tx_hash = %tx.hash, "Transaction already known to node");
                    return Ok(tx.hash);
                }
                Err(RelayError::from_submission_message(&message))
            }
        }
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, RelayError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(transient)?;

        let Some(receipt) = receipt else {
            return Ok(TxStatus::Pending);
        };

        if !receipt.status() {
            return Ok(TxStatus::Reverted);
        }

        let Some(tx_block) = receipt.block_number else {
            return Ok(TxStatus::Pending);
        };

        let current_block = self.provider.get_block_number().await.map_err(transient)?;

        Ok(TxStatus::Confirmed {
            depth: current_block.saturating_sub(tx_block),
        })
    }

    async fn is_processed(&self, from: Address, nonce: U256) -> Result<bool, RelayError> {
        let contract = BridgeBase::new(self.bridge_address, &self.provider);
        let processed = contract
            .processedNonces(from, nonce)
            .call()
            .await
            .map_err(transient)?;
        Ok(processed._0)
    }

    async fn account_balance(&self, account: Address) -> Result<U256, RelayError> {
        self.provider.get_balance(account).await.map_err(transient)
    }
}

/// Signs legacy transactions with a local private key
pub struct LocalKeySigner {
    wallet: EthereumWallet,
    address: Address,
    chain_id: u64,
}

impl LocalKeySigner {
    pub fn new(private_key: &str, chain_id: u64) -> Result<Self> {
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        let address = signer.address();

        info!(relayer_address = %address, chain_id, "Signer initialized");

        Ok(Self {
            wallet: EthereumWallet::from(signer),
            address,
            chain_id,
        })
    }
}

#[async_trait]
impl Signer for LocalKeySigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, RelayError> {
        let request = TransactionRequest::default()
            .with_from(self.address)
            .with_to(tx.payload.to)
            .with_input(tx.payload.data.clone())
            .with_nonce(tx.account_nonce)
            .with_chain_id(self.chain_id)
            .with_gas_limit(tx.gas.gas_limit)
            .with_gas_price(tx.gas.gas_price);

        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|e| RelayError::FatalConfig(format!("failed to sign transaction: {}", e)))?;

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        })
    }
}
