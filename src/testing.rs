//! In-memory ledgers and signer for engine tests
//!
//! `MockDestination` models just enough of a node to exercise the engine:
//! one mempool slot per account nonce with underpriced-replacement checks,
//! instant mining with a configurable depth, and the bridge contract's
//! processed-nonce bookkeeping so double mints are observable.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol_types::{SolEvent, SolValue};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::contracts::{decode_mint, BridgeBase, STEP_BURN};
use crate::error::RelayError;
use crate::ledger::{
    DestinationLedger, LogFilter, RawLog, SignedTransaction, Signer, SourceLedger, TxPayload,
    TxStatus, UnsignedTransaction,
};
use crate::relayer::RelaySettings;
use crate::types::TransferEvent;
use crate::watchers::ScanSettings;
use crate::writers::retry::RetryConfig;

const STEP_MINT: u8 = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Settings with millisecond timings
pub fn fast_settings() -> RelaySettings {
    RelaySettings {
        destination_contract: Address::repeat_byte(0xdd),
        max_in_flight: 4,
        max_attempts: 5,
        destination_confirmations: 12,
        poll_interval: Duration::from_millis(10),
        submission_timeout: Duration::from_secs(1),
        confirmation_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(1),
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        },
    }
}

pub fn scan_settings(from_block: u64) -> ScanSettings {
    ScanSettings {
        chain_id: 5,
        contract: Address::repeat_byte(0xbb),
        topic0: BridgeBase::Transfer::SIGNATURE_HASH,
        from_block,
        confirmation_depth: 12,
        max_block_range: 1000,
        poll_interval: Duration::from_millis(10),
    }
}

fn transfer_log(event: &TransferEvent, step: u8) -> RawLog {
    let data = (
        event.from,
        event.to,
        event.amount,
        U256::from(event.timestamp),
        event.nonce,
        event.signature.clone(),
    )
        .abi_encode_params();
    RawLog {
        block_number: event.block_number,
        log_index: event.log_index,
        tx_hash: event.source_tx_hash,
        topics: vec![
            BridgeBase::Transfer::SIGNATURE_HASH,
            B256::left_padding_from(&[step]),
        ],
        data: data.into(),
    }
}

#[derive(Default)]
struct SourceState {
    head: u64,
    logs: Vec<RawLog>,
    fetch_errors: VecDeque<RelayError>,
    fetches: Vec<(u64, u64)>,
}

pub struct MockSource {
    chain_id: u64,
    state: Mutex<SourceState>,
}

impl MockSource {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(SourceState::default()),
        }
    }

    pub fn set_head(&self, head: u64) {
        lock(&self.state).head = head;
    }

    pub fn push_log(&self, log: RawLog) {
        lock(&self.state).logs.push(log);
    }

    pub fn push_burn(&self, event: &TransferEvent) {
        self.push_log(transfer_log(event, STEP_BURN));
    }

    pub fn push_mint(&self, event: &TransferEvent) {
        self.push_log(transfer_log(event, STEP_MINT));
    }

    pub fn fail_fetch_once(&self, error: RelayError) {
        lock(&self.state).fetch_errors.push_back(error);
    }

    /// Ranges requested so far
    pub fn fetches(&self) -> Vec<(u64, u64)> {
        lock(&self.state).fetches.clone()
    }
}

#[async_trait]
impl SourceLedger for MockSource {
    async fn fetch_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, RelayError> {
        let mut state = lock(&self.state);
        state.fetches.push((from_block, to_block));
        if let Some(error) = state.fetch_errors.pop_front() {
            return Err(error);
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| (from_block..=to_block).contains(&log.block_number))
            .filter(|log| log.topics.first() == Some(&filter.topic0))
            .cloned()
            .collect())
    }

    async fn current_block_height(&self) -> Result<u64, RelayError> {
        Ok(lock(&self.state).head)
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

/// A transaction accepted by [`MockDestination`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTx {
    pub hash: B256,
    pub account_nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub from: Address,
    pub transfer_nonce: U256,
}

struct DestinationState {
    gas_price: u128,
    gas_estimate: u64,
    estimation_error: Option<RelayError>,
    transfer_errors: HashMap<U256, RelayError>,
    submit_errors: VecDeque<RelayError>,
    pending_nonce_base: u64,
    mempool: HashMap<u64, SentTx>,
    mined_nonces: BTreeSet<u64>,
    sent: Vec<SentTx>,
    statuses: HashMap<B256, TxStatus>,
    processed: HashSet<(Address, U256)>,
    mints: HashMap<U256, usize>,
    auto_confirm: Option<u64>,
    hold_first: usize,
    stall_submissions: bool,
    stalled: Vec<SentTx>,
    balance: U256,
}

pub struct MockDestination {
    state: Mutex<DestinationState>,
}

impl Default for MockDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDestination {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DestinationState {
                gas_price: 1_000_000_000,
                gas_estimate: 100_000,
                estimation_error: None,
                transfer_errors: HashMap::new(),
                submit_errors: VecDeque::new(),
                pending_nonce_base: 0,
                mempool: HashMap::new(),
                mined_nonces: BTreeSet::new(),
                sent: Vec::new(),
                statuses: HashMap::new(),
                processed: HashSet::new(),
                mints: HashMap::new(),
                auto_confirm: Some(12),
                hold_first: 0,
                stall_submissions: false,
                stalled: Vec::new(),
                balance: U256::from(10u64).pow(U256::from(18u64)),
            }),
        }
    }

    pub fn set_gas_price(&self, price: u128) {
        lock(&self.state).gas_price = price;
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        lock(&self.state).gas_estimate = gas;
    }

    /// Every estimation fails with `error` until cleared
    pub fn fail_estimation(&self, error: RelayError) {
        lock(&self.state).estimation_error = Some(error);
    }

    /// Estimation for transfer `nonce` fails with `error` until cleared
    pub fn fail_estimation_for(&self, nonce: u64, error: RelayError) {
        lock(&self.state)
            .transfer_errors
            .insert(U256::from(nonce), error);
    }

    pub fn clear_estimation_failure_for(&self, nonce: u64) {
        lock(&self.state).transfer_errors.remove(&U256::from(nonce));
    }

    /// The contract rejects transfer `nonce` (e.g. a bad signature)
    pub fn revert_transfer(&self, nonce: u64) {
        self.fail_estimation_for(
            nonce,
            RelayError::EstimationRevert("execution reverted: wrong signature".to_string()),
        );
    }

    pub fn fail_submission_once(&self, error: RelayError) {
        lock(&self.state).submit_errors.push_back(error);
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        lock(&self.state).pending_nonce_base = nonce;
    }

    /// Mine accepted transactions immediately at `depth`, or leave them pending with `None`
    pub fn set_auto_confirm(&self, depth: Option<u64>) {
        lock(&self.state).auto_confirm = depth;
    }

    /// Leave the first `count` accepted transactions unmined
    pub fn hold_first_submissions(&self, count: usize) {
        lock(&self.state).hold_first = count;
    }

    /// Submissions never return while set, as with a node that stops answering
    pub fn stall_submissions(&self, stall: bool) {
        lock(&self.state).stall_submissions = stall;
    }

    /// Transactions whose submission stalled, in arrival order
    pub fn stalled(&self) -> Vec<SentTx> {
        lock(&self.state).stalled.clone()
    }

    pub fn set_status(&self, hash: B256, status: TxStatus) {
        lock(&self.state).statuses.insert(hash, status);
    }

    pub fn mark_processed(&self, from: Address, nonce: u64) {
        lock(&self.state).processed.insert((from, U256::from(nonce)));
    }

    pub fn sent(&self) -> Vec<SentTx> {
        lock(&self.state).sent.clone()
    }

    pub fn sent_for(&self, transfer_nonce: u64) -> Vec<SentTx> {
        self.sent()
            .into_iter()
            .filter(|tx| tx.transfer_nonce == U256::from(transfer_nonce))
            .collect()
    }

    /// Successful mints of transfer `nonce`
    pub fn mint_count(&self, nonce: u64) -> usize {
        lock(&self.state)
            .mints
            .get(&U256::from(nonce))
            .copied()
            .unwrap_or(0)
    }

    fn decode_raw(raw: &[u8]) -> Result<SentTx, RelayError> {
        if raw.len() < 52 {
            return Err(RelayError::SubmissionRevert("malformed raw transaction".into()));
        }
        let account_nonce = u64::from_be_bytes(raw[0..8].try_into().unwrap());
        let gas_price = u128::from_be_bytes(raw[8..24].try_into().unwrap());
        let gas_limit = u64::from_be_bytes(raw[24..32].try_into().unwrap());
        let call = decode_mint(&raw[52..])?;
        Ok(SentTx {
            hash: keccak256(raw),
            account_nonce,
            gas_price,
            gas_limit,
            from: call.from,
            transfer_nonce: call.nonce,
        })
    }

    fn mine(state: &mut DestinationState, tx: &SentTx, depth: u64) {
        state.mined_nonces.insert(tx.account_nonce);
        state.mempool.remove(&tx.account_nonce);
        let key = (tx.from, tx.transfer_nonce);
        if state.processed.insert(key) {
            *state.mints.entry(tx.transfer_nonce).or_default() += 1;
            state.statuses.insert(tx.hash, TxStatus::Confirmed { depth });
        } else {
            state.statuses.insert(tx.hash, TxStatus::Reverted);
        }
    }
}

#[async_trait]
impl DestinationLedger for MockDestination {
    async fn estimate_gas(&self, payload: &TxPayload, _sender: Address) -> Result<u64, RelayError> {
        let call = decode_mint(&payload.data).ok();
        let state = lock(&self.state);
        if let Some(error) = call.as_ref().and_then(|c| state.transfer_errors.get(&c.nonce)) {
            return Err(error.clone());
        }
        if let Some(error) = &state.estimation_error {
            return Err(error.clone());
        }
        if let Some(call) = &call {
            if state.processed.contains(&(call.from, call.nonce)) {
                return Err(RelayError::EstimationRevert(
                    "execution reverted: transfer already processed".into(),
                ));
            }
        }
        Ok(state.gas_estimate)
    }

    async fn current_gas_price(&self) -> Result<u128, RelayError> {
        Ok(lock(&self.state).gas_price)
    }

    async fn pending_nonce(&self, _account: Address) -> Result<u64, RelayError> {
        let state = lock(&self.state);
        let highest = state
            .mined_nonces
            .iter()
            .chain(state.mempool.keys())
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);
        Ok(highest.max(state.pending_nonce_base))
    }

    async fn submit_transaction(&self, tx: &SignedTransaction) -> Result<B256, RelayError> {
        let stalled = {
            let mut state = lock(&self.state);
            if state.stall_submissions {
                let sent = Self::decode_raw(&tx.raw)?;
                state.stalled.push(sent);
            }
            state.stall_submissions
        };
        if stalled {
            return std::future::pending().await;
        }

        let mut state = lock(&self.state);
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }

        let sent = Self::decode_raw(&tx.raw)?;
        if state.mined_nonces.contains(&sent.account_nonce) {
            return Err(RelayError::NonceConflict("nonce too low".into()));
        }
        if let Some(existing) = state.mempool.get(&sent.account_nonce) {
            if existing.hash == sent.hash {
                return Ok(sent.hash);
            }
            if sent.gas_price <= existing.gas_price {
                return Err(RelayError::TransientNetwork(
                    "replacement transaction underpriced".into(),
                ));
            }
        }

        state.mempool.insert(sent.account_nonce, sent.clone());
        state.sent.push(sent.clone());

        let held = state.sent.len() <= state.hold_first;
        if let (false, Some(depth)) = (held, state.auto_confirm) {
            Self::mine(&mut state, &sent, depth);
        }
        Ok(sent.hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, RelayError> {
        Ok(lock(&self.state)
            .statuses
            .get(&tx_hash)
            .copied()
            .unwrap_or(TxStatus::Pending))
    }

    async fn is_processed(&self, from: Address, nonce: U256) -> Result<bool, RelayError> {
        Ok(lock(&self.state).processed.contains(&(from, nonce)))
    }

    async fn account_balance(&self, _account: Address) -> Result<U256, RelayError> {
        Ok(lock(&self.state).balance)
    }
}

/// Deterministic signer: the raw bytes encode nonce, price, limit, target and
/// call data, and the hash is their keccak
pub struct MockSigner {
    address: Address,
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSigner {
    pub fn new() -> Self {
        Self {
            address: Address::repeat_byte(0xee),
        }
    }
}

#[async_trait]
impl Signer for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, RelayError> {
        let mut raw = Vec::with_capacity(52 + tx.payload.data.len());
        raw.extend_from_slice(&tx.account_nonce.to_be_bytes());
        raw.extend_from_slice(&tx.gas.gas_price.to_be_bytes());
        raw.extend_from_slice(&tx.gas.gas_limit.to_be_bytes());
        raw.extend_from_slice(tx.payload.to.as_slice());
        raw.extend_from_slice(&tx.payload.data);
        Ok(SignedTransaction {
            hash: keccak256(&raw),
            raw: Bytes::from(raw),
        })
    }
}
