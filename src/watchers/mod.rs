//! Source chain scanning
//!
//! The scanner walks the source chain in order, admits every burn it sees and
//! keeps a window of the transfers it is waiting on. The persisted cursor only
//! moves past a block once every transfer in it is submitted, confirmed or failed,
//! so a restart never skips an unresolved transfer.

pub mod source;

use alloy::primitives::{Address, B256, U256};
use eyre::{eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::TransferStore;
use crate::ledger::{LogFilter, SourceLedger};
use crate::metrics;
use crate::writers::retry::RetryConfig;
use crate::writers::{admit, Admission, Dispatcher};
pub use source::{EventBatch, EventSource};

/// Scanner configuration for one source chain
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub chain_id: u64,
    pub contract: Address,
    pub topic0: B256,
    /// Used only when no cursor has been persisted
    pub from_block: u64,
    pub confirmation_depth: u64,
    pub max_block_range: u64,
    pub poll_interval: Duration,
}

pub struct Scanner {
    source: EventSource,
    store: Arc<dyn TransferStore>,
    dispatcher: Dispatcher,
    settings: ScanSettings,
    retry: RetryConfig,
    /// Unresolved transfers by source position
    window: BTreeMap<(u64, u64), U256>,
    next_block: u64,
    scanned_to: Option<u64>,
    cursor: Option<u64>,
}

impl Scanner {
    pub fn new(
        ledger: Arc<dyn SourceLedger>,
        store: Arc<dyn TransferStore>,
        dispatcher: Dispatcher,
        settings: ScanSettings,
        retry: RetryConfig,
    ) -> Self {
        let filter = LogFilter {
            address: settings.contract,
            topic0: settings.topic0,
        };
        let source = EventSource::new(
            ledger,
            filter,
            settings.confirmation_depth,
            settings.max_block_range,
        );
        Self {
            source,
            store,
            dispatcher,
            next_block: settings.from_block,
            settings,
            retry,
            window: BTreeMap::new(),
            scanned_to: None,
            cursor: None,
        }
    }

    /// Continue after the persisted cursor, or from the configured start block
    pub async fn resume(&mut self) -> Result<()> {
        let chain_id = self.settings.chain_id;
        match self.store.load_cursor(chain_id).await? {
            Some(cursor) => {
                self.cursor = Some(cursor);
                self.scanned_to = Some(cursor);
                self.next_block = cursor + 1;
                metrics::SCAN_CURSOR.set(cursor as f64);
                info!(chain_id, cursor, "Resuming scan after persisted cursor");
            }
            None => {
                self.next_block = self.settings.from_block;
                info!(chain_id, from_block = self.next_block, "No scan cursor, starting from configured block");
            }
        }
        Ok(())
    }

    /// Run until cancelled. Returns an error only for unrecoverable filter errors.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.resume().await?;

        let mut failures: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let caught_up = match self.source.next_batch(self.next_block).await {
                Ok(Some(batch)) => {
                    let caught_up = batch.caught_up;
                    match self.process_batch(batch).await {
                        Ok(()) => {
                            failures = 0;
                            caught_up
                        }
                        Err(e) => {
                            warn!(error = ?e, from_block = self.next_block, "Failed to admit batch, will rescan");
                            failures += 1;
                            self.backoff(&cancel, failures).await;
                            continue;
                        }
                    }
                }
                Ok(None) => {
                    failures = 0;
                    true
                }
                Err(e) if e.is_fatal() => {
                    error!(chain_id = self.settings.chain_id, error = %e, "Unrecoverable source error");
                    return Err(eyre!(e).wrap_err("Event source rejected the log filter"));
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        chain_id = self.settings.chain_id,
                        from_block = self.next_block,
                        failures,
                        error = %e,
                        "Source query failed"
                    );
                    self.backoff(&cancel, failures).await;
                    continue;
                }
            };

            if let Err(e) = self.advance_cursor().await {
                warn!(error = ?e, "Failed to advance scan cursor");
            }

            if caught_up {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }

        info!(chain_id = self.settings.chain_id, cursor = ?self.cursor, "Scanner stopped");
        Ok(())
    }

    async fn backoff(&self, cancel: &CancellationToken, failures: u32) {
        let delay = self.retry.backoff_for_attempt(failures.saturating_sub(1));
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Admit the batch's events in order. On error nothing past the last fully
    /// processed block is marked scanned, so the batch is read again.
    pub async fn process_batch(&mut self, batch: EventBatch) -> Result<()> {
        for event in batch.events {
            metrics::EVENTS_OBSERVED.inc();
            let nonce = event.nonce;
            let position = event.position();

            match admit(self.store.as_ref(), event).await? {
                Admission::Dispatch => {
                    self.window.insert(position, nonce);
                    self.dispatcher.dispatch(nonce);
                }
                Admission::Skip(status) => {
                    debug!(nonce = %nonce, %status, "Transfer already handled");
                }
            }
        }

        self.scanned_to = Some(batch.to_block);
        self.next_block = batch.to_block + 1;
        Ok(())
    }

    /// Drop resolved transfers from the front of the window and persist
    /// `min(scanned_to, first_unresolved_block - 1)` when it moved forward.
    pub async fn advance_cursor(&mut self) -> Result<Option<u64>> {
        let Some(scanned_to) = self.scanned_to else {
            return Ok(self.cursor);
        };

        let mut first_unresolved = None;
        while let Some((&position, &nonce)) = self.window.iter().next() {
            let resolved = match self.store.get_by_nonce(nonce).await? {
                Some(record) => record.status.is_resolved(),
                None => true,
            };
            if !resolved {
                first_unresolved = Some(position.0);
                break;
            }
            self.window.remove(&position);
        }

        let candidate = match first_unresolved {
            Some(block) => match block.checked_sub(1) {
                Some(before) => before.min(scanned_to),
                None => return Ok(self.cursor),
            },
            None => scanned_to,
        };

        if self.cursor.map_or(true, |cursor| candidate > cursor) {
            self.store
                .save_cursor(self.settings.chain_id, candidate)
                .await?;
            self.cursor = Some(candidate);
            metrics::SCAN_CURSOR.set(candidate as f64);
            debug!(chain_id = self.settings.chain_id, cursor = candidate, "Scan cursor advanced");
        }

        Ok(self.cursor)
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }
}
