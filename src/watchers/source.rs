use std::sync::Arc;
use tracing::{debug, error};

use crate::contracts::{decode_transfer, STEP_BURN};
use crate::error::RelayError;
use crate::ledger::{LogFilter, RawLog, SourceLedger};
use crate::metrics;
use crate::types::TransferEvent;

/// Decoded events for one inclusive block range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    /// Ordered by `(block_number, log_index)`
    pub events: Vec<TransferEvent>,
    pub from_block: u64,
    pub to_block: u64,
    /// `to_block` is the newest block that is deep enough to read
    pub caught_up: bool,
}

/// Reads burn events from the source chain, never past the confirmation depth
pub struct EventSource {
    ledger: Arc<dyn SourceLedger>,
    filter: LogFilter,
    confirmation_depth: u64,
    max_block_range: u64,
}

impl EventSource {
    pub fn new(
        ledger: Arc<dyn SourceLedger>,
        filter: LogFilter,
        confirmation_depth: u64,
        max_block_range: u64,
    ) -> Self {
        Self {
            ledger,
            filter,
            confirmation_depth,
            max_block_range: max_block_range.max(1),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.ledger.chain_id()
    }

    /// Next batch starting at `from_block`, or `None` when that block is not yet
    /// `confirmation_depth` blocks deep.
    pub async fn next_batch(&self, from_block: u64) -> Result<Option<EventBatch>, RelayError> {
        let head = self.ledger.current_block_height().await?;
        metrics::SOURCE_HEAD.set(head as f64);

        let Some(safe_head) = head.checked_sub(self.confirmation_depth) else {
            return Ok(None);
        };
        if from_block > safe_head {
            return Ok(None);
        }

        let to_block = safe_head.min(from_block.saturating_add(self.max_block_range - 1));

        let logs = self.ledger.fetch_logs(&self.filter, from_block, to_block).await?;

        let mut events: Vec<TransferEvent> = logs
            .iter()
            .filter_map(|log| self.decode(log))
            .collect();
        events.sort_by_key(|e| e.position());

        if !events.is_empty() {
            debug!(
                chain_id = self.chain_id(),
                from_block,
                to_block,
                count = events.len(),
                "Decoded burn events"
            );
        }

        Ok(Some(EventBatch {
            events,
            from_block,
            to_block,
            caught_up: to_block == safe_head,
        }))
    }

    fn decode(&self, log: &RawLog) -> Option<TransferEvent> {
        if log.topics.first() != Some(&self.filter.topic0) {
            return None;
        }

        let decoded = match decode_transfer(&log.topics, &log.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::MALFORMED_LOGS.inc();
                error!(
                    block = log.block_number,
                    log_index = log.log_index,
                    tx_hash = ?log.tx_hash,
                    error = %e,
                    "Skipping undecodable bridge log"
                );
                return None;
            }
        };

        // The same event carries mints for the reverse direction
        if decoded.step != STEP_BURN {
            return None;
        }

        Some(TransferEvent {
            source_chain_id: self.chain_id(),
            block_number: log.block_number,
            log_index: log.log_index,
            source_tx_hash: log.tx_hash,
            from: decoded.from,
            to: decoded.to,
            amount: decoded.amount,
            nonce: decoded.nonce,
            timestamp: decoded.date.saturating_to(),
            signature: decoded.signature,
        })
    }
}
