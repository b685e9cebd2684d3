//! Confirmation tracking for submitted mints
//!
//! Each submitted record gets its own watcher task that polls the destination
//! until the mint is deep enough, reverted, or timed out. Reverted and timed
//! out records go back to pending and are re-dispatched.

use chrono::Utc;
use eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::TransferStore;
use crate::error::RelayError;
use crate::ledger::{DestinationLedger, TxStatus};
use crate::metrics;
use crate::relayer::RelaySettings;
use crate::types::{Status, TransferRecord};
use crate::writers::Dispatcher;

/// Result of checking a submitted transaction
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationResult {
    /// No receipt yet
    Pending,
    /// Included, waiting for more blocks on top
    WaitingConfirmations(u64),
    /// Deep enough; record marked confirmed
    Confirmed,
    /// Reverted on chain; record returned to pending
    Reverted,
    /// Not included within the confirmation timeout; record returned to pending
    TimedOut,
    /// Record changed under us; stop watching
    Superseded,
}

impl ConfirmationResult {
    fn is_final(&self) -> bool {
        !matches!(
            self,
            ConfirmationResult::Pending | ConfirmationResult::WaitingConfirmations(_)
        )
    }
}

#[derive(Clone)]
pub struct ConfirmationTracker {
    store: Arc<dyn TransferStore>,
    destination: Arc<dyn DestinationLedger>,
    dispatcher: Dispatcher,
    required_confirmations: u64,
    poll_interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ConfirmationTracker {
    pub fn new(
        store: Arc<dyn TransferStore>,
        destination: Arc<dyn DestinationLedger>,
        dispatcher: Dispatcher,
        settings: &RelaySettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            destination,
            dispatcher,
            required_confirmations: settings.destination_confirmations,
            poll_interval: settings.poll_interval,
            timeout: settings.confirmation_timeout,
            cancel,
        }
    }

    /// Start watching a submitted record until it is final or shutdown begins
    pub fn watch(&self, record: TransferRecord) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.track(record).await })
    }

    async fn track(self, record: TransferRecord) {
        let nonce = record.nonce();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(nonce = %nonce, "Confirmation watcher stopped");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.check(&record).await {
                Ok(result) if result.is_final() => {
                    debug!(nonce = %nonce, ?result, "Confirmation watch finished");
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(nonce = %nonce, error = ?e, "Confirmation check failed"),
            }
        }
    }

    /// Poll the destination once for `record` and apply the resulting transition
    pub async fn check(&self, record: &TransferRecord) -> Result<ConfirmationResult> {
        if record.status != Status::Submitted {
            return Ok(ConfirmationResult::Superseded);
        }
        let Some(tx_hash) = record.destination_tx_hash else {
            warn!(nonce = %record.nonce(), "Submitted record has no transaction hash");
            return Ok(ConfirmationResult::Superseded);
        };

        match self.destination.transaction_status(tx_hash).await {
            Ok(TxStatus::Confirmed { depth }) if depth >= self.required_confirmations => {
                let next = record.confirmed();
                if !self.store.compare_and_set(record, &next).await? {
                    return Ok(ConfirmationResult::Superseded);
                }
                metrics::CONFIRMATIONS.inc();
                info!(
                    nonce = %record.nonce(),
                    tx_hash = %tx_hash,
                    depth,
                    "Mint confirmed"
                );
                return Ok(ConfirmationResult::Confirmed);
            }
            Ok(TxStatus::Confirmed { depth }) => {
                debug!(
                    nonce = %record.nonce(),
                    depth,
                    required = self.required_confirmations,
                    "Waiting for confirmations"
                );
                return Ok(ConfirmationResult::WaitingConfirmations(depth));
            }
            Ok(TxStatus::Reverted) => {
                let next = record.reverted(format!("transaction {} reverted on chain", tx_hash));
                if !self.store.compare_and_set(record, &next).await? {
                    return Ok(ConfirmationResult::Superseded);
                }
                warn!(nonce = %record.nonce(), tx_hash = %tx_hash, "Mint reverted, re-queueing");
                self.dispatcher.dispatch(record.nonce());
                return Ok(ConfirmationResult::Reverted);
            }
            Ok(TxStatus::Pending) => {}
            Err(e) => {
                debug!(nonce = %record.nonce(), error = %e, "Transaction status unavailable")
            }
        }

        let submitted_at = record.submitted_at.unwrap_or(record.updated_at);
        let waited = (Utc::now() - submitted_at).to_std().unwrap_or_default();
        if waited < self.timeout {
            return Ok(ConfirmationResult::Pending);
        }

        let reason = RelayError::ConfirmationTimeout(self.timeout).to_string();
        let next = record.reset_to_pending(reason);
        if !self.store.compare_and_set(record, &next).await? {
            return Ok(ConfirmationResult::Superseded);
        }
        warn!(
            nonce = %record.nonce(),
            tx_hash = %tx_hash,
            waited = ?waited,
            "Mint not included in time, re-queueing with a replacement"
        );
        self.dispatcher.dispatch(record.nonce());
        Ok(ConfirmationResult::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::testing::{fast_settings, MockDestination};
    use crate::types::sample_event;
    use alloy::primitives::B256;

    struct Fixture {
        store: Arc<MemoryStore>,
        destination: Arc<MockDestination>,
        tracker: ConfirmationTracker,
        rx: tokio::sync::mpsc::UnboundedReceiver<alloy::primitives::U256>,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let destination = Arc::new(MockDestination::new());
        let (dispatcher, rx) = Dispatcher::channel();
        let mut settings = fast_settings();
        settings.confirmation_timeout = timeout;
        let tracker = ConfirmationTracker::new(
            store.clone(),
            destination.clone(),
            dispatcher,
            &settings,
            CancellationToken::new(),
        );
        Fixture {
            store,
            destination,
            tracker,
            rx,
        }
    }

    async fn submitted_record(store: &MemoryStore, hash: B256) -> TransferRecord {
        let record = TransferRecord::pending(sample_event(42, 100, 0))
            .claimed(0, 1_000)
            .submitted(hash);
        store.upsert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_confirms_at_required_depth() {
        let f = fixture(Duration::from_secs(60));
        let hash = B256::repeat_byte(1);
        let record = submitted_record(&f.store, hash).await;

        f.destination.set_status(hash, TxStatus::Confirmed { depth: 11 });
        assert_eq!(
            f.tracker.check(&record).await.unwrap(),
            ConfirmationResult::WaitingConfirmations(11)
        );

        f.destination.set_status(hash, TxStatus::Confirmed { depth: 12 });
        assert_eq!(
            f.tracker.check(&record).await.unwrap(),
            ConfirmationResult::Confirmed
        );
        let stored = f.store.get_by_nonce(record.nonce()).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Confirmed);
        assert_eq!(stored.destination_tx_hash, Some(hash));
    }

    #[tokio::test]
    async fn test_revert_returns_to_pending() {
        let mut f = fixture(Duration::from_secs(60));
        let hash = B256::repeat_byte(2);
        let record = submitted_record(&f.store, hash).await;

        f.destination.set_status(hash, TxStatus::Reverted);
        assert_eq!(
            f.tracker.check(&record).await.unwrap(),
            ConfirmationResult::Reverted
        );

        let stored = f.store.get_by_nonce(record.nonce()).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Pending);
        assert_eq!(stored.account_nonce, None);
        assert_eq!(f.rx.recv().await, Some(record.nonce()));
    }

    #[tokio::test]
    async fn test_timeout_keeps_reservation_for_replacement() {
        let mut f = fixture(Duration::ZERO);
        let hash = B256::repeat_byte(3);
        let record = submitted_record(&f.store, hash).await;

        assert_eq!(
            f.tracker.check(&record).await.unwrap(),
            ConfirmationResult::TimedOut
        );

        let stored = f.store.get_by_nonce(record.nonce()).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Pending);
        assert_eq!(stored.account_nonce, Some(0));
        assert_eq!(stored.gas_price, Some(1_000));
        assert!(stored.last_error.unwrap().contains("confirmation timed out"));
        assert_eq!(f.rx.recv().await, Some(record.nonce()));
    }

    #[tokio::test]
    async fn test_stale_record_is_superseded() {
        let f = fixture(Duration::from_secs(60));
        let hash = B256::repeat_byte(4);
        let record = submitted_record(&f.store, hash).await;
        f.store.upsert(&record.confirmed()).await.unwrap();

        f.destination.set_status(hash, TxStatus::Reverted);
        assert_eq!(
            f.tracker.check(&record).await.unwrap(),
            ConfirmationResult::Superseded
        );
        let stored = f.store.get_by_nonce(record.nonce()).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Confirmed);
    }
}
