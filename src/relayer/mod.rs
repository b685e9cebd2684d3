//! Relay engine wiring
//!
//! Builds the scanner, the submission pool and the confirmation tracker around
//! a shared store, and resumes unfinished work left by a previous run.

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::confirmation::ConfirmationTracker;
use crate::db::TransferStore;
use crate::gas::{GasEstimator, GasPolicy};
use crate::ledger::{DestinationLedger, Signer, SourceLedger};
use crate::metrics;
use crate::types::Status;
use crate::watchers::{ScanSettings, Scanner};
use crate::writers::nonce::NonceAllocator;
use crate::writers::retry::{with_retry, RetryConfig};
use crate::writers::submit::SubmitContext;
use crate::writers::{Dispatcher, SubmissionPool};


/// Submission and confirmation tuning
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub destination_contract: Address,
    pub max_in_flight: usize,
    /// Attempts before a pending transfer is marked failed
    pub max_attempts: u32,
    pub destination_confirmations: u64,
    /// Confirmation polling interval
    pub poll_interval: Duration,
    pub submission_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub shutdown_grace: Duration,
    pub retry: RetryConfig,
}

pub struct Relayer {
    store: Arc<dyn TransferStore>,
    source: Arc<dyn SourceLedger>,
    destination: Arc<dyn DestinationLedger>,
    signer: Arc<dyn Signer>,
    scan: ScanSettings,
    settings: RelaySettings,
    gas_policy: GasPolicy,
}

impl Relayer {
    pub fn new(
        store: Arc<dyn TransferStore>,
        source: Arc<dyn SourceLedger>,
        destination: Arc<dyn DestinationLedger>,
        signer: Arc<dyn Signer>,
        scan: ScanSettings,
        settings: RelaySettings,
        gas_policy: GasPolicy,
    ) -> Self {
        Self {
            store,
            source,
            destination,
            signer,
            scan,
            settings,
            gas_policy,
        }
    }

    /// Log the relayer account and its balance; a zero balance cannot pay for mints
    pub async fn check_balance(&self) {
        let account = self.signer.address();
        match self.destination.account_balance(account).await {
            Ok(balance) => {
                metrics::RELAYER_BALANCE.set(balance.saturating_to::<u128>() as f64);
                if balance.is_zero() {
                    warn!(%account, "Relayer account has no balance to pay for mints");
                } else {
                    info!(%account, %balance, "Relayer account balance");
                }
            }
            Err(e) => warn!(%account, error = %e, "Failed to read relayer balance"),
        }
    }

    /// Run until `cancel` fires or the scanner hits an unrecoverable error
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if self.scan.chain_id != self.source.chain_id() {
            return Err(eyre!(
                "Scan settings are for chain {} but the source ledger is chain {}",
                self.scan.chain_id,
                self.source.chain_id()
            ));
        }

        self.check_balance().await;

        let (dispatcher, rx) = Dispatcher::channel();

        let nonces = NonceAllocator::new(self.destination.clone(), self.signer.address());
        let account_nonce = with_retry(&self.settings.retry, "account nonce sync", || {
            nonces.resync()
        })
        .await
        .wrap_err("Failed to read relayer account nonce")?;
        info!(account = %self.signer.address(), account_nonce, "Relayer account ready");

        let tracker = ConfirmationTracker::new(
            self.store.clone(),
            self.destination.clone(),
            dispatcher.clone(),
            &self.settings,
            cancel.clone(),
        );

        self.recover(&dispatcher, &tracker).await?;

        let ctx = Arc::new(SubmitContext {
            store: self.store.clone(),
            destination: self.destination.clone(),
            signer: self.signer.clone(),
            gas: GasEstimator::new(self.destination.clone(), self.gas_policy.clone()),
            nonces,
            settings: self.settings.clone(),
        });

        let pool = SubmissionPool::new(ctx, rx, dispatcher.clone(), tracker);
        let scanner = Scanner::new(
            self.source.clone(),
            self.store.clone(),
            dispatcher,
            self.scan.clone(),
            self.settings.retry.clone(),
        );

        metrics::UP.set(1.0);
        let pool_handle = tokio::spawn(pool.run(cancel.clone()));

        let scan_result = scanner.run(cancel.clone()).await;
        if let Err(e) = &scan_result {
            error!(error = ?e, "Scanner failed, shutting down");
            cancel.cancel();
        }

        let pool_result = pool_handle.await.wrap_err("Submission pool panicked")?;
        metrics::UP.set(0.0);

        scan_result?;
        pool_result
    }

    /// Re-queue pending transfers and re-watch submitted ones
    async fn recover(&self, dispatcher: &Dispatcher, tracker: &ConfirmationTracker) -> Result<()> {
        let pending = self.store.list_pending(i64::MAX).await?;
        for record in &pending {
            dispatcher.dispatch(record.nonce());
        }

        let submitted = self
            .store
            .list_by_status(Status::Submitted, i64::MAX)
            .await?;
        for record in &submitted {
            tracker.watch(record.clone());
        }

        if !pending.is_empty() || !submitted.is_empty() {
            info!(
                pending = pending.len(),
                submitted = submitted.len(),
                "Resuming unfinished transfers"
            );
        }
        Ok(())
    }
}
