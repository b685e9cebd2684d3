//! One submission attempt for one transfer
//!
//! Every state change is a compare-and-set against the record as read at the
//! start of the attempt, so a concurrent worker or relayer instance that moved
//! the record first makes this attempt back off instead of double-submitting.

use alloy::primitives::U256;
use eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::nonce::NonceAllocator;
use super::retry::with_retry;
use crate::contracts::encode_mint;
use crate::db::TransferStore;
use crate::error::RelayError;
use crate::gas::GasEstimator;
use crate::ledger::{DestinationLedger, GasQuote, Signer, TxPayload, UnsignedTransaction};
use crate::metrics;
use crate::relayer::RelaySettings;
use crate::types::{Status, TransferRecord};

/// Everything a submission worker needs
pub struct SubmitContext {
    pub store: Arc<dyn TransferStore>,
    pub destination: Arc<dyn DestinationLedger>,
    pub signer: Arc<dyn Signer>,
    pub gas: GasEstimator,
    pub nonces: NonceAllocator,
    pub settings: RelaySettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Record missing or not pending
    Skipped,
    /// Transaction accepted by the destination node
    Submitted(TransferRecord),
    /// The destination contract had already processed the transfer
    AlreadyProcessed,
    Failed(String),
    /// Try again after the delay
    Retry(Duration),
    /// Another writer changed the record first
    LostRace,
}

impl SubmitOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SubmitOutcome::Skipped => "skipped",
            SubmitOutcome::Submitted(_) => "submitted",
            SubmitOutcome::AlreadyProcessed => "already_processed",
            SubmitOutcome::Failed(_) => "failed",
            SubmitOutcome::Retry(_) => "retry",
            SubmitOutcome::LostRace => "lost_race",
        }
    }
}

impl SubmitContext {
    fn backoff(&self, attempt_count: u32) -> Duration {
        self.settings
            .retry
            .backoff_for_attempt(attempt_count.saturating_sub(1))
    }

    async fn fail(&self, record: &TransferRecord, reason: String) -> Result<SubmitOutcome> {
        let next = record.failed(reason.clone());
        if !self.store.compare_and_set(record, &next).await? {
            return Ok(SubmitOutcome::LostRace);
        }

        // A reserved account nonce that will never be used leaves a gap
        if record.account_nonce.is_some() {
            if let Err(e) = self.nonces.advance().await {
                warn!(error = %e, "Failed to advance account nonce after failure");
            }
        }

        metrics::FAILURES
            .with_label_values(&[metrics::failure_label(&reason)])
            .inc();
        error!(
            nonce = %record.nonce(),
            attempts = record.attempt_count,
            reason = %reason,
            "Transfer failed, manual intervention required"
        );
        Ok(SubmitOutcome::Failed(reason))
    }

    /// Store `next` and schedule another attempt
    async fn retry(&self, record: &TransferRecord, next: TransferRecord) -> Result<SubmitOutcome> {
        if !self.store.compare_and_set(record, &next).await? {
            return Ok(SubmitOutcome::LostRace);
        }
        Ok(SubmitOutcome::Retry(self.backoff(next.attempt_count)))
    }
}

/// Run one attempt for the transfer with `nonce`
pub async fn submit_one(ctx: &SubmitContext, nonce: U256) -> Result<SubmitOutcome> {
    let Some(record) = ctx.store.get_by_nonce(nonce).await? else {
        warn!(nonce = %nonce, "Dispatched transfer has no record");
        return Ok(SubmitOutcome::Skipped);
    };

    if record.status != Status::Pending {
        debug!(nonce = %nonce, status = %record.status, "Transfer no longer pending");
        return Ok(SubmitOutcome::Skipped);
    }

    if record.attempt_count >= ctx.settings.max_attempts {
        return ctx
            .fail(
                &record,
                format!("max attempts exceeded ({})", record.attempt_count),
            )
            .await;
    }

    let event = &record.event;

    match ctx.destination.is_processed(event.from, event.nonce).await {
        Ok(true) => {
            let next = record.confirmed();
            if !ctx.store.compare_and_set(&record, &next).await? {
                return Ok(SubmitOutcome::LostRace);
            }
            info!(nonce = %nonce, "Transfer already processed on destination");
            return Ok(SubmitOutcome::AlreadyProcessed);
        }
        Ok(false) => {}
        // Only a shortcut; the contract rejects duplicates on its own
        Err(e) => warn!(nonce = %nonce, error = %e, "Processed-nonce check failed"),
    }

    let payload = TxPayload {
        to: ctx.settings.destination_contract,
        data: encode_mint(
            event.from,
            event.to,
            event.amount,
            event.nonce,
            event.signature.clone(),
        ),
    };

    let sender = ctx.signer.address();
    let previous = match (record.account_nonce, record.gas_price) {
        (Some(_), Some(gas_price)) => Some(GasQuote {
            gas_price,
            gas_limit: 0,
        }),
        _ => None,
    };

    let payload_ref = &payload;
    let quote = match with_retry(&ctx.settings.retry, "gas quote", move || {
        ctx.gas.quote(payload_ref, sender, previous)
    })
    .await
    {
        Ok(quote) => quote,
        Err(RelayError::EstimationRevert(reason)) => {
            return ctx
                .fail(&record, format!("SubmissionRevert: {}", reason))
                .await;
        }
        Err(e) => {
            warn!(nonce = %nonce, error = %e, "Gas quote failed, will retry");
            return ctx.retry(&record, record.attempt_failed(e.to_string())).await;
        }
    };

    let fresh_nonce = record.account_nonce.is_none();
    let account_nonce = match record.account_nonce {
        Some(reserved) => reserved,
        None => ctx.nonces.next(),
    };

    let claimed = record.claimed(account_nonce, quote.gas_price);
    if !ctx.store.compare_and_set(&record, &claimed).await? {
        // The allocated nonce was never broadcast
        if fresh_nonce && !ctx.nonces.release(account_nonce) {
            if let Err(e) = ctx.nonces.advance().await {
                warn!(error = %e, "Failed to advance account nonce after lost claim");
            }
        }
        return Ok(SubmitOutcome::LostRace);
    }

    let unsigned = UnsignedTransaction {
        payload,
        gas: quote,
        account_nonce,
    };

    let signed = match ctx.signer.sign(&unsigned).await {
        Ok(signed) => signed,
        Err(e) => {
            error!(nonce = %nonce, error = %e, "Failed to sign mint transaction");
            return ctx.retry(&claimed, claimed.retry_later(e.to_string())).await;
        }
    };

    debug!(
        nonce = %nonce,
        account_nonce,
        gas_price = quote.gas_price,
        gas_limit = quote.gas_limit,
        replacement = !fresh_nonce,
        tx_hash = %signed.hash,
        "Submitting mint"
    );

    let submission = tokio::time::timeout(
        ctx.settings.submission_timeout,
        ctx.destination.submit_transaction(&signed),
    )
    .await
    .unwrap_or(Err(RelayError::SubmissionTimeout(
        ctx.settings.submission_timeout,
    )));

    match submission {
        Ok(tx_hash) => {
            let next = claimed.submitted(tx_hash);
            if !ctx.store.compare_and_set(&claimed, &next).await? {
                return Ok(SubmitOutcome::LostRace);
            }
            let waited = (next.updated_at - next.created_at)
                .to_std()
                .unwrap_or_default();
            metrics::TIME_TO_SUBMIT.observe(waited.as_secs_f64());
            info!(
                nonce = %nonce,
                tx_hash = %tx_hash,
                account_nonce,
                attempt = next.attempt_count,
                "Mint submitted"
            );
            Ok(SubmitOutcome::Submitted(next))
        }
        Err(RelayError::SubmissionRevert(reason)) => {
            ctx.fail(&claimed, format!("SubmissionRevert: {}", reason))
                .await
        }
        Err(e @ RelayError::NonceConflict(_)) => {
            warn!(nonce = %nonce, account_nonce, error = %e, "Account nonce conflict");
            if let Err(resync) = ctx.nonces.resync().await {
                warn!(error = %resync, "Failed to resync account nonce");
            }
            ctx.retry(&claimed, claimed.release_account_nonce(e.to_string()))
                .await
        }
        Err(e) => {
            warn!(nonce = %nonce, error = %e, "Submission failed, will retry");
            ctx.retry(&claimed, claimed.retry_later(e.to_string())).await
        }
    }
}
