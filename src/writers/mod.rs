//! Transaction writers for the destination chain
//!
//! Admission turns observed events into pending records, the dispatcher
//! queues pending nonces, and the submission pool runs bounded parallel
//! workers over that queue.

pub mod nonce;
pub mod retry;
pub mod submit;

use alloy::primitives::U256;
use eyre::{Result, WrapErr};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::confirmation::ConfirmationTracker;
use crate::db::TransferStore;
use crate::metrics;
use crate::types::{Status, TransferEvent, TransferRecord};
use submit::{submit_one, SubmitContext, SubmitOutcome};

/// Result of admitting an observed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A pending record exists for the event and should be worked on
    Dispatch,
    /// Already submitted or confirmed
    Skip(Status),
}

/// Record `event` as pending unless it is already in flight or done.
/// A failed record is reopened as a fresh pending one through compare-and-set,
/// so a concurrent instance that reopened it first keeps its progress.
pub async fn admit(store: &dyn TransferStore, event: TransferEvent) -> Result<Admission> {
    let nonce = event.nonce;
    let mut current = store.get_by_nonce(nonce).await?;
    loop {
        let Some(existing) = current else {
            // Losing to a concurrent insert still leaves a record to work on
            if store.insert_if_absent(&TransferRecord::pending(event)).await? {
                metrics::TRANSFERS_ADMITTED.inc();
                debug!(nonce = %nonce, "Admitted transfer");
            }
            return Ok(Admission::Dispatch);
        };

        match existing.status {
            Status::Submitted | Status::Confirmed => return Ok(Admission::Skip(existing.status)),
            Status::Pending => return Ok(Admission::Dispatch),
            Status::Failed => {
                let reopened = TransferRecord::pending(event.clone());
                if store.compare_and_set(&existing, &reopened).await? {
                    info!(
                        nonce = %nonce,
                        previous_error = ?existing.last_error,
                        "Re-admitting failed transfer"
                    );
                    metrics::TRANSFERS_ADMITTED.inc();
                    return Ok(Admission::Dispatch);
                }
                debug!(nonce = %nonce, "Failed transfer changed concurrently, re-reading");
                current = store.get_by_nonce(nonce).await?;
            }
        }
    }
}

/// Queue of transfer nonces awaiting a submission worker.
///
/// A nonce stays in the in-process set from dispatch until its worker finishes
/// without scheduling a retry, so it is never held by two workers at once.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<U256>,
    queued: Arc<Mutex<HashSet<U256>>>,
}

impl Dispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<U256>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                queued: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    fn queued(&self) -> std::sync::MutexGuard<'_, HashSet<U256>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `nonce` unless it is already queued or being worked on
    pub fn dispatch(&self, nonce: U256) -> bool {
        if !self.queued().insert(nonce) {
            return false;
        }
        if self.tx.send(nonce).is_err() {
            debug!(nonce = %nonce, "Submission pool stopped, dropping dispatch");
            self.queued().remove(&nonce);
            return false;
        }
        true
    }

    /// Send `nonce` to the pool again after `delay`; it stays marked as queued meanwhile
    pub fn requeue_after(&self, nonce: U256, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(nonce);
        });
    }

    pub fn finished(&self, nonce: U256) {
        self.queued().remove(&nonce);
    }

    pub fn is_queued(&self, nonce: &U256) -> bool {
        self.queued().contains(nonce)
    }
}

/// Runs submission workers, at most `max_in_flight` at a time
pub struct SubmissionPool {
    ctx: Arc<SubmitContext>,
    rx: mpsc::UnboundedReceiver<U256>,
    dispatcher: Dispatcher,
    tracker: ConfirmationTracker,
}

impl SubmissionPool {
    pub fn new(
        ctx: Arc<SubmitContext>,
        rx: mpsc::UnboundedReceiver<U256>,
        dispatcher: Dispatcher,
        tracker: ConfirmationTracker,
    ) -> Self {
        Self {
            ctx,
            rx,
            dispatcher,
            tracker,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let max_in_flight = self.ctx.settings.max_in_flight;
        let semaphore = Arc::new(Semaphore::new(max_in_flight));
        let mut workers = JoinSet::new();

        info!(max_in_flight, "Submission pool started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Submission worker panicked");
                    }
                }
                Some(nonce) = self.rx.recv() => {
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => {
                            self.dispatcher.finished(nonce);
                            break;
                        }
                        permit = semaphore.clone().acquire_owned() => {
                            permit.wrap_err("Submission semaphore closed")?
                        }
                    };

                    let ctx = self.ctx.clone();
                    let dispatcher = self.dispatcher.clone();
                    let tracker = self.tracker.clone();
                    workers.spawn(async move {
                        metrics::IN_FLIGHT.inc();
                        let outcome = submit_one(&ctx, nonce).await;
                        metrics::IN_FLIGHT.dec();
                        drop(permit);
                        handle_outcome(&ctx, &dispatcher, &tracker, nonce, outcome);
                    });
                }
            }
        }

        let in_flight = workers.len();
        if in_flight > 0 {
            info!(in_flight, grace = ?self.ctx.settings.shutdown_grace, "Draining in-flight submissions");
        }

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Submission worker panicked");
                }
            }
        };
        if tokio::time::timeout(self.ctx.settings.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed, abandoning in-flight submissions");
            workers.abort_all();
        }

        info!("Submission pool stopped");
        Ok(())
    }
}

fn handle_outcome(
    ctx: &SubmitContext,
    dispatcher: &Dispatcher,
    tracker: &ConfirmationTracker,
    nonce: U256,
    outcome: Result<SubmitOutcome>,
) {
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            // Store unavailable; the record is untouched or safely claimed
            warn!(nonce = %nonce, error = ?e, "Submission attempt aborted");
            metrics::SUBMISSIONS.with_label_values(&["error"]).inc();
            dispatcher.requeue_after(nonce, ctx.settings.retry.initial_backoff);
            return;
        }
    };

    metrics::SUBMISSIONS
        .with_label_values(&[outcome.label()])
        .inc();

    match outcome {
        SubmitOutcome::Submitted(record) => {
            dispatcher.finished(nonce);
            tracker.watch(record);
        }
        SubmitOutcome::Retry(delay) => dispatcher.requeue_after(nonce, delay),
        SubmitOutcome::LostRace => {
            // Re-read later; the other writer may have stalled mid-attempt
            dispatcher.requeue_after(nonce, ctx.settings.retry.initial_backoff)
        }
        SubmitOutcome::Skipped | SubmitOutcome::AlreadyProcessed | SubmitOutcome::Failed(_) => {
            dispatcher.finished(nonce)
        }
    }
}
