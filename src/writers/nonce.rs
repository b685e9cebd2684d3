use alloy::primitives::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::RelayError;
use crate::ledger::DestinationLedger;

/// Hands out destination account nonces to submission workers.
///
/// Nonces are allocated locally so parallel workers never wait on each other.
/// Only a nonce conflict reported by the node resets the counter; other
/// resynchronisation moves it forward, since workers may hold allocations
/// they have not broadcast yet.
pub struct NonceAllocator {
    ledger: Arc<dyn DestinationLedger>,
    account: Address,
    next: AtomicU64,
}

impl NonceAllocator {
    pub fn new(ledger: Arc<dyn DestinationLedger>, account: Address) -> Self {
        Self {
            ledger,
            account,
            next: AtomicU64::new(0),
        }
    }

    /// Reset to the node's pending nonce for the relayer account
    pub async fn resync(&self) -> Result<u64, RelayError> {
        let pending = self.ledger.pending_nonce(self.account).await?;
        let previous = self.next.swap(pending, Ordering::SeqCst);
        if previous != pending {
            info!(account = %self.account, previous, pending, "Account nonce resynchronised");
        }
        Ok(pending)
    }

    /// Move up to the node's pending nonce, never below an allocation already handed out
    pub async fn advance(&self) -> Result<u64, RelayError> {
        let pending = self.ledger.pending_nonce(self.account).await?;
        let previous = self.next.fetch_max(pending, Ordering::SeqCst);
        if pending > previous {
            info!(account = %self.account, previous, pending, "Account nonce advanced");
        }
        Ok(previous.max(pending))
    }

    /// Give back `nonce` if it is the latest allocation. Returns whether it was taken back.
    pub fn release(&self, nonce: u64) -> bool {
        self.next
            .compare_exchange(nonce + 1, nonce, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
