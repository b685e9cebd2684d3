//! Relay error taxonomy
//!
//! Ledger clients translate RPC failures into these categories so the engine
//! can decide between retrying, failing a single record, or stopping the process.

use std::time::Duration;
use thiserror::Error;

use crate::writers::retry::{classify_error, ErrorClass};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// RPC timeouts, dropped connections, rate limits. Retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The destination call would revert (duplicate nonce, bad signature, ...)
    #[error("gas estimation reverted: {0}")]
    EstimationRevert(String),

    #[error("submission reverted: {0}")]
    SubmissionRevert(String),

    #[error("submission timed out after {0:?}")]
    SubmissionTimeout(Duration),

    #[error("confirmation timed out after {0:?}")]
    ConfirmationTimeout(Duration),

    /// The destination account nonce was already used or is ahead of the node
    #[error("account nonce conflict: {0}")]
    NonceConflict(String),

    #[error("gas price {required} exceeds configured cap {cap}")]
    GasPriceCapExceeded { required: u128, cap: u128 },

    /// Unrecoverable log filter error, e.g. a malformed event signature
    #[error("invalid event filter: {0}")]
    Filter(String),

    #[error("malformed event log: {0}")]
    MalformedLog(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl RelayError {
    /// Errors that clear up on their own and only warrant a retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::TransientNetwork(_)
                | RelayError::SubmissionTimeout(_)
                | RelayError::ConfirmationTimeout(_)
                | RelayError::NonceConflict(_)
                | RelayError::GasPriceCapExceeded { .. }
        )
    }

    /// Transient errors worth retrying within one attempt. A price above the cap
    /// does not clear within a backoff, so it waits for the next attempt.
    pub fn is_retryable_now(&self) -> bool {
        self.is_transient() && !matches!(self, RelayError::GasPriceCapExceeded { .. })
    }

    /// Errors that must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Filter(_) | RelayError::FatalConfig(_))
    }

    /// Map an RPC error message from gas estimation
    pub fn from_estimation_message(message: &str) -> Self {
        match classify_error(message) {
            ErrorClass::Permanent => RelayError::EstimationRevert(message.to_string()),
            _ => RelayError::TransientNetwork(message.to_string()),
        }
    }

    /// Map an RPC error message from transaction submission
    pub fn from_submission_message(message: &str) -> Self {
        match classify_error(message) {
            ErrorClass::Permanent => RelayError::SubmissionRevert(message.to_string()),
            ErrorClass::NonceTooLow | ErrorClass::NonceTooHigh => {
                RelayError::NonceConflict(message.to_string())
            }
            ErrorClass::Transient
            | ErrorClass::Underpriced
            | ErrorClass::InsufficientFunds
            | ErrorClass::Unknown => RelayError::TransientNetwork(message.to_string()),
        }
    }

    /// Map an RPC error message from log queries
    pub fn from_filter_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("invalid params")
            || lower.contains("invalid argument")
            || lower.contains("invalid topic")
            || lower.contains("invalid filter")
        {
            RelayError::Filter(message.to_string())
        } else {
            RelayError::TransientNetwork(message.to_string())
        }
    }
}
