//! Prometheus metrics for the bridge relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};

lazy_static! {
    // Scanning
    pub static ref SOURCE_HEAD: Gauge = register_gauge!(
        "relayer_source_head_block",
        "Latest source block reported by the node"
    ).unwrap();

    pub static ref SCAN_CURSOR: Gauge = register_gauge!(
        "relayer_scan_cursor_block",
        "Last source block whose events are all resolved"
    ).unwrap();

    pub static ref EVENTS_OBSERVED: Counter = register_counter!(
        "relayer_events_observed_total",
        "Burn events decoded from the source chain (including rescans)"
    ).unwrap();

    pub static ref MALFORMED_LOGS: Counter = register_counter!(
        "relayer_malformed_logs_total",
        "Logs matching the filter that could not be decoded"
    ).unwrap();

    pub static ref TRANSFERS_ADMITTED: Counter = register_counter!(
        "relayer_transfers_admitted_total",
        "Transfers written as pending records"
    ).unwrap();

    // Submission
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Submission attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref IN_FLIGHT: Gauge = register_gauge!(
        "relayer_submissions_in_flight",
        "Submission workers currently running"
    ).unwrap();

    pub static ref CONFIRMATIONS: Counter = register_counter!(
        "relayer_confirmations_total",
        "Mints confirmed on the destination chain"
    ).unwrap();

    pub static ref FAILURES: CounterVec = register_counter_vec!(
        "relayer_failures_total",
        "Transfers marked failed, by reason",
        &["reason"]
    ).unwrap();

    pub static ref TIME_TO_SUBMIT: Histogram = register_histogram!(
        "relayer_time_to_submit_seconds",
        "Time from admission to accepted submission",
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Health
    pub static ref RELAYER_BALANCE: Gauge = register_gauge!(
        "relayer_account_balance_wei",
        "Native balance of the relayer account on the destination chain"
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is running (1 = up)"
    ).unwrap();
}

/// Short failure label for the `reason` dimension
pub fn failure_label(reason: &str) -> &'static str {
    if reason.starts_with("SubmissionRevert") {
        "revert"
    } else if reason.starts_with("max attempts") {
        "max_attempts"
    } else {
        "other"
    }
}
