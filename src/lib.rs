//! Bridge relayer
//!
//! Watches the bridge contract on a source chain for burn transfers and
//! mirrors each one as a mint on the destination chain, exactly once.

pub mod api;
pub mod config;
pub mod confirmation;
pub mod contracts;
pub mod db;
pub mod error;
pub mod gas;
pub mod ledger;
pub mod metrics;
pub mod relayer;
pub mod types;
pub mod watchers;
pub mod writers;

#[cfg(test)]
pub(crate) mod testing;
