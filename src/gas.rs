//! Gas quoting for destination submissions
//!
//! Quotes carry a safety margin over the node's estimate. A quote for a
//! replacement transaction (same account nonce) is always strictly more
//! expensive than the one it replaces, otherwise nodes reject it as underpriced.

use alloy::primitives::Address;
use std::sync::Arc;
use tracing::debug;

use crate::error::RelayError;
use crate::ledger::{DestinationLedger, GasQuote, TxPayload};

/// Margins and limits applied to node quotes
#[derive(Debug, Clone)]
pub struct GasPolicy {
    pub price_margin_percent: u64,
    pub limit_margin_percent: u64,
    /// Minimum increase over the previous price for a replacement
    pub replacement_bump_percent: u64,
    /// Refuse to submit above this price (wei)
    pub max_gas_price: Option<u128>,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            price_margin_percent: 20,
            limit_margin_percent: 20,
            replacement_bump_percent: 12,
            max_gas_price: None,
        }
    }
}

/// `value * (100 + percent) / 100`, never less than `value`
pub fn apply_margin(value: u128, percent: u64) -> u128 {
    let factor = 100 + percent as u128;
    match value.checked_mul(factor) {
        Some(scaled) => scaled / 100,
        None => value.saturating_add((value / 100).saturating_mul(percent as u128)),
    }
}

/// Lowest price a replacement of `previous` may use, strictly above `previous`.
/// None when no such price exists.
pub fn replacement_floor(previous: u128, bump_percent: u64) -> Option<u128> {
    let higher = previous.checked_add(1)?;
    Some(apply_margin(previous, bump_percent).max(higher))
}

pub struct GasEstimator {
    ledger: Arc<dyn DestinationLedger>,
    policy: GasPolicy,
}

impl GasEstimator {
    pub fn new(ledger: Arc<dyn DestinationLedger>, policy: GasPolicy) -> Self {
        Self { ledger, policy }
    }

    /// Quote `payload`. With `previous`, the result replaces that attempt.
    pub async fn quote(
        &self,
        payload: &TxPayload,
        sender: Address,
        previous: Option<GasQuote>,
    ) -> Result<GasQuote, RelayError> {
        let (estimate, node_price) = tokio::try_join!(
            self.ledger.estimate_gas(payload, sender),
            self.ledger.current_gas_price()
        )?;

        let mut gas_price = apply_margin(node_price, self.policy.price_margin_percent);
        if let Some(previous) = previous {
            let floor = replacement_floor(previous.gas_price, self.policy.replacement_bump_percent)
                .ok_or(RelayError::GasPriceCapExceeded {
                    required: u128::MAX,
                    cap: self.policy.max_gas_price.unwrap_or(u128::MAX),
                })?;
            gas_price = gas_price.max(floor);
        }

        if let Some(cap) = self.policy.max_gas_price {
            if gas_price > cap {
                return Err(RelayError::GasPriceCapExceeded {
                    required: gas_price,
                    cap,
                });
            }
        }

        let gas_limit = apply_margin(estimate as u128, self.policy.limit_margin_percent)
            .min(u64::MAX as u128) as u64;

        debug!(
            estimate,
            node_price,
            gas_limit,
            gas_price,
            replacement = previous.is_some(),
            "Gas quote"
        );

        Ok(GasQuote {
            gas_price,
            gas_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDestination;

    fn payload() -> TxPayload {
        TxPayload {
            to: Address::repeat_byte(0x99),
            data: Default::default(),
        }
    }

    #[test]
    fn test_apply_margin() {
        assert_eq!(apply_margin(100, 20), 120);
        assert_eq!(apply_margin(21_000, 0), 21_000);
        assert_eq!(apply_margin(u128::MAX, 20), u128::MAX);

        let huge = u128::MAX / 110;
        assert!(apply_margin(huge, 20) > huge);
        assert_eq!(apply_margin(huge, 0), huge);
    }

    #[test]
    fn test_replacement_floor_is_strictly_higher() {
        assert_eq!(replacement_floor(1_000, 12), Some(1_120));
        // integer rounding would otherwise keep tiny prices flat
        assert_eq!(replacement_floor(1, 12), Some(2));
        assert_eq!(replacement_floor(5, 0), Some(6));

        let huge = u128::MAX / 110;
        assert!(replacement_floor(huge, 12).unwrap() > huge);
        assert_eq!(replacement_floor(u128::MAX - 1, 12), Some(u128::MAX));
        assert_eq!(replacement_floor(u128::MAX, 12), None);
    }

    #[tokio::test]
    async fn test_quote_applies_margins() {
        let ledger = Arc::new(MockDestination::new());
        ledger.set_gas_price(1_000);
        ledger.set_gas_estimate(50_000);
        let estimator = GasEstimator::new(ledger, GasPolicy::default());

        let quote = estimator
            .quote(&payload(), Address::ZERO, None)
            .await
            .unwrap();
        assert_eq!(quote.gas_price, 1_200);
        assert_eq!(quote.gas_limit, 60_000);
    }

    #[tokio::test]
    async fn test_replacement_outbids_previous_attempt() {
        let ledger = Arc::new(MockDestination::new());
        ledger.set_gas_price(1_000);
        let estimator = GasEstimator::new(ledger.clone(), GasPolicy::default());

        let previous = GasQuote {
            gas_price: 5_000,
            gas_limit: 60_000,
        };
        let quote = estimator
            .quote(&payload(), Address::ZERO, Some(previous))
            .await
            .unwrap();
        assert_eq!(quote.gas_price, 5_600);

        // network price spiked above the bump: the market price wins
        ledger.set_gas_price(10_000);
        let quote = estimator
            .quote(&payload(), Address::ZERO, Some(previous))
            .await
            .unwrap();
        assert_eq!(quote.gas_price, 12_000);
    }

    #[tokio::test]
    async fn test_quote_respects_price_cap() {
        let ledger = Arc::new(MockDestination::new());
        ledger.set_gas_price(1_000);
        let policy = GasPolicy {
            max_gas_price: Some(1_100),
            ..GasPolicy::default()
        };
        let estimator = GasEstimator::new(ledger, policy);

        let err = estimator
            .quote(&payload(), Address::ZERO, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RelayError::GasPriceCapExceeded {
                required: 1_200,
                cap: 1_100
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_replacement_of_maximum_price_is_refused() {
        let ledger = Arc::new(MockDestination::new());
        let estimator = GasEstimator::new(ledger, GasPolicy::default());

        let previous = GasQuote {
            gas_price: u128::MAX,
            gas_limit: 60_000,
        };
        let err = estimator
            .quote(&payload(), Address::ZERO, Some(previous))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::GasPriceCapExceeded { .. }));
    }

    #[tokio::test]
    async fn test_estimation_revert_propagates() {
        let ledger = Arc::new(MockDestination::new());
        ledger.fail_estimation(RelayError::EstimationRevert("execution reverted".into()));
        let estimator = GasEstimator::new(ledger, GasPolicy::default());

        let err = estimator
            .quote(&payload(), Address::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::EstimationRevert(_)));
    }
}
