//! Bridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge contract
//! deployed on both chains.

#![allow(clippy::too_many_arguments)]

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};

use crate::error::RelayError;

sol! {
    /// Bridge contract interface shared by the source and destination deployments
    #[sol(rpc)]
    contract BridgeBase {
        /// Emitted on burn (source side) and on mint (destination side)
        ///
        /// `step` is 0 for Burn and 1 for Mint.
        event Transfer(
            address from,
            address to,
            uint256 amount,
            uint256 date,
            uint256 nonce,
            bytes signature,
            uint8 indexed step
        );

        /// Mint tokens on the destination chain for a burn observed on the source chain.
        /// The contract verifies `signature` and rejects reused nonces.
        function mint(
            address from,
            address to,
            uint256 amount,
            uint256 nonce,
            bytes calldata signature
        ) external;

        /// Whether `nonce` from `from` has already been minted
        function processedNonces(address from, uint256 nonce) external view returns (bool);
    }
}

/// Default event signature relayed by the bridge
pub const TRANSFER_EVENT_SIGNATURE: &str = BridgeBase::Transfer::SIGNATURE;

/// `step` value of a burn on the source chain
pub const STEP_BURN: u8 = 0;

/// Decoded payload of a `Transfer` log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub date: U256,
    pub nonce: U256,
    pub signature: Bytes,
    pub step: u8,
}

/// Decode the non-indexed data and the indexed `step` of a `Transfer` log.
///
/// topics[0] = event signature, topics[1] = step
pub fn decode_transfer(topics: &[B256], data: &[u8]) -> Result<DecodedTransfer, RelayError> {
    let step_topic = topics
        .get(1)
        .ok_or_else(|| RelayError::MalformedLog("missing indexed step topic".to_string()))?;
    let step = U256::from_be_bytes(step_topic.0);
    let step: u8 = step
        .try_into()
        .map_err(|_| RelayError::MalformedLog(format!("step {} out of range", step)))?;

    let (from, to, amount, date, nonce, signature) =
        BridgeBase::Transfer::abi_decode_data(data, true)
            .map_err(|e| RelayError::MalformedLog(e.to_string()))?;

    Ok(DecodedTransfer {
        from,
        to,
        amount,
        date,
        nonce,
        signature,
        step,
    })
}

/// ABI-encode the destination `mint` call
pub fn encode_mint(from: Address, to: Address, amount: U256, nonce: U256, signature: Bytes) -> Bytes {
    BridgeBase::mintCall {
        from,
        to,
        amount,
        nonce,
        signature,
    }
    .abi_encode()
    .into()
}

/// Decode destination `mint` call data
pub fn decode_mint(data: &[u8]) -> Result<BridgeBase::mintCall, RelayError> {
    BridgeBase::mintCall::abi_decode(data, true).map_err(|e| RelayError::MalformedLog(e.to_string()))
}
