//! Chain access for the relay
//!
//! Everything the pollers need from a chain goes through [`ChainClient`]. The
//! production implementation is [`evm::EvmChainClient`]; tests script a mock.

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::Result;

use crate::db::Message;
use crate::types::OnChainMessageStatus;

pub mod error;
pub mod evm;
pub mod fees;
pub mod rate_limit;

pub use error::ChainError;
pub use fees::{FeeCache, GasFees};
pub use rate_limit::{MessageServiceRateLimit, NoRateLimit, RateLimitPolicy};

/// A decoded `MessageSent` log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSentEvent {
    pub message_hash: B256,
    pub message_sender: Address,
    pub destination: Address,
    pub fee: U256,
    pub value: U256,
    pub message_nonce: U256,
    pub calldata: Bytes,
    pub contract_address: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
}

/// Inclusive block range for log queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSentFilter {
    pub from_block: u64,
    pub to_block: u64,
}

/// Arguments of the message service's `claimMessage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMessageParams {
    pub message_sender: Address,
    pub destination: Address,
    pub fee: U256,
    pub value: U256,
    pub fee_recipient: Address,
    pub calldata: Bytes,
    pub message_nonce: U256,
}

impl ClaimMessageParams {
    /// Without a configured recipient the contract pays the fee to the caller
    pub fn from_message(message: &Message, fee_recipient: Option<Address>) -> Self {
        Self {
            message_sender: message.message_sender,
            destination: message.destination,
            fee: message.fee,
            value: message.value,
            fee_recipient: fee_recipient.unwrap_or(Address::ZERO),
            calldata: message.calldata.clone(),
            message_nonce: message.message_nonce,
        }
    }
}

/// Explicit transaction fields for a claim submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOverrides {
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Outcome of a mined claim transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub success: bool,
    pub gas_used: u64,
}

/// A broadcast claim transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedClaim {
    pub tx_hash: B256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl SubmittedClaim {
    pub fn new(tx_hash: B256, overrides: &TxOverrides) -> Self {
        Self {
            tx_hash,
            nonce: overrides.nonce,
            gas_limit: overrides.gas_limit,
            max_fee_per_gas: overrides.max_fee_per_gas,
            max_priority_fee_per_gas: overrides.max_priority_fee_per_gas,
        }
    }
}

/// Withdrawal limit of the receiving message service for the current period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    pub limit: U256,
    pub current_period_amount: U256,
}

/// Why a claim transaction reverted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    RateLimitExceeded,
    Other(String),
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_block_number(&self) -> Result<u64>;

    /// `MessageSent` logs emitted by this chain's message service
    async fn message_sent_events(&self, filter: &MessageSentFilter) -> Result<Vec<MessageSentEvent>>;

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<ClaimReceipt>>;

    /// Status of an inbound message; `None` queries the latest block
    async fn message_status(
        &self,
        message_hash: B256,
        block_number: Option<u64>,
    ) -> Result<OnChainMessageStatus>;

    async fn estimate_claim_gas(&self, params: &ClaimMessageParams) -> Result<u64>;

    async fn submit_claim(&self, params: &ClaimMessageParams, overrides: &TxOverrides)
        -> Result<B256>;

    /// Re-sign a stuck transaction with the same nonce and bumped fees
    async fn resubmit_with_higher_fee(&self, tx_hash: B256) -> Result<SubmittedClaim>;

    async fn signer_nonce(&self) -> Result<u64>;

    async fn fee_estimate(&self) -> Result<GasFees>;

    async fn rate_limit_state(&self) -> Result<RateLimitState>;

    /// Decoded custom error of a reverted transaction, if any
    async fn revert_reason(&self, tx_hash: B256) -> Result<Option<RevertReason>>;
}
