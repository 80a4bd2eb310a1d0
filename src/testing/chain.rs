use std::collections::HashMap;
use std::sync::Mutex;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::Result;

use crate::chain::{
    ChainClient, ChainError, ClaimMessageParams, ClaimReceipt, GasFees, MessageSentEvent,
    MessageSentFilter, RateLimitState, RevertReason, SubmittedClaim, TxOverrides,
};
use crate::types::OnChainMessageStatus;

#[derive(Default)]
struct MockState {
    block_number: u64,
    events: Vec<MessageSentEvent>,
    requested_ranges: Vec<MessageSentFilter>,
    logs_error: Option<ChainError>,
    receipt_error: Option<ChainError>,
    status_error: Option<ChainError>,
    receipts: HashMap<B256, ClaimReceipt>,
    statuses: HashMap<B256, OnChainMessageStatus>,
    claim_gas: u64,
    estimate_error: Option<ChainError>,
    submit_error: Option<ChainError>,
    submissions: Vec<(ClaimMessageParams, TxOverrides)>,
    resubmit_error: Option<ChainError>,
    resubmissions: Vec<B256>,
    signer_nonce: u64,
    fees: Option<GasFees>,
    rate_limit: Option<RateLimitState>,
    revert_reasons: HashMap<B256, RevertReason>,
    next_tx: u64,
}

/// Scripted chain client
pub struct MockChainClient {
    state: Mutex<MockState>,
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                claim_gas: 70_000,
                fees: Some(GasFees {
                    max_fee_per_gas: 50_000,
                    max_priority_fee_per_gas: 1_000,
                }),
                ..Default::default()
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_block_number(&self, block_number: u64) {
        self.with_state(|s| s.block_number = block_number);
    }

    pub fn push_event(&self, event: MessageSentEvent) {
        self.with_state(|s| s.events.push(event));
    }

    pub fn requested_ranges(&self) -> Vec<MessageSentFilter> {
        self.with_state(|s| s.requested_ranges.clone())
    }

    pub fn set_receipt(&self, receipt: ClaimReceipt) {
        self.with_state(|s| s.receipts.insert(receipt.transaction_hash, receipt));
    }

    pub fn set_message_status(&self, message_hash: B256, status: OnChainMessageStatus) {
        self.with_state(|s| s.statuses.insert(message_hash, status));
    }

    pub fn set_claim_gas(&self, gas: u64) {
        self.with_state(|s| s.claim_gas = gas);
    }

    pub fn fail_estimation(&self, error: ChainError) {
        self.with_state(|s| s.estimate_error = Some(error));
    }

    pub fn fail_submission(&self, error: ChainError) {
        self.with_state(|s| s.submit_error = Some(error));
    }

    pub fn fail_resubmission(&self, error: ChainError) {
        self.with_state(|s| s.resubmit_error = Some(error));
    }

    pub fn fail_logs(&self, error: ChainError) {
        self.with_state(|s| s.logs_error = Some(error));
    }

    pub fn fail_receipts(&self, error: ChainError) {
        self.with_state(|s| s.receipt_error = Some(error));
    }

    pub fn fail_message_status(&self, error: ChainError) {
        self.with_state(|s| s.status_error = Some(error));
    }

    /// Drop every scripted failure
    pub fn clear_failures(&self) {
        self.with_state(|s| {
            s.logs_error = None;
            s.receipt_error = None;
            s.status_error = None;
            s.estimate_error = None;
            s.submit_error = None;
            s.resubmit_error = None;
        });
    }

    pub fn submissions(&self) -> Vec<(ClaimMessageParams, TxOverrides)> {
        self.with_state(|s| s.submissions.clone())
    }

    pub fn resubmissions(&self) -> Vec<B256> {
        self.with_state(|s| s.resubmissions.clone())
    }

    pub fn set_signer_nonce(&self, nonce: u64) {
        self.with_state(|s| s.signer_nonce = nonce);
    }

    pub fn set_fees(&self, fees: GasFees) {
        self.with_state(|s| s.fees = Some(fees));
    }

    pub fn set_rate_limit(&self, state: RateLimitState) {
        self.with_state(|s| s.rate_limit = Some(state));
    }

    pub fn set_revert_reason(&self, tx_hash: B256, reason: RevertReason) {
        self.with_state(|s| s.revert_reasons.insert(tx_hash, reason));
    }

    fn next_tx_hash(state: &mut MockState) -> B256 {
        state.next_tx += 1;
        B256::left_padding_from(&state.next_tx.to_be_bytes())
    }
}

/// A `MessageSent` event with plausible defaults
pub fn sent_event(message_hash: B256, block_number: u64, log_index: u64) -> MessageSentEvent {
    MessageSentEvent {
        message_hash,
        message_sender: Address::repeat_byte(0xaa),
        destination: Address::repeat_byte(0xbb),
        fee: U256::from(10_000_000_000_000u64),
        value: U256::ZERO,
        message_nonce: U256::from(block_number * 100 + log_index),
        calldata: Bytes::new(),
        contract_address: Address::repeat_byte(0xcc),
        block_number,
        log_index,
        transaction_hash: B256::repeat_byte(0xee),
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn current_block_number(&self) -> Result<u64> {
        Ok(self.with_state(|s| s.block_number))
    }

    async fn message_sent_events(&self, filter: &MessageSentFilter) -> Result<Vec<MessageSentEvent>> {
        self.with_state(|s| {
            s.requested_ranges.push(*filter);
            if let Some(e) = &s.logs_error {
                return Err(e.clone().into());
            }
            let mut events: Vec<_> = s
                .events
                .iter()
                .filter(|e| e.block_number >= filter.from_block && e.block_number <= filter.to_block)
                .cloned()
                .collect();
            events.sort_by_key(|e| (e.block_number, e.log_index));
            Ok(events)
        })
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<ClaimReceipt>> {
        self.with_state(|s| match &s.receipt_error {
            Some(e) => Err(e.clone().into()),
            None => Ok(s.receipts.get(&tx_hash).copied()),
        })
    }

    async fn message_status(
        &self,
        message_hash: B256,
        _block_number: Option<u64>,
    ) -> Result<OnChainMessageStatus> {
        self.with_state(|s| match &s.status_error {
            Some(e) => Err(e.clone().into()),
            None => Ok(s
                .statuses
                .get(&message_hash)
                .copied()
                .unwrap_or(OnChainMessageStatus::Unknown)),
        })
    }

    async fn estimate_claim_gas(&self, _params: &ClaimMessageParams) -> Result<u64> {
        self.with_state(|s| match &s.estimate_error {
            Some(e) => Err(e.clone().into()),
            None => Ok(s.claim_gas),
        })
    }

    async fn submit_claim(
        &self,
        params: &ClaimMessageParams,
        overrides: &TxOverrides,
    ) -> Result<B256> {
        self.with_state(|s| {
            if let Some(e) = &s.submit_error {
                return Err(e.clone().into());
            }
            s.submissions.push((params.clone(), *overrides));
            Ok(Self::next_tx_hash(s))
        })
    }

    async fn resubmit_with_higher_fee(&self, tx_hash: B256) -> Result<SubmittedClaim> {
        self.with_state(|s| {
            if let Some(e) = &s.resubmit_error {
                return Err(e.clone().into());
            }
            s.resubmissions.push(tx_hash);
            let new_hash = Self::next_tx_hash(s);
            Ok(SubmittedClaim {
                tx_hash: new_hash,
                nonce: 0,
                gas_limit: s.claim_gas,
                max_fee_per_gas: 55_000,
                max_priority_fee_per_gas: 1_100,
            })
        })
    }

    async fn signer_nonce(&self) -> Result<u64> {
        Ok(self.with_state(|s| s.signer_nonce))
    }

    async fn fee_estimate(&self) -> Result<GasFees> {
        self.with_state(|s| {
            s.fees
                .ok_or_else(|| ChainError::gas_fee("no fee history").into())
        })
    }

    async fn rate_limit_state(&self) -> Result<RateLimitState> {
        self.with_state(|s| {
            s.rate_limit
                .ok_or_else(|| eyre::eyre!("rate limiter not configured"))
        })
    }

    async fn revert_reason(&self, tx_hash: B256) -> Result<Option<RevertReason>> {
        Ok(self.with_state(|s| s.revert_reasons.get(&tx_hash).cloned()))
    }
}
