//! Claim transaction sender
//!
//! Picks the best anchored message for a direction, checks that claiming it is
//! worth the gas and allowed by the receiving chain, then submits the claim with
//! an explicit nonce. Marking the message PENDING and broadcasting happen inside
//! one store transaction.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;
use eyre::Result;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::chain::{
    ChainClient, ClaimMessageParams, RateLimitPolicy, SubmittedClaim, TxOverrides,
};
use crate::config::ClaimingConfig;
use crate::db::{ClaimCandidateQuery, Message, MessageRepository, MessageUpdate};
use crate::error_parser::ParsedError;
use crate::poller::Poller;
use crate::types::{Direction, MessageKey, MessageStatus, OnChainMessageStatus};

/// Profit margin is applied in basis points to keep the comparison integral
const MARGIN_SCALE: u64 = 10_000;

pub struct ClaimTxSender {
    direction: Direction,
    /// Client of the receiving chain
    client: Arc<dyn ChainClient>,
    repository: Arc<dyn MessageRepository>,
    rate_limit: Arc<dyn RateLimitPolicy>,
    /// Message service on the sending chain
    sending_contract: Address,
    config: ClaimingConfig,
    polling_interval: Duration,
    /// Message being processed by the current tick
    in_flight: Option<MessageKey>,
}

impl ClaimTxSender {
    pub fn new(
        direction: Direction,
        client: Arc<dyn ChainClient>,
        repository: Arc<dyn MessageRepository>,
        rate_limit: Arc<dyn RateLimitPolicy>,
        sending_contract: Address,
        config: ClaimingConfig,
        polling_interval: Duration,
    ) -> Self {
        Self {
            direction,
            client,
            repository,
            rate_limit,
            sending_contract,
            config,
            polling_interval,
            in_flight: None,
        }
    }

    /// Nonce for the next claim, or `None` when the signer lags too far behind
    /// the nonces already handed out
    pub async fn get_nonce(&self) -> Result<Option<u64>> {
        let on_chain = self.client.signer_nonce().await?;
        let last_recorded = self.repository.last_claim_tx_nonce(self.direction).await?;

        let Some(last) = last_recorded else {
            return Ok(Some(on_chain));
        };

        if last.saturating_sub(on_chain) > self.config.max_nonce_diff {
            warn!(
                direction = %self.direction,
                on_chain_nonce = on_chain,
                last_recorded_nonce = last,
                max_nonce_diff = self.config.max_nonce_diff,
                "Nonce gap too large, halting claims"
            );
            return Ok(None);
        }

        Ok(Some(on_chain.max(last + 1)))
    }

    /// `gas_limit * max_fee_per_gas * profit_margin > fee`
    pub fn is_transaction_underpriced(&self, gas_limit: u64, max_fee_per_gas: u128, fee: U256) -> bool {
        let margin = U256::from((self.config.profit_margin * MARGIN_SCALE as f64).round().max(0.0) as u64);
        let cost = U256::from(gas_limit)
            .saturating_mul(U256::from(max_fee_per_gas))
            .saturating_mul(margin);

        cost > fee.saturating_mul(U256::from(MARGIN_SCALE))
    }

    async fn set_status(&self, message: &Message, status: MessageStatus) -> Result<()> {
        self.repository
            .update_by_key(message.key(), &MessageUpdate::status(status))
            .await?;
        info!(
            direction = %self.direction,
            message_hash = %message.message_hash,
            from = %message.status,
            to = %status,
            "Message status updated"
        );
        Ok(())
    }

    async fn process(&mut self, nonce: u64) -> Result<()> {
        let fees = self.client.fee_estimate().await?;

        let query = ClaimCandidateQuery {
            direction: self.direction,
            contract_address: self.sending_contract,
            current_gas_price: fees.max_fee_per_gas,
            profit_margin: self.config.profit_margin,
            max_retry: self.config.max_number_of_retries,
            retry_delay: self.config.retry_delay(),
        };
        let Some(message) = self.repository.first_message_to_claim(&query).await? else {
            debug!(direction = %self.direction, "No message to claim");
            return Ok(());
        };
        self.in_flight = Some(message.key());

        if message.fee.is_zero() && self.config.profit_margin != 0.0 {
            return self.set_status(&message, MessageStatus::ZeroFee).await;
        }

        let on_chain = self.client.message_status(message.message_hash, None).await?;
        if on_chain == OnChainMessageStatus::Claimed {
            return self.set_status(&message, MessageStatus::ClaimedSuccess).await;
        }

        let params = ClaimMessageParams::from_message(&message, self.config.fee_recipient);
        let gas_limit = self.client.estimate_claim_gas(&params).await?;

        let threshold = u256_to_f64(message.fee) / gas_limit.max(1) as f64;
        self.repository
            .update_by_key(message.key(), &MessageUpdate::gas_estimation_threshold(Some(threshold)))
            .await?;

        if gas_limit > self.config.max_claim_gas_limit {
            warn!(
                direction = %self.direction,
                message_hash = %message.message_hash,
                gas_limit,
                max_claim_gas_limit = self.config.max_claim_gas_limit,
                "Claim gas limit exceeds maximum"
            );
            return self.set_status(&message, MessageStatus::NonExecutable).await;
        }

        if self.is_transaction_underpriced(gas_limit, fees.max_fee_per_gas, message.fee) {
            let update = MessageUpdate {
                status: Some(MessageStatus::FeeUnderpriced),
                claim_number_of_retry: Some(message.claim_number_of_retry + 1),
                claim_last_retried_at: Some(Utc::now()),
                ..Default::default()
            };
            self.repository.update_by_key(message.key(), &update).await?;
            info!(
                direction = %self.direction,
                message_hash = %message.message_hash,
                fee = %message.fee,
                gas_limit,
                max_fee_per_gas = fees.max_fee_per_gas,
                retry = message.claim_number_of_retry + 1,
                "Message fee underpriced"
            );
            return Ok(());
        }

        if self.rate_limit.is_rate_limit_exceeded(message.fee, message.value).await? {
            self.repository
                .update_by_key(message.key(), &MessageUpdate::gas_estimation_threshold(None))
                .await?;
            warn!(
                direction = %self.direction,
                message_hash = %message.message_hash,
                value = %message.value,
                "Rate limit would be exceeded, postponing claim"
            );
            return Ok(());
        }

        let overrides = TxOverrides {
            nonce,
            gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
        };

        let mut pending = MessageUpdate {
            status: Some(MessageStatus::Pending),
            claim_tx_creation_date: Some(Utc::now()),
            claim_tx_gas_limit: Some(gas_limit),
            claim_tx_max_fee_per_gas: Some(fees.max_fee_per_gas),
            claim_tx_max_priority_fee_per_gas: Some(fees.max_priority_fee_per_gas),
            claim_tx_nonce: Some(nonce),
            ..Default::default()
        };
        if message.status == MessageStatus::FeeUnderpriced {
            pending.claim_number_of_retry = Some(message.claim_number_of_retry + 1);
            pending.claim_last_retried_at = Some(Utc::now());
        }

        let client = self.client.clone();
        let submit: BoxFuture<'_, Result<SubmittedClaim>> = Box::pin(async move {
            let tx_hash = client.submit_claim(&params, &overrides).await?;
            Ok(SubmittedClaim::new(tx_hash, &overrides))
        });
        let submitted = self
            .repository
            .claim_atomically(message.key(), pending, submit)
            .await?;

        info!(
            direction = %self.direction,
            message_hash = %message.message_hash,
            tx_hash = %submitted.tx_hash,
            nonce,
            gas_limit,
            max_fee_per_gas = fees.max_fee_per_gas,
            "Claim transaction sent"
        );
        Ok(())
    }
}

fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::MAX)
}

#[async_trait]
impl Poller for ClaimTxSender {
    fn name(&self) -> String {
        format!("ClaimTxSender[{}]", self.direction)
    }

    fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    async fn tick(&mut self) -> Result<()> {
        self.in_flight = None;

        let Some(nonce) = self.get_nonce().await? else {
            return Ok(());
        };

        self.process(nonce).await?;
        self.in_flight = None;
        Ok(())
    }

    async fn on_tick_error(&mut self, _error: &eyre::Report, parsed: &ParsedError) {
        let Some(key) = self.in_flight.take() else {
            return;
        };
        if parsed.mitigation.should_retry {
            return;
        }

        warn!(
            direction = %self.direction,
            message_hash = %key.message_hash,
            code = %parsed.code,
            "Claim cannot be executed, marking message non-executable"
        );
        if let Err(e) = self
            .repository
            .update_by_key(key, &MessageUpdate::status(MessageStatus::NonExecutable))
            .await
        {
            error!(message = %key, error = %e, "Failed to mark message non-executable");
        }
    }
}
