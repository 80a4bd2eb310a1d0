//! Claim status watcher
//!
//! Follows the oldest PENDING claim of a direction until its receipt settles
//! the message. Claims stuck in the mempool past the submission timeout are
//! replaced with the same nonce and higher fees.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::Utc;
use eyre::Result;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, RateLimitPolicy};
use crate::db::{Message, MessageRepository, MessageUpdate};
use crate::error_parser::ParsedError;
use crate::poller::Poller;
use crate::types::{Direction, MessageKey, MessageStatus};

pub struct ClaimStatusWatcher {
    direction: Direction,
    /// Client of the receiving chain
    client: Arc<dyn ChainClient>,
    repository: Arc<dyn MessageRepository>,
    rate_limit: Arc<dyn RateLimitPolicy>,
    message_submission_timeout: Duration,
    polling_interval: Duration,
    in_flight: Option<MessageKey>,
}

impl ClaimStatusWatcher {
    pub fn new(
        direction: Direction,
        client: Arc<dyn ChainClient>,
        repository: Arc<dyn MessageRepository>,
        rate_limit: Arc<dyn RateLimitPolicy>,
        message_submission_timeout: Duration,
        polling_interval: Duration,
    ) -> Self {
        Self {
            direction,
            client,
            repository,
            rate_limit,
            message_submission_timeout,
            polling_interval,
            in_flight: None,
        }
    }

    fn is_timed_out(&self, message: &Message) -> bool {
        let elapsed = Utc::now().signed_duration_since(message.updated_at);
        elapsed
            .to_std()
            .map(|elapsed| elapsed > self.message_submission_timeout)
            .unwrap_or(false)
    }

    async fn resubmit(&self, message: &Message, tx_hash: B256) -> Result<()> {
        match self.client.resubmit_with_higher_fee(tx_hash).await {
            Ok(submitted) => {
                let update = MessageUpdate {
                    claim_tx_hash: Some(submitted.tx_hash),
                    claim_tx_nonce: Some(submitted.nonce),
                    claim_tx_gas_limit: Some(submitted.gas_limit),
                    claim_tx_max_fee_per_gas: Some(submitted.max_fee_per_gas),
                    claim_tx_max_priority_fee_per_gas: Some(submitted.max_priority_fee_per_gas),
                    claim_number_of_retry: Some(message.claim_number_of_retry + 1),
                    claim_last_retried_at: Some(Utc::now()),
                    ..Default::default()
                };
                self.repository
                    .update_by_claim_tx_hash(tx_hash, self.direction, &update)
                    .await?;

                info!(
                    direction = %self.direction,
                    message_hash = %message.message_hash,
                    old_tx_hash = %tx_hash,
                    new_tx_hash = %submitted.tx_hash,
                    retry = message.claim_number_of_retry + 1,
                    "Stuck claim resubmitted"
                );
            }
            Err(e) => {
                error!(
                    direction = %self.direction,
                    message_hash = %message.message_hash,
                    tx_hash = %tx_hash,
                    error = %format!("{:#}", e),
                    "Claim resubmission failed, marking message non-executable"
                );
                self.repository
                    .update_by_key(message.key(), &MessageUpdate::status(MessageStatus::NonExecutable))
                    .await?;
            }
        }
        Ok(())
    }

    async fn settle(&self, message: &Message, tx_hash: B256, success: bool) -> Result<()> {
        let update = if success {
            MessageUpdate::status(MessageStatus::ClaimedSuccess)
        } else if self.rate_limit.is_rate_limit_exceeded_error(tx_hash).await? {
            warn!(
                direction = %self.direction,
                message_hash = %message.message_hash,
                tx_hash = %tx_hash,
                "Claim reverted on rate limit, returning message to SENT"
            );
            MessageUpdate {
                status: Some(MessageStatus::Sent),
                claim_gas_estimation_threshold: Some(None),
                ..Default::default()
            }
        } else {
            MessageUpdate::status(MessageStatus::ClaimedReverted)
        };

        self.repository.update_by_key(message.key(), &update).await?;
        info!(
            direction = %self.direction,
            message_hash = %message.message_hash,
            tx_hash = %tx_hash,
            status = ?update.status,
            "Claim transaction settled"
        );
        Ok(())
    }
}

#[async_trait]
impl Poller for ClaimStatusWatcher {
    fn name(&self) -> String {
        format!("ClaimStatusWatcher[{}]", self.direction)
    }

    fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    async fn tick(&mut self) -> Result<()> {
        self.in_flight = None;

        let Some(message) = self.repository.first_pending_message(self.direction).await? else {
            return Ok(());
        };
        let Some(tx_hash) = message.claim_tx_hash else {
            debug!(
                direction = %self.direction,
                message_hash = %message.message_hash,
                "Pending message has no claim transaction yet"
            );
            return Ok(());
        };
        self.in_flight = Some(message.key());

        match self.client.transaction_receipt(tx_hash).await? {
            Some(receipt) => self.settle(&message, tx_hash, receipt.success).await?,
            None if self.is_timed_out(&message) => {
                warn!(
                    direction = %self.direction,
                    message_hash = %message.message_hash,
                    tx_hash = %tx_hash,
                    nonce = ?message.claim_tx_nonce,
                    "Claim transaction not mined before timeout"
                );
                self.resubmit(&message, tx_hash).await?;
            }
            None => {
                debug!(
                    direction = %self.direction,
                    tx_hash = %tx_hash,
                    "Claim transaction still pending"
                );
            }
        }

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

        if let Err(e) = self
            .repository
            .update_by_key(key, &MessageUpdate::status(MessageStatus::NonExecutable))
            .await
        {
            error!(message = %key, error = %e, "Failed to mark message non-executable");
        }
    }
}
