//! Promotes SENT messages once the receiving chain reports them claimable

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::db::MessageRepository;
use crate::poller::Poller;
use crate::types::{Direction, MessageStatus, OnChainMessageStatus};

pub struct AnchoredEventListener {
    direction: Direction,
    /// Client of the receiving chain
    client: Arc<dyn ChainClient>,
    repository: Arc<dyn MessageRepository>,
    /// Message service on the sending chain
    contract_address: Address,
    max_fetch_messages_from_db: u32,
    polling_interval: Duration,
}

impl AnchoredEventListener {
    pub fn new(
        direction: Direction,
        client: Arc<dyn ChainClient>,
        repository: Arc<dyn MessageRepository>,
        contract_address: Address,
        max_fetch_messages_from_db: u32,
        polling_interval: Duration,
    ) -> Self {
        Self {
            direction,
            client,
            repository,
            contract_address,
            max_fetch_messages_from_db,
            polling_interval,
        }
    }
}

#[async_trait]
impl Poller for AnchoredEventListener {
    fn name(&self) -> String {
        format!("AnchoredEventListener[{}]", self.direction)
    }

    fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    async fn tick(&mut self) -> Result<()> {
        let messages = self
            .repository
            .first_n_sent(self.direction, self.max_fetch_messages_from_db, self.contract_address)
            .await?;

        if messages.is_empty() {
            return Ok(());
        }

        if messages.len() as u32 >= self.max_fetch_messages_from_db {
            warn!(
                direction = %self.direction,
                limit = self.max_fetch_messages_from_db,
                "Anchoring backlog reached fetch limit"
            );
        }

        let block_number = self.client.current_block_number().await?;

        let mut changed = Vec::new();
        for mut message in messages {
            let next = match self
                .client
                .message_status(message.message_hash, Some(block_number))
                .await?
            {
                OnChainMessageStatus::Unknown => continue,
                OnChainMessageStatus::Claimable => MessageStatus::Anchored,
                OnChainMessageStatus::Claimed => MessageStatus::ClaimedSuccess,
            };

            info!(
                direction = %self.direction,
                message_hash = %message.message_hash,
                status = %next,
                block_number,
                "Message anchored"
            );
            message.status = next;
            changed.push(message);
        }

        if !changed.is_empty() {
            self.repository.save_batch(&changed).await?;
        }

        debug!(
            direction = %self.direction,
            updated = changed.len(),
            "Anchoring check complete"
        );
        Ok(())
    }
}
