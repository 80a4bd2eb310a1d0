//! Ingests `MessageSent` events from the sending chain into the store

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, MessageSentFilter};
use crate::config::ListenerConfig;
use crate::db::{MessageRepository, NewMessage, StoreAccessError};
use crate::error_parser::ParsedError;
use crate::poller::Poller;
use crate::types::{Direction, MessageStatus};

/// Next position to read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub block_number: u64,
    pub log_index: u64,
}

pub struct SentEventListener {
    direction: Direction,
    client: Arc<dyn ChainClient>,
    repository: Arc<dyn MessageRepository>,
    /// Message service emitting the events
    contract_address: Address,
    config: ListenerConfig,
    cursor: Option<LogCursor>,
}

impl SentEventListener {
    pub fn new(
        direction: Direction,
        client: Arc<dyn ChainClient>,
        repository: Arc<dyn MessageRepository>,
        contract_address: Address,
        config: ListenerConfig,
    ) -> Self {
        Self {
            direction,
            client,
            repository,
            contract_address,
            config,
            cursor: None,
        }
    }

    pub fn cursor(&self) -> Option<LogCursor> {
        self.cursor
    }

    /// Resume after the latest persisted block, or from the configured start
    async fn initial_cursor(&self, head: u64) -> Result<LogCursor> {
        let latest = self
            .repository
            .latest_sent_block_number(self.direction, self.contract_address)
            .await?;

        let block_number = match (latest, self.config.initial_from_block) {
            (Some(latest), Some(initial)) => latest.max(initial),
            (Some(latest), None) => latest,
            (None, Some(initial)) => initial,
            (None, None) => head,
        };

        info!(
            direction = %self.direction,
            from_block = block_number,
            "Initialized sent event listener"
        );

        Ok(LogCursor {
            block_number,
            log_index: 0,
        })
    }

    fn status_for(&self, calldata_is_empty: bool) -> MessageStatus {
        if self.config.only_eoa_target && !calldata_is_empty {
            MessageStatus::Excluded
        } else {
            MessageStatus::Sent
        }
    }
}

#[async_trait]
impl Poller for SentEventListener {
    fn name(&self) -> String {
        format!("SentEventListener[{}]", self.direction)
    }

    fn polling_interval(&self) -> Duration {
        self.config.polling_interval()
    }

    async fn tick(&mut self) -> Result<()> {
        let head = self.client.current_block_number().await?;
        let mut cursor = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let cursor = self.initial_cursor(head).await?;
                self.cursor = Some(cursor);
                cursor
            }
        };

        let to_block = head
            .saturating_sub(self.config.block_confirmation)
            .min(cursor.block_number.saturating_add(self.config.max_blocks_to_fetch_logs));
        if cursor.block_number > to_block {
            cursor = LogCursor {
                block_number: to_block,
                log_index: 0,
            };
        }

        let events = self
            .client
            .message_sent_events(&MessageSentFilter {
                from_block: cursor.block_number,
                to_block,
            })
            .await?;

        let mut inserted = 0usize;
        for event in events.iter().filter(|e| {
            e.block_number > cursor.block_number || e.log_index >= cursor.log_index
        }) {
            let message = NewMessage::from_event(event, self.direction, self.status_for(event.calldata.is_empty()));

            if self.repository.insert_if_absent(&message).await? {
                inserted += 1;
                info!(
                    direction = %self.direction,
                    message_hash = %event.message_hash,
                    block_number = event.block_number,
                    log_index = event.log_index,
                    status = %message.status,
                    "Message sent event ingested"
                );
            } else {
                debug!(
                    direction = %self.direction,
                    message_hash = %event.message_hash,
                    "Message already known"
                );
            }
        }

        debug!(
            direction = %self.direction,
            from_block = cursor.block_number,
            to_block,
            events = events.len(),
            inserted,
            "Processed MessageSent range"
        );

        self.cursor = Some(LogCursor {
            block_number: to_block + 1,
            log_index: 0,
        });
        Ok(())
    }

    async fn on_tick_error(&mut self, error: &eyre::Report, _parsed: &ParsedError) {
        let rejected = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<StoreAccessError>())
            .and_then(|e| e.rejected_message);

        if let Some(rejected) = rejected {
            warn!(
                direction = %self.direction,
                message_hash = %rejected.message_hash,
                block_number = rejected.sent_block_number,
                log_index = rejected.sent_log_index,
                "Rewinding listener to rejected message"
            );
            self.cursor = Some(LogCursor {
                block_number: rejected.sent_block_number,
                log_index: rejected.sent_log_index,
            });
        }
    }
}
