use std::collections::{HashMap, HashSet};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::Result;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::chain::SubmittedClaim;
use crate::db::{
    ClaimCandidateQuery, Message, MessageRepository, MessageUpdate, NewMessage, StoreAccessError,
};
use crate::types::{Direction, MessageKey, MessageStatus};

const REPOSITORY: &str = "InMemoryMessageRepository";

/// Message repository with the Postgres repository's query semantics
#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: Mutex<HashMap<MessageKey, Message>>,
    failing_inserts: Mutex<HashSet<B256>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, message: Message) {
        self.messages.lock().await.insert(message.key(), message);
    }

    pub async fn get(&self, key: MessageKey) -> Option<Message> {
        self.messages.lock().await.get(&key).cloned()
    }

    pub async fn all(&self) -> Vec<Message> {
        let mut messages: Vec<_> = self.messages.lock().await.values().cloned().collect();
        messages.sort_by_key(|m| (m.sent_block_number, m.sent_log_index));
        messages
    }

    pub async fn set_updated_at(&self, key: MessageKey, at: DateTime<Utc>) {
        if let Some(message) = self.messages.lock().await.get_mut(&key) {
            message.updated_at = at;
        }
    }

    /// Make inserts of this message fail until cleared
    pub async fn fail_insert_of(&self, message_hash: B256) {
        self.failing_inserts.lock().await.insert(message_hash);
    }

    pub async fn clear_insert_failures(&self) {
        self.failing_inserts.lock().await.clear();
    }

    fn apply(messages: &mut HashMap<MessageKey, Message>, key: MessageKey, update: &MessageUpdate) {
        if let Some(message) = messages.get_mut(&key) {
            message.apply(update);
            message.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn find_by_key(&self, key: MessageKey) -> Result<Option<Message>> {
        Ok(self.get(key).await)
    }

    async fn insert_if_absent(&self, message: &NewMessage) -> Result<bool> {
        if self.failing_inserts.lock().await.contains(&message.message_hash) {
            return Err(
                StoreAccessError::new(REPOSITORY, "insert_if_absent", "connection reset")
                    .with_rejected(message)
                    .into(),
            );
        }

        let mut messages = self.messages.lock().await;
        if messages.contains_key(&message.key()) {
            return Ok(false);
        }
        messages.insert(message.key(), Message::from(message.clone()));
        Ok(true)
    }

    async fn update_by_key(&self, key: MessageKey, update: &MessageUpdate) -> Result<()> {
        Self::apply(&mut *self.messages.lock().await, key, update);
        Ok(())
    }

    async fn update_by_claim_tx_hash(
        &self,
        claim_tx_hash: B256,
        direction: Direction,
        update: &MessageUpdate,
    ) -> Result<()> {
        let mut messages = self.messages.lock().await;
        let key = messages
            .values()
            .find(|m| m.direction == direction && m.claim_tx_hash == Some(claim_tx_hash))
            .map(Message::key);
        if let Some(key) = key {
            Self::apply(&mut messages, key, update);
        }
        Ok(())
    }

    async fn latest_sent_block_number(
        &self,
        direction: Direction,
        contract_address: Address,
    ) -> Result<Option<u64>> {
        Ok(self
            .messages
            .lock()
            .await
            .values()
            .filter(|m| m.direction == direction && m.contract_address == contract_address)
            .map(|m| m.sent_block_number)
            .max())
    }

    async fn first_n_sent(
        &self,
        direction: Direction,
        limit: u32,
        contract_address: Address,
    ) -> Result<Vec<Message>> {
        Ok(self
            .all()
            .await
            .into_iter()
            .filter(|m| {
                m.direction == direction
                    && m.status == MessageStatus::Sent
                    && m.contract_address == contract_address
            })
            .take(limit as usize)
            .collect())
    }

    async fn first_message_to_claim(&self, query: &ClaimCandidateQuery) -> Result<Option<Message>> {
        let now = Utc::now();
        let retry_delay = chrono::Duration::from_std(query.retry_delay)?;
        let min_threshold = query.min_threshold();

        let mut candidates: Vec<Message> = self
            .messages
            .lock()
            .await
            .values()
            .filter(|m| {
                m.direction == query.direction
                    && m.contract_address == query.contract_address
                    && matches!(m.status, MessageStatus::Anchored | MessageStatus::FeeUnderpriced)
                    && m.claim_number_of_retry < query.max_retry
                    && m.claim_last_retried_at.map_or(true, |at| at < now - retry_delay)
                    && m.claim_gas_estimation_threshold.map_or(true, |t| t > min_threshold)
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            a.status
                .as_str()
                .cmp(b.status.as_str())
                .then_with(|| {
                    match (a.claim_gas_estimation_threshold, b.claim_gas_estimation_threshold) {
                        (None, None) => std::cmp::Ordering::Equal,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(x), Some(y)) => y.total_cmp(&x),
                    }
                })
                .then_with(|| a.sent_block_number.cmp(&b.sent_block_number))
        });

        Ok(candidates.into_iter().next())
    }

    async fn first_pending_message(&self, direction: Direction) -> Result<Option<Message>> {
        Ok(self
            .messages
            .lock()
            .await
            .values()
            .filter(|m| m.direction == direction && m.status == MessageStatus::Pending)
            // NULL nonces sort last, as in Postgres
            .min_by_key(|m| m.claim_tx_nonce.unwrap_or(u64::MAX))
            .cloned())
    }

    async fn last_claim_tx_nonce(&self, direction: Direction) -> Result<Option<u64>> {
        Ok(self
            .messages
            .lock()
            .await
            .values()
            .filter(|m| m.direction == direction)
            .filter_map(|m| m.claim_tx_nonce)
            .max())
    }

    async fn save_batch(&self, batch: &[Message]) -> Result<()> {
        let mut messages = self.messages.lock().await;
        for message in batch {
            let mut saved = message.clone();
            saved.updated_at = Utc::now();
            messages.insert(saved.key(), saved);
        }
        Ok(())
    }

    async fn claim_atomically<'a>(
        &'a self,
        key: MessageKey,
        pending: MessageUpdate,
        submit: BoxFuture<'a, Result<SubmittedClaim>>,
    ) -> Result<SubmittedClaim> {
        let snapshot = self.get(key).await;
        self.update_by_key(key, &pending).await?;

        match submit.await {
            Ok(submitted) => {
                let record = MessageUpdate {
                    claim_tx_hash: Some(submitted.tx_hash),
                    ..Default::default()
                };
                self.update_by_key(key, &record).await?;
                Ok(submitted)
            }
            Err(e) => {
                if let Some(snapshot) = snapshot {
                    self.put(snapshot).await;
                }
                Err(e)
            }
        }
    }
}
