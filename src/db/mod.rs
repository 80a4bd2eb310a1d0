//! Message store
//!
//! [`MessageRepository`] is the only way pollers touch persisted messages.
//! Every failure surfaces as a [`StoreAccessError`] so callers can tell storage
//! trouble apart from chain trouble and resume from the rejected message.

use std::error::Error as StdError;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::chain::SubmittedClaim;
use crate::types::{Direction, MessageKey, MessageStatus};

pub mod models;

pub use models::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Position of a message the store refused, used to resume ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedMessage {
    pub message_hash: B256,
    pub sent_block_number: u64,
    pub sent_log_index: u64,
}

#[derive(Debug, Error)]
#[error("{repository}.{operation} failed: {source}")]
pub struct StoreAccessError {
    pub repository: &'static str,
    pub operation: &'static str,
    pub source: Box<dyn StdError + Send + Sync>,
    pub rejected_message: Option<RejectedMessage>,
}

impl StoreAccessError {
    pub fn new(
        repository: &'static str,
        operation: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            repository,
            operation,
            source: source.into(),
            rejected_message: None,
        }
    }

    pub fn with_rejected(mut self, message: &NewMessage) -> Self {
        self.rejected_message = Some(RejectedMessage {
            message_hash: message.message_hash,
            sent_block_number: message.sent_block_number,
            sent_log_index: message.sent_log_index,
        });
        self
    }
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_by_key(&self, key: MessageKey) -> Result<Option<Message>>;

    /// Insert unless `(message_hash, direction)` exists; true when inserted
    async fn insert_if_absent(&self, message: &NewMessage) -> Result<bool>;

    async fn update_by_key(&self, key: MessageKey, update: &MessageUpdate) -> Result<()>;

    async fn update_by_claim_tx_hash(
        &self,
        claim_tx_hash: B256,
        direction: Direction,
        update: &MessageUpdate,
    ) -> Result<()>;

    async fn latest_sent_block_number(
        &self,
        direction: Direction,
        contract_address: Address,
    ) -> Result<Option<u64>>;

    /// Oldest SENT messages first
    async fn first_n_sent(
        &self,
        direction: Direction,
        limit: u32,
        contract_address: Address,
    ) -> Result<Vec<Message>>;

    async fn first_message_to_claim(&self, query: &ClaimCandidateQuery) -> Result<Option<Message>>;

    /// PENDING message with the lowest claim nonce
    async fn first_pending_message(&self, direction: Direction) -> Result<Option<Message>>;

    async fn last_claim_tx_nonce(&self, direction: Direction) -> Result<Option<u64>>;

    /// Persist lifecycle changes of several messages in one store transaction
    async fn save_batch(&self, messages: &[Message]) -> Result<()>;

    /// Mark a message PENDING, run `submit`, then record the transaction hash.
    ///
    /// Both writes commit together; if `submit` fails nothing is persisted and
    /// its error is returned.
    async fn claim_atomically<'a>(
        &'a self,
        key: MessageKey,
        pending: MessageUpdate,
        submit: BoxFuture<'a, Result<SubmittedClaim>>,
    ) -> Result<SubmittedClaim>;
}

const REPOSITORY: &str = "PgMessageRepository";

const MESSAGE_COLUMNS: &str = r#"message_hash, direction, message_sender, destination,
    fee::TEXT AS fee, value::TEXT AS value, message_nonce::TEXT AS message_nonce,
    calldata, contract_address, sent_block_number, sent_log_index, status,
    claim_tx_creation_date, claim_tx_gas_limit,
    claim_tx_max_fee_per_gas::TEXT AS claim_tx_max_fee_per_gas,
    claim_tx_max_priority_fee_per_gas::TEXT AS claim_tx_max_priority_fee_per_gas,
    claim_tx_nonce, claim_tx_hash, claim_number_of_retry, claim_last_retried_at,
    claim_gas_estimation_threshold, created_at, updated_at"#;

fn hex_string<T: std::fmt::Debug>(value: &T) -> String {
    format!("{:?}", value)
}

fn to_i64(column: &str, value: u64) -> Result<i64> {
    i64::try_from(value).wrap_err_with(|| format!("{} {} does not fit a BIGINT column", column, value))
}

fn to_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value).wrap_err_with(|| format!("{} {} does not fit an INTEGER column", column, value))
}

fn rows_to_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    rows.into_iter().map(Message::try_from).collect()
}

/// Postgres-backed message repository
#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn store_error(operation: &'static str, e: sqlx::Error) -> StoreAccessError {
        error!(operation, error = ?e, "SQL error in message repository");
        StoreAccessError::new(REPOSITORY, operation, e)
    }

    /// `UPDATE messages SET ...` for the fields present in `update`
    fn update_query(update: &MessageUpdate) -> Result<QueryBuilder<'static, Postgres>> {
        let mut qb = QueryBuilder::new("UPDATE messages SET updated_at = NOW()");

        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(date) = update.claim_tx_creation_date {
            qb.push(", claim_tx_creation_date = ").push_bind(date);
        }
        if let Some(gas_limit) = update.claim_tx_gas_limit {
            qb.push(", claim_tx_gas_limit = ").push_bind(to_i64("claim_tx_gas_limit", gas_limit)?);
        }
        if let Some(fee) = update.claim_tx_max_fee_per_gas {
            qb.push(", claim_tx_max_fee_per_gas = ")
                .push_bind(fee.to_string())
                .push("::NUMERIC");
        }
        if let Some(fee) = update.claim_tx_max_priority_fee_per_gas {
            qb.push(", claim_tx_max_priority_fee_per_gas = ")
                .push_bind(fee.to_string())
                .push("::NUMERIC");
        }
        if let Some(nonce) = update.claim_tx_nonce {
            qb.push(", claim_tx_nonce = ").push_bind(to_i64("claim_tx_nonce", nonce)?);
        }
        if let Some(hash) = update.claim_tx_hash {
            qb.push(", claim_tx_hash = ").push_bind(hex_string(&hash));
        }
        if let Some(retry) = update.claim_number_of_retry {
            qb.push(", claim_number_of_retry = ")
                .push_bind(to_i32("claim_number_of_retry", retry)?);
        }
        if let Some(at) = update.claim_last_retried_at {
            qb.push(", claim_last_retried_at = ").push_bind(at);
        }
        if let Some(threshold) = update.claim_gas_estimation_threshold {
            qb.push(", claim_gas_estimation_threshold = ").push_bind(threshold);
        }

        Ok(qb)
    }

    fn update_by_key_query(key: MessageKey, update: &MessageUpdate) -> Result<QueryBuilder<'static, Postgres>> {
        let mut qb = Self::update_query(update)?;
        qb.push(" WHERE message_hash = ")
            .push_bind(hex_string(&key.message_hash))
            .push(" AND direction = ")
            .push_bind(key.direction.as_str());
        Ok(qb)
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn find_by_key(&self, key: MessageKey) -> Result<Option<Message>> {
        let query = format!(
            "SELECT {} FROM messages WHERE message_hash = $1 AND direction = $2",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(hex_string(&key.message_hash))
            .bind(key.direction.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::store_error("find_by_key", e))?;

        row.map(Message::try_from).transpose()
    }

    async fn insert_if_absent(&self, message: &NewMessage) -> Result<bool> {
        let sent_block_number = to_i64("sent_block_number", message.sent_block_number)?;
        let sent_log_index = to_i64("sent_log_index", message.sent_log_index)?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (message_hash, direction, message_sender, destination,
                fee, value, message_nonce, calldata, contract_address,
                sent_block_number, sent_log_index, status)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC, $7::NUMERIC, $8, $9, $10, $11, $12)
            ON CONFLICT (message_hash, direction) DO NOTHING
            "#,
        )
        .bind(hex_string(&message.message_hash))
        .bind(message.direction.as_str())
        .bind(hex_string(&message.message_sender))
        .bind(hex_string(&message.destination))
        .bind(message.fee.to_string())
        .bind(message.value.to_string())
        .bind(message.message_nonce.to_string())
        .bind(format!("0x{}", hex::encode(&message.calldata)))
        .bind(hex_string(&message.contract_address))
        .bind(sent_block_number)
        .bind(sent_log_index)
        .bind(message.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::store_error("insert_if_absent", e).with_rejected(message))?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_by_key(&self, key: MessageKey, update: &MessageUpdate) -> Result<()> {
        Self::update_by_key_query(key, update)?
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| Self::store_error("update_by_key", e))?;
        Ok(())
    }

    async fn update_by_claim_tx_hash(
        &self,
        claim_tx_hash: B256,
        direction: Direction,
        update: &MessageUpdate,
    ) -> Result<()> {
        let mut qb = Self::update_query(update)?;
        qb.push(" WHERE claim_tx_hash = ")
            .push_bind(hex_string(&claim_tx_hash))
            .push(" AND direction = ")
            .push_bind(direction.as_str());

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| Self::store_error("update_by_claim_tx_hash", e))?;

        if result.rows_affected() == 0 {
            warn!(
                claim_tx_hash = %claim_tx_hash,
                direction = %direction,
                "No message found for claim transaction"
            );
        }
        Ok(())
    }

    async fn latest_sent_block_number(
        &self,
        direction: Direction,
        contract_address: Address,
    ) -> Result<Option<u64>> {
        let block: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sent_block_number) FROM messages WHERE direction = $1 AND contract_address = $2",
        )
        .bind(direction.as_str())
        .bind(hex_string(&contract_address))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::store_error("latest_sent_block_number", e))?;

        block
            .map(|b| u64::try_from(b).wrap_err_with(|| format!("Negative sent block number: {}", b)))
            .transpose()
    }

    async fn first_n_sent(
        &self,
        direction: Direction,
        limit: u32,
        contract_address: Address,
    ) -> Result<Vec<Message>> {
        let query = format!(
            r#"SELECT {} FROM messages
               WHERE direction = $1 AND status = $2 AND contract_address = $3
               ORDER BY sent_block_number ASC, sent_log_index ASC
               LIMIT $4"#,
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(direction.as_str())
            .bind(MessageStatus::Sent.as_str())
            .bind(hex_string(&contract_address))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::store_error("first_n_sent", e))?;

        rows_to_messages(rows)
    }

    async fn first_message_to_claim(&self, query: &ClaimCandidateQuery) -> Result<Option<Message>> {
        // Textual status order puts ANCHORED before FEE_UNDERPRICED
        let sql = format!(
            r#"SELECT {} FROM messages
               WHERE direction = $1
                 AND contract_address = $2
                 AND status IN ($3, $4)
                 AND claim_number_of_retry < $5
                 AND (claim_last_retried_at IS NULL
                      OR claim_last_retried_at < NOW() - ($6::BIGINT * INTERVAL '1 second'))
                 AND (claim_gas_estimation_threshold IS NULL
                      OR claim_gas_estimation_threshold > $7)
               ORDER BY status ASC,
                        claim_gas_estimation_threshold DESC NULLS FIRST,
                        sent_block_number ASC
               LIMIT 1"#,
            MESSAGE_COLUMNS
        );
        let max_retry = to_i32("claim_number_of_retry", query.max_retry)?;
        let retry_delay = to_i64("retry delay", query.retry_delay.as_secs())?;
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(query.direction.as_str())
            .bind(hex_string(&query.contract_address))
            .bind(MessageStatus::Anchored.as_str())
            .bind(MessageStatus::FeeUnderpriced.as_str())
            .bind(max_retry)
            .bind(retry_delay)
            .bind(query.min_threshold())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::store_error("first_message_to_claim", e))?;

        row.map(Message::try_from).transpose()
    }

    async fn first_pending_message(&self, direction: Direction) -> Result<Option<Message>> {
        let query = format!(
            r#"SELECT {} FROM messages
               WHERE direction = $1 AND status = $2
               ORDER BY claim_tx_nonce ASC
               LIMIT 1"#,
            MESSAGE_COLUMNS
        );
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(direction.as_str())
            .bind(MessageStatus::Pending.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::store_error("first_pending_message", e))?;

        row.map(Message::try_from).transpose()
    }

    async fn last_claim_tx_nonce(&self, direction: Direction) -> Result<Option<u64>> {
        let nonce: Option<i64> =
            sqlx::query_scalar("SELECT MAX(claim_tx_nonce) FROM messages WHERE direction = $1")
                .bind(direction.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Self::store_error("last_claim_tx_nonce", e))?;

        nonce
            .map(|n| u64::try_from(n).wrap_err_with(|| format!("Negative claim nonce: {}", n)))
            .transpose()
    }

    async fn save_batch(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::store_error("save_batch", e))?;

        for message in messages {
            let update = MessageUpdate {
                status: Some(message.status),
                claim_tx_creation_date: message.claim_tx_creation_date,
                claim_tx_gas_limit: message.claim_tx_gas_limit,
                claim_tx_max_fee_per_gas: message.claim_tx_max_fee_per_gas,
                claim_tx_max_priority_fee_per_gas: message.claim_tx_max_priority_fee_per_gas,
                claim_tx_nonce: message.claim_tx_nonce,
                claim_tx_hash: message.claim_tx_hash,
                claim_number_of_retry: Some(message.claim_number_of_retry),
                claim_last_retried_at: message.claim_last_retried_at,
                claim_gas_estimation_threshold: Some(message.claim_gas_estimation_threshold),
            };
            Self::update_by_key_query(message.key(), &update)?
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::store_error("save_batch", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::store_error("save_batch", e))?;

        debug!(count = messages.len(), "Saved message batch");
        Ok(())
    }

    async fn claim_atomically<'a>(
        &'a self,
        key: MessageKey,
        pending: MessageUpdate,
        submit: BoxFuture<'a, Result<SubmittedClaim>>,
    ) -> Result<SubmittedClaim> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::store_error("claim_atomically", e))?;

        Self::update_by_key_query(key, &pending)?
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::store_error("claim_atomically", e))?;

        let submitted = match submit.await {
            Ok(submitted) => submitted,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(message = %key, error = ?rollback, "Failed to roll back claim");
                }
                return Err(e);
            }
        };

        let record = MessageUpdate {
            claim_tx_hash: Some(submitted.tx_hash),
            ..Default::default()
        };
        Self::update_by_key_query(key, &record)?
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::store_error("claim_atomically", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::store_error("claim_atomically", e))
            .wrap_err_with(|| format!("Claim {:?} was sent but not recorded", submitted.tx_hash))?;

        Ok(submitted)
    }
}
