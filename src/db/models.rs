use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::FromRow;

use crate::chain::MessageSentEvent;
use crate::types::{Direction, MessageKey, MessageStatus};

// Amounts are NUMERIC(78,0) in the database. Inserts cast text with $n::NUMERIC,
// selects cast back with ::TEXT, and the row struct carries them as String.
// Hashes and addresses are stored as lowercase 0x-prefixed hex.

/// Database row for a message, in storage representation
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub message_hash: String,
    pub direction: String,
    pub message_sender: String,
    pub destination: String,
    pub fee: String,
    pub value: String,
    pub message_nonce: String,
    pub calldata: String,
    pub contract_address: String,
    pub sent_block_number: i64,
    pub sent_log_index: i64,
    pub status: String,
    pub claim_tx_creation_date: Option<DateTime<Utc>>,
    pub claim_tx_gas_limit: Option<i64>,
    pub claim_tx_max_fee_per_gas: Option<String>,
    pub claim_tx_max_priority_fee_per_gas: Option<String>,
    pub claim_tx_nonce: Option<i64>,
    pub claim_tx_hash: Option<String>,
    pub claim_number_of_retry: i32,
    pub claim_last_retried_at: Option<DateTime<Utc>>,
    pub claim_gas_estimation_threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A relayed message with its claim bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_hash: B256,
    pub direction: Direction,
    pub message_sender: Address,
    pub destination: Address,
    pub fee: U256,
    pub value: U256,
    pub message_nonce: U256,
    pub calldata: Bytes,
    /// Message service on the sending chain
    pub contract_address: Address,
    pub sent_block_number: u64,
    pub sent_log_index: u64,
    pub status: MessageStatus,
    pub claim_tx_creation_date: Option<DateTime<Utc>>,
    pub claim_tx_gas_limit: Option<u64>,
    pub claim_tx_max_fee_per_gas: Option<u128>,
    pub claim_tx_max_priority_fee_per_gas: Option<u128>,
    pub claim_tx_nonce: Option<u64>,
    pub claim_tx_hash: Option<B256>,
    pub claim_number_of_retry: u32,
    pub claim_last_retried_at: Option<DateTime<Utc>>,
    /// Fee divided by the estimated claim gas
    pub claim_gas_estimation_threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.message_hash, self.direction)
    }

    /// Apply a partial update in memory
    pub fn apply(&mut self, update: &MessageUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(date) = update.claim_tx_creation_date {
            self.claim_tx_creation_date = Some(date);
        }
        if let Some(gas_limit) = update.claim_tx_gas_limit {
            self.claim_tx_gas_limit = Some(gas_limit);
        }
        if let Some(fee) = update.claim_tx_max_fee_per_gas {
            self.claim_tx_max_fee_per_gas = Some(fee);
        }
        if let Some(fee) = update.claim_tx_max_priority_fee_per_gas {
            self.claim_tx_max_priority_fee_per_gas = Some(fee);
        }
        if let Some(nonce) = update.claim_tx_nonce {
            self.claim_tx_nonce = Some(nonce);
        }
        if let Some(hash) = update.claim_tx_hash {
            self.claim_tx_hash = Some(hash);
        }
        if let Some(retry) = update.claim_number_of_retry {
            self.claim_number_of_retry = retry;
        }
        if let Some(at) = update.claim_last_retried_at {
            self.claim_last_retried_at = Some(at);
        }
        if let Some(threshold) = update.claim_gas_estimation_threshold {
            self.claim_gas_estimation_threshold = threshold;
        }
    }
}

impl From<NewMessage> for Message {
    fn from(new: NewMessage) -> Self {
        let now = Utc::now();
        Self {
            message_hash: new.message_hash,
            direction: new.direction,
            message_sender: new.message_sender,
            destination: new.destination,
            fee: new.fee,
            value: new.value,
            message_nonce: new.message_nonce,
            calldata: new.calldata,
            contract_address: new.contract_address,
            sent_block_number: new.sent_block_number,
            sent_log_index: new.sent_log_index,
            status: new.status,
            claim_tx_creation_date: None,
            claim_tx_gas_limit: None,
            claim_tx_max_fee_per_gas: None,
            claim_tx_max_priority_fee_per_gas: None,
            claim_tx_nonce: None,
            claim_tx_hash: None,
            claim_number_of_retry: 0,
            claim_last_retried_at: None,
            claim_gas_estimation_threshold: None,
            created_at: now,
            updated_at: now,
        }
    }
}

fn parse_u256(field: &str, value: &str) -> Result<U256> {
    U256::from_str_radix(value, 10).wrap_err_with(|| format!("Invalid {}: {}", field, value))
}

fn parse_u128(field: &str, value: Option<String>) -> Result<Option<u128>> {
    value
        .map(|v| v.parse::<u128>().wrap_err_with(|| format!("Invalid {}: {}", field, v)))
        .transpose()
}

fn parse_u64(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("Negative {}: {}", field, value))
}

impl TryFrom<MessageRow> for Message {
    type Error = eyre::Report;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Self {
            message_hash: B256::from_str(&row.message_hash).wrap_err("Invalid message hash")?,
            direction: row.direction.parse()?,
            message_sender: Address::from_str(&row.message_sender)
                .wrap_err("Invalid message sender")?,
            destination: Address::from_str(&row.destination).wrap_err("Invalid destination")?,
            fee: parse_u256("fee", &row.fee)?,
            value: parse_u256("value", &row.value)?,
            message_nonce: parse_u256("message nonce", &row.message_nonce)?,
            calldata: Bytes::from_str(&row.calldata).wrap_err("Invalid calldata")?,
            contract_address: Address::from_str(&row.contract_address)
                .wrap_err("Invalid contract address")?,
            sent_block_number: parse_u64("sent block number", row.sent_block_number)?,
            sent_log_index: parse_u64("sent log index", row.sent_log_index)?,
            status: row.status.parse()?,
            claim_tx_creation_date: row.claim_tx_creation_date,
            claim_tx_gas_limit: row
                .claim_tx_gas_limit
                .map(|v| parse_u64("claim gas limit", v))
                .transpose()?,
            claim_tx_max_fee_per_gas: parse_u128("claim max fee", row.claim_tx_max_fee_per_gas)?,
            claim_tx_max_priority_fee_per_gas: parse_u128(
                "claim max priority fee",
                row.claim_tx_max_priority_fee_per_gas,
            )?,
            claim_tx_nonce: row
                .claim_tx_nonce
                .map(|v| parse_u64("claim nonce", v))
                .transpose()?,
            claim_tx_hash: row
                .claim_tx_hash
                .as_deref()
                .map(B256::from_str)
                .transpose()
                .wrap_err("Invalid claim tx hash")?,
            claim_number_of_retry: u32::try_from(row.claim_number_of_retry)
                .wrap_err_with(|| format!("Negative claim retry count: {}", row.claim_number_of_retry))?,
            claim_last_retried_at: row.claim_last_retried_at,
            claim_gas_estimation_threshold: row.claim_gas_estimation_threshold,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// For inserting newly observed messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub message_hash: B256,
    pub direction: Direction,
    pub message_sender: Address,
    pub destination: Address,
    pub fee: U256,
    pub value: U256,
    pub message_nonce: U256,
    pub calldata: Bytes,
    pub contract_address: Address,
    pub sent_block_number: u64,
    pub sent_log_index: u64,
    pub status: MessageStatus,
}

impl NewMessage {
    pub fn from_event(event: &MessageSentEvent, direction: Direction, status: MessageStatus) -> Self {
        Self {
            message_hash: event.message_hash,
            direction,
            message_sender: event.message_sender,
            destination: event.destination,
            fee: event.fee,
            value: event.value,
            message_nonce: event.message_nonce,
            calldata: event.calldata.clone(),
            contract_address: event.contract_address,
            sent_block_number: event.block_number,
            sent_log_index: event.log_index,
            status,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.message_hash, self.direction)
    }
}

/// Partial update of a message's lifecycle fields.
///
/// `None` leaves a column untouched. The gas estimation threshold is the only
/// field the relay ever clears, hence its nested option.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub status: Option<MessageStatus>,
    pub claim_tx_creation_date: Option<DateTime<Utc>>,
    pub claim_tx_gas_limit: Option<u64>,
    pub claim_tx_max_fee_per_gas: Option<u128>,
    pub claim_tx_max_priority_fee_per_gas: Option<u128>,
    pub claim_tx_nonce: Option<u64>,
    pub claim_tx_hash: Option<B256>,
    pub claim_number_of_retry: Option<u32>,
    pub claim_last_retried_at: Option<DateTime<Utc>>,
    pub claim_gas_estimation_threshold: Option<Option<f64>>,
}

impl MessageUpdate {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn gas_estimation_threshold(threshold: Option<f64>) -> Self {
        Self {
            claim_gas_estimation_threshold: Some(threshold),
            ..Default::default()
        }
    }
}

/// Filters for picking the next message to claim
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimCandidateQuery {
    pub direction: Direction,
    /// Message service on the sending chain
    pub contract_address: Address,
    pub current_gas_price: u128,
    pub profit_margin: f64,
    pub max_retry: u32,
    pub retry_delay: Duration,
}

impl ClaimCandidateQuery {
    /// Minimum fee-per-gas a previously estimated message must offer
    pub fn min_threshold(&self) -> f64 {
        self.current_gas_price as f64 * self.profit_margin
    }
}
