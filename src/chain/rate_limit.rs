//! Withdrawal rate limiting on the receiving chain
//!
//! Only a message service with a withdrawal limiter can reject a claim for
//! exceeding its period limit; the other side uses [`NoRateLimit`].

use std::sync::Arc;

use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use eyre::Result;
use tracing::debug;

use super::{ChainClient, RevertReason};

const MARGIN_SCALE: u64 = 10_000;

#[async_trait]
pub trait RateLimitPolicy: Send + Sync {
    /// Whether claiming a message with this fee and value would exceed the limit
    async fn is_rate_limit_exceeded(&self, fee: U256, value: U256) -> Result<bool>;

    /// Whether a reverted claim failed on the rate limiter
    async fn is_rate_limit_exceeded_error(&self, tx_hash: B256) -> Result<bool>;
}

pub struct NoRateLimit;

#[async_trait]
impl RateLimitPolicy for NoRateLimit {
    async fn is_rate_limit_exceeded(&self, _fee: U256, _value: U256) -> Result<bool> {
        Ok(false)
    }

    async fn is_rate_limit_exceeded_error(&self, _tx_hash: B256) -> Result<bool> {
        Ok(false)
    }
}

pub struct MessageServiceRateLimit {
    client: Arc<dyn ChainClient>,
    margin: f64,
}

impl MessageServiceRateLimit {
    pub fn new(client: Arc<dyn ChainClient>, margin: f64) -> Self {
        Self { client, margin }
    }
}

/// `current + fee + value > limit * margin`, with the margin applied in basis points
pub fn exceeds_limit(limit: U256, current_period_amount: U256, fee: U256, value: U256, margin: f64) -> bool {
    let margin_scaled = U256::from((margin * MARGIN_SCALE as f64).round().max(0.0) as u64);
    let projected = current_period_amount
        .saturating_add(fee)
        .saturating_add(value)
        .saturating_mul(U256::from(MARGIN_SCALE));

    projected > limit.saturating_mul(margin_scaled)
}

#[async_trait]
impl RateLimitPolicy for MessageServiceRateLimit {
    async fn is_rate_limit_exceeded(&self, fee: U256, value: U256) -> Result<bool> {
        let state = self.client.rate_limit_state().await?;
        let exceeded = exceeds_limit(state.limit, state.current_period_amount, fee, value, self.margin);

        debug!(
            limit = %state.limit,
            current_period_amount = %state.current_period_amount,
            fee = %fee,
            value = %value,
            exceeded,
            "Checked withdrawal rate limit"
        );

        Ok(exceeded)
    }

    async fn is_rate_limit_exceeded_error(&self, tx_hash: B256) -> Result<bool> {
        Ok(matches!(
            self.client.revert_reason(tx_hash).await?,
            Some(RevertReason::RateLimitExceeded)
        ))
    }
}
