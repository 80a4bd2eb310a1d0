//! EIP-1559 fee estimation
//!
//! The priority fee is the mean of the fee-history rewards at the configured
//! percentile; the max fee doubles the latest base fee and adds the tip. Results
//! are cached for the block they were computed at.

use super::ChainError;

/// Number of blocks sampled from `eth_feeHistory`
pub const FEE_HISTORY_BLOCK_COUNT: u64 = 4;

/// Minimum bump, in percent, for replacing a pending transaction
pub const REPLACEMENT_FEE_BUMP_PERCENT: u128 = 110;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasFees {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Compute EIP-1559 fees from a fee history sample, capped at `max_fee_per_gas`
pub fn compute_1559_fees(
    base_fee_per_gas: &[u128],
    rewards: &[Vec<u128>],
    max_fee_per_gas: u128,
) -> Result<GasFees, ChainError> {
    let latest_base_fee = *base_fee_per_gas
        .last()
        .ok_or_else(|| ChainError::gas_fee("fee history returned no base fees"))?;

    let tips: Vec<u128> = rewards.iter().filter_map(|r| r.first().copied()).collect();
    if tips.is_empty() {
        return Err(ChainError::gas_fee("fee history returned no rewards"));
    }
    let priority_fee = tips.iter().fold(0u128, |acc, t| acc.saturating_add(*t)) / tips.len() as u128;

    if priority_fee > max_fee_per_gas {
        return Err(ChainError::gas_fee(format!(
            "estimated miner tip of {} exceeds configured max fee per gas of {}",
            priority_fee, max_fee_per_gas
        )));
    }

    let max_fee = latest_base_fee
        .saturating_mul(2)
        .saturating_add(priority_fee)
        .min(max_fee_per_gas);

    Ok(GasFees {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority_fee.min(max_fee),
    })
}

/// Fees for a replacement transaction: at least 10% over the original, at least
/// the fresh estimate, never above the cap
pub fn bump_fees(original: &GasFees, estimate: &GasFees, max_fee_per_gas: u128) -> GasFees {
    let bump = |fee: u128| fee.saturating_mul(REPLACEMENT_FEE_BUMP_PERCENT).div_ceil(100);

    let max_fee = bump(original.max_fee_per_gas)
        .max(estimate.max_fee_per_gas)
        .min(max_fee_per_gas);
    let priority_fee = bump(original.max_priority_fee_per_gas)
        .max(estimate.max_priority_fee_per_gas)
        .min(max_fee);

    GasFees {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority_fee,
    }
}

/// Fee estimate valid for a single block height
#[derive(Debug, Default)]
pub struct FeeCache {
    entry: Option<(u64, GasFees)>,
}

impl FeeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, block_number: u64) -> Option<GasFees> {
        match self.entry {
            Some((cached_at, fees)) if cached_at == block_number => Some(fees),
            _ => None,
        }
    }

    /// Zero fees are never cached
    pub fn store(&mut self, block_number: u64, fees: GasFees) {
        if fees.max_fee_per_gas > 0 && fees.max_priority_fee_per_gas > 0 {
            self.entry = Some((block_number, fees));
        }
    }
}
