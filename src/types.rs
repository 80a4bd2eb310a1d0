//! Common types for message relaying
//!
//! Direction and lifecycle status of a relayed message, plus the on-chain
//! status reported by the receiving message service.

use alloy::primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which chain originated a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Sent on the origin chain, claimed on the destination chain
    OriginToDest,
    /// Sent on the destination chain, claimed on the origin chain
    DestToOrigin,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::OriginToDest, Direction::DestToOrigin];

    /// Get the direction as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::OriginToDest => "ORIGIN_TO_DEST",
            Direction::DestToOrigin => "DEST_TO_ORIGIN",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ORIGIN_TO_DEST" => Ok(Direction::OriginToDest),
            "DEST_TO_ORIGIN" => Ok(Direction::DestToOrigin),
            other => Err(eyre::eyre!("Unknown message direction: {}", other)),
        }
    }
}

/// Processing status of a relayed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Sent,
    Excluded,
    Anchored,
    ZeroFee,
    FeeUnderpriced,
    Pending,
    ClaimedSuccess,
    ClaimedReverted,
    NonExecutable,
}

impl MessageStatus {
    /// Get the status as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "SENT",
            MessageStatus::Excluded => "EXCLUDED",
            MessageStatus::Anchored => "ANCHORED",
            MessageStatus::ZeroFee => "ZERO_FEE",
            MessageStatus::FeeUnderpriced => "FEE_UNDERPRICED",
            MessageStatus::Pending => "PENDING",
            MessageStatus::ClaimedSuccess => "CLAIMED_SUCCESS",
            MessageStatus::ClaimedReverted => "CLAIMED_REVERTED",
            MessageStatus::NonExecutable => "NON_EXECUTABLE",
        }
    }

    /// No relay action is ever taken again on a message in a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::ClaimedSuccess
                | MessageStatus::ClaimedReverted
                | MessageStatus::NonExecutable
                | MessageStatus::ZeroFee
                | MessageStatus::Excluded
        )
    }

    /// Whether the relay may move a message from `self` to `next`.
    ///
    /// PENDING → SENT is the rate-limit bounce: the claim reverted because the
    /// receiving chain's withdrawal limit was hit, so the message goes back
    /// through anchoring.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        match (self, next) {
            (Sent, Anchored | ClaimedSuccess) => true,
            (Anchored, Pending | ZeroFee | ClaimedSuccess | NonExecutable | FeeUnderpriced) => true,
            (FeeUnderpriced, Pending | ClaimedSuccess | NonExecutable | FeeUnderpriced) => true,
            (Pending, ClaimedSuccess | ClaimedReverted | Sent | NonExecutable) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SENT" => MessageStatus::Sent,
            "EXCLUDED" => MessageStatus::Excluded,
            "ANCHORED" => MessageStatus::Anchored,
            "ZERO_FEE" => MessageStatus::ZeroFee,
            "FEE_UNDERPRICED" => MessageStatus::FeeUnderpriced,
            "PENDING" => MessageStatus::Pending,
            "CLAIMED_SUCCESS" => MessageStatus::ClaimedSuccess,
            "CLAIMED_REVERTED" => MessageStatus::ClaimedReverted,
            "NON_EXECUTABLE" => MessageStatus::NonExecutable,
            other => return Err(eyre::eyre!("Unknown message status: {}", other)),
        })
    }
}

/// Message status as reported by the receiving chain's message service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainMessageStatus {
    Unknown,
    Claimable,
    Claimed,
}

impl From<U256> for OnChainMessageStatus {
    fn from(value: U256) -> Self {
        if value == U256::from(1u8) {
            OnChainMessageStatus::Claimable
        } else if value == U256::from(2u8) {
            OnChainMessageStatus::Claimed
        } else {
            OnChainMessageStatus::Unknown
        }
    }
}

/// Business key of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub message_hash: B256,
    pub direction: Direction,
}

impl MessageKey {
    pub fn new(message_hash: B256, direction: Direction) -> Self {
        Self {
            message_hash,
            direction,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.message_hash, self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str() {
        assert_eq!(MessageStatus::Sent.as_str(), "SENT");
        assert_eq!(MessageStatus::FeeUnderpriced.as_str(), "FEE_UNDERPRICED");
        assert_eq!(MessageStatus::ClaimedSuccess.as_str(), "CLAIMED_SUCCESS");
        assert_eq!(MessageStatus::NonExecutable.as_str(), "NON_EXECUTABLE");
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            MessageStatus::Sent,
            MessageStatus::Excluded,
            MessageStatus::Anchored,
            MessageStatus::ZeroFee,
            MessageStatus::FeeUnderpriced,
            MessageStatus::Pending,
            MessageStatus::ClaimedSuccess,
            MessageStatus::ClaimedReverted,
            MessageStatus::NonExecutable,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("CLAIMED".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_anchored_sorts_before_fee_underpriced() {
        // Candidate ordering relies on the textual order of these two statuses
        assert!(MessageStatus::Anchored.as_str() < MessageStatus::FeeUnderpriced.as_str());
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(format!("{}", Direction::OriginToDest), "ORIGIN_TO_DEST");
        assert_eq!(
            "DEST_TO_ORIGIN".parse::<Direction>().unwrap(),
            Direction::DestToOrigin
        );
    }

    #[test]
    fn test_terminal_statuses_have_no_exit() {
        use MessageStatus::*;
        for terminal in [ClaimedSuccess, ClaimedReverted, NonExecutable, ZeroFee, Excluded] {
            assert!(terminal.is_terminal());
            for next in [Sent, Anchored, Pending, FeeUnderpriced, ClaimedSuccess] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_claimed_success_requires_anchoring_or_claim_check() {
        use MessageStatus::*;
        assert!(Sent.can_transition_to(ClaimedSuccess));
        assert!(Anchored.can_transition_to(ClaimedSuccess));
        assert!(Pending.can_transition_to(ClaimedSuccess));
        assert!(!Sent.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Sent));
    }

    #[test]
    fn test_on_chain_status_from_u256() {
        assert_eq!(
            OnChainMessageStatus::from(U256::ZERO),
            OnChainMessageStatus::Unknown
        );
        assert_eq!(
            OnChainMessageStatus::from(U256::from(1)),
            OnChainMessageStatus::Claimable
        );
        assert_eq!(
            OnChainMessageStatus::from(U256::from(2)),
            OnChainMessageStatus::Claimed
        );
    }
}
