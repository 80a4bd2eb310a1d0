//! Transaction writers
//!
//! The claim sender is the only poller that signs fresh transactions; it owns
//! nonce assignment for its direction.

pub mod claim;

pub use claim::ClaimTxSender;
