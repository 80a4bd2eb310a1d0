//! Claim confirmation
//!
//! Tracks submitted claims until their receipts settle the message status.

pub mod claim_status;

pub use claim_status::ClaimStatusWatcher;
