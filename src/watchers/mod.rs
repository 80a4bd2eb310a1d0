//! Listeners feeding the message store
//!
//! [`SentEventListener`] ingests events from the sending chain and
//! [`AnchoredEventListener`] promotes them once the receiving chain can claim
//! them. Neither signs transactions, so both run even with claiming disabled.

pub mod anchored;
pub mod sent;

pub use anchored::AnchoredEventListener;
pub use sent::{LogCursor, SentEventListener};
