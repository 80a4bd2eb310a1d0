//! Postman: relays messages between two chains' message services
//!
//! For each direction four pollers share one Postgres message store:
//! - [`watchers::SentEventListener`] ingests `MessageSent` events
//! - [`watchers::AnchoredEventListener`] promotes messages the receiving chain can claim
//! - [`writers::ClaimTxSender`] submits claims
//! - [`confirmation::ClaimStatusWatcher`] follows claims to their receipts

pub mod chain;
pub mod config;
pub mod confirmation;
pub mod db;
pub mod error_parser;
pub mod poller;
pub mod service;
pub mod types;
pub mod watchers;
pub mod writers;

#[cfg(test)]
pub mod testing;
