//! Test doubles for the chain client and the message store

mod chain;
mod memory;

pub use chain::{sent_event, MockChainClient};
pub use memory::InMemoryMessageRepository;
