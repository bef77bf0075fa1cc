//! # Clients
//!
//! Typed wrappers over the socket client so callers never build `channel_msg`
//! payloads by hand.

mod chat_client;

pub use chat_client::{ChatClient, ChatLine};
