//! # Channel Chat Sample Library
//!
//! This library exposes the application channel types, the typed client and the
//! system orchestrator for integration testing.

pub mod clients;
pub mod error;
pub mod lifecycle;
pub mod room_channel;
pub mod user_channel;
