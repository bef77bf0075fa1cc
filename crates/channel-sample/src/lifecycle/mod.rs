//! # System Lifecycle
//!
//! [`ChatSystem`] wires the chat server together: a file store, the local exchange,
//! the channel server with the `user` and `room` types registered, the tick loop and
//! the socket listener.
//!
//! ```rust,ignore
//! let system = ChatSystem::start(ServerConfig::load()).await?;
//! info!(addr = %system.addr(), "Chat server up");
//! tokio::signal::ctrl_c().await?;
//! system.shutdown().await?;
//! ```
//!
//! ## Shutdown
//!
//! 1. Stop accepting sockets and stop ticking
//! 2. Close every connection and stop every channel worker
//! 3. Await the worker tasks
//!
//! Channel data is written to the store on every change, so nothing is flushed at
//! shutdown and a restarted system reloads each channel the first time it is used.
//!
//! Logging is set up with [`setup_tracing`]; `RUST_LOG=info` shows logins and channel
//! lifecycle, `RUST_LOG=debug` shows every chat line.

pub mod chat_system;

pub use channel_fabric::tracing::setup_tracing;
pub use chat_system::*;
