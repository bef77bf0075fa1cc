//! # Channel Fabric
//!
//! A process-local actor and pub/sub fabric. State lives in **channels** addressed as
//! `type.subid` (`room.lobby`, `user.alice`, `client.u7`). Each channel runs in its own
//! Tokio task, owns its data exclusively, and talks to other channels only by message.
//!
//! ## Layers
//!
//! 1. **Codec** ([`packet`]): flags byte plus width-tagged integers, strings, JSON and
//!    raw buffers.
//! 2. **Ack/RPC** ([`ack`]): request/response correlation on top of packets. A sender
//!    chooses [`ResponseMode::FireAndForget`] or [`ResponseMode::Expect`]; a receiver
//!    answers through a one-shot [`Responder`].
//! 3. **Exchange** ([`exchange`]): address-based delivery. [`LocalExchange`] is the
//!    in-process implementation; the server only sees the [`Exchange`] trait.
//! 4. **Channels** ([`worker`], [`server`]): [`ChannelWorker`] is the per-channel runtime,
//!    [`ChannelServer`] the registry of types and running channels.
//! 5. **Edges** ([`net`], [`client_channel`], [`client`]): TCP transport, the per-socket
//!    `client.u<id>` channel, and the client-side subscription mirror.
//!
//! ## Channel data
//!
//! Every channel has a `public` tree, replicated to subscribers as `apply_channel_data`
//! diffs, and a `private` tree that never leaves the channel. Both are persisted through
//! a [`DataStore`] on every write.
//!
//! ## Writing a channel type
//!
//! ```rust
//! use channel_fabric::{
//!     ChannelBehavior, ChannelServer, ChannelType, ChannelWorker, LocalExchange, MemoryStore,
//!     Responder, ServerConfig, Source,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Counter;
//! impl ChannelBehavior for Counter {}
//!
//! fn bump(w: &mut ChannelWorker<Counter>, _src: &Source, _data: Value, responder: Responder) {
//!     let n = w.get_channel_data("public.count").and_then(Value::as_u64).unwrap_or(0) + 1;
//!     w.set_channel_data("public.count", Some(json!(n))).unwrap();
//!     responder.ok(json!(n));
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = ChannelServer::new(
//!         Arc::new(LocalExchange::new()),
//!         Arc::new(MemoryStore::new()),
//!         ServerConfig::default(),
//!     );
//!     server
//!         .register_channel_type(ChannelType::new("counter", |_| Counter).autocreate().handler("bump", bump))
//!         .unwrap();
//!     server.register_channel_type(ChannelType::new("console", |_| Counter)).unwrap();
//!     server.create_channel_local("console.main").await.unwrap();
//!
//!     // counter.a does not exist yet; the first message creates it.
//!     let n = server.request_from("console.main", "counter.a", "bump", json!(null)).await.unwrap();
//!     assert_eq!(n, json!(1));
//! }
//! ```
//!
//! ## Concurrency Model
//!
//! - One task per channel; messages and ticks are handled one at a time
//! - Handlers are synchronous, so a channel's state never changes mid-handler
//! - Sends are published after the handler returns, in order, so messages from one
//!   channel to another arrive in the order they were sent
//! - A panicking handler is caught at the worker boundary and reported; the channel and
//!   its siblings keep running
//!
//! ## Testing
//!
//! [`mock::MockLink`] scripts the server side of a [`client::Link`] so the client mirror
//! can be tested without sockets. Channel behavior is best tested against a real
//! [`ChannelServer`] over a [`LocalExchange`] and a [`MemoryStore`].

pub mod ack;
pub mod behavior;
pub mod channel;
pub mod client;
pub mod client_channel;
pub mod cmd_parse;
pub mod config;
pub mod data;
pub mod error;
pub mod exchange;
pub mod mock;
pub mod net;
pub mod packet;
pub mod registry;
pub mod server;
pub mod store;
pub mod tracing;
pub mod worker;

// Re-export core types for convenience
pub use ack::{Payload, Responder, ResponseMode};
pub use behavior::ChannelBehavior;
pub use channel::{ChannelId, SenderIds, Source};
pub use config::{ClientConfig, ServerConfig};
pub use data::{ChannelData, DataPath, DataPathError};
pub use error::FabricError;
pub use exchange::{Exchange, LocalExchange};
pub use packet::{Packet, PacketError};
pub use registry::{ChannelOptions, ChannelType};
pub use server::ChannelServer;
pub use store::{DataStore, FileStore, MemoryStore};
pub use worker::{ChannelSnapshot, ChannelWorker};
