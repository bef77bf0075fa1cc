//! # Client Side
//!
//! A client process talks to its `client.u<id>` channel over one [`Link`]. The
//! [`NetClient`] is the TCP implementation; [`crate::mock::MockLink`] stands in for it in
//! tests.
//!
//! [`SubscriptionManager`] sits on top of a link and keeps a local mirror of every
//! channel the client is subscribed to.

mod net_client;
mod subscriptions;

pub use net_client::{LinkEvent, LinkStatus, NetClient};
pub use subscriptions::{prehash, Credentials, MirrorEvent, MirroredChannel, SubscriptionManager, CREDENTIALS_KEY};

use crate::error::FabricError;
use async_trait::async_trait;
use serde_json::Value;

/// Request/response channel to the server.
#[async_trait]
pub trait Link: Send + Sync {
    /// Fire-and-forget.
    async fn send(&self, msg: &str, data: Value) -> Result<(), FabricError>;

    async fn request(&self, msg: &str, data: Value) -> Result<Value, FabricError>;
}
