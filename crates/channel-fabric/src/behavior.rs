//! # ChannelBehavior Trait
//!
//! `ChannelBehavior` is the contract an application type implements to live inside a
//! [`ChannelWorker`]. The worker owns the runtime concerns (data, subscriptions,
//! sequencing, correlation); the behavior owns whatever app state it needs and reacts
//! through hooks.
//!
//! # Provided Methods (Hooks)
//!
//! Every hook has a default, so a behavior only overrides what it cares about:
//! - [`ChannelBehavior::on_new_client`]: may refuse a subscriber.
//! - [`ChannelBehavior::on_client_leave`]
//! - [`ChannelBehavior::on_client_changed`]: a subscriber logged in or out.
//! - [`ChannelBehavior::on_set_channel_data`]: may deny a write from another channel.
//! - [`ChannelBehavior::tick`]: called on every server tick.
//! - [`ChannelBehavior::on_unhandled`]: a message no table claimed.
//! - [`ChannelBehavior::on_connection_event`]: only meaningful for channels bridged to a socket.
//!
//! Hooks are associated functions that receive the whole worker, so they can send
//! messages and mutate data the same way handlers do. They are synchronous: a hook runs
//! to completion before the worker looks at its next message.

use crate::ack::Responder;
use crate::channel::{ChannelId, Source};
use crate::data::DataPath;
use crate::net::ConnectionEvent;
use crate::worker::ChannelWorker;
use serde_json::Value;
use std::time::Duration;

/// Messages that carry replicated state or membership events. Channels that subscribe
/// to other channels receive them routinely, so they are accepted silently by default.
pub const REPLICATION_MESSAGES: &[&str] = &["channel_data", "apply_channel_data", "join", "leave"];

pub trait ChannelBehavior: Send + Sized + 'static {
    /// Return an error string to refuse the subscription.
    fn on_new_client(_worker: &mut ChannelWorker<Self>, _client: &Source) -> Result<(), String> {
        Ok(())
    }

    fn on_client_leave(_worker: &mut ChannelWorker<Self>, _client: &ChannelId) {}

    fn on_client_changed(_worker: &mut ChannelWorker<Self>, _client: &Source) {}

    /// Return false to deny `source` writing `key`. `None` means delete.
    fn on_set_channel_data(
        _worker: &ChannelWorker<Self>,
        _source: &Source,
        _key: &DataPath,
        _value: Option<&Value>,
    ) -> bool {
        true
    }

    fn tick(_worker: &mut ChannelWorker<Self>, _dt: Duration, _server_time: u64) {}

    fn on_unhandled(
        _worker: &mut ChannelWorker<Self>,
        _source: &Source,
        msg: &str,
        _data: Value,
        responder: Responder,
    ) {
        if REPLICATION_MESSAGES.contains(&msg) {
            responder.done();
        } else {
            responder.fail(format!("No handler registered for \"{msg}\""));
        }
    }

    fn on_connection_event(_worker: &mut ChannelWorker<Self>, _event: ConnectionEvent) {}
}
