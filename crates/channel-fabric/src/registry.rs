//! # Channel Type Registration
//!
//! A [`ChannelType`] bundles everything the server needs to build channels of one type:
//! the constructor, the capability flags in [`ChannelOptions`], and the three dispatch
//! tables (handlers, filters, console commands).
//!
//! Built-in messages are not table entries. They are parsed into [`Builtin`] once per
//! message, and registering an app handler under a built-in name is rejected when the
//! type is registered with the server.
//!
//! ```text
//! ChannelType::new("room", |_| Room::default())
//!     .autocreate()
//!     .maintain_client_list()
//!     .handler("chat", Room::on_chat)
//!     .cmd("topic", Room::cmd_topic)
//! ```

use crate::ack::Responder;
use crate::behavior::ChannelBehavior;
use crate::channel::ChannelId;
use crate::channel::Source;
use crate::cmd_parse::{CmdHandler, CmdParse};
use crate::data::ChannelData;
use crate::error::FabricError;
use crate::server::{ChannelServer, Delivery};
use crate::worker::ChannelWorker;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type Handler<B> = fn(&mut ChannelWorker<B>, &Source, Value, Responder);
pub type Filter<B> = fn(&mut ChannelWorker<B>, &Source, &Value);
pub type Ctor<B> = Arc<dyn Fn(&ChannelId) -> B + Send + Sync>;
pub type SubidValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Messages every channel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Subscribe,
    Unsubscribe,
    SetChannelData,
    SetChannelDataIf,
    SetChannelDataPush,
    Broadcast,
    ClientChanged,
    CmdParse,
    Error,
}

impl Builtin {
    pub const ALL: [Builtin; 9] = [
        Builtin::Subscribe,
        Builtin::Unsubscribe,
        Builtin::SetChannelData,
        Builtin::SetChannelDataIf,
        Builtin::SetChannelDataPush,
        Builtin::Broadcast,
        Builtin::ClientChanged,
        Builtin::CmdParse,
        Builtin::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Subscribe => "subscribe",
            Builtin::Unsubscribe => "unsubscribe",
            Builtin::SetChannelData => "set_channel_data",
            Builtin::SetChannelDataIf => "set_channel_data_if",
            Builtin::SetChannelDataPush => "set_channel_data_push",
            Builtin::Broadcast => "broadcast",
            Builtin::ClientChanged => "client_changed",
            Builtin::CmdParse => "cmdparse",
            Builtin::Error => "error",
        }
    }
}

impl FromStr for Builtin {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Builtin::ALL.into_iter().find(|b| b.name() == s).ok_or(())
    }
}

/// Capability flags checked by the runtime.
#[derive(Clone, Default)]
pub struct ChannelOptions {
    /// Create on first contact instead of failing with `ERR_NOT_FOUND`.
    pub autocreate: bool,
    /// Keep `public.clients.<id>.ids` in sync with subscribed client channels.
    pub maintain_client_list: bool,
    /// Emit `join` / `leave` to other subscribers.
    pub emit_join_leave_events: bool,
    /// Destroy the channel when its last subscriber leaves.
    pub auto_destroy: bool,
    /// Refuse subscribers that are not logged in.
    pub require_login: bool,
    pub subid_validator: Option<SubidValidator>,
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("autocreate", &self.autocreate)
            .field("maintain_client_list", &self.maintain_client_list)
            .field("emit_join_leave_events", &self.emit_join_leave_events)
            .field("auto_destroy", &self.auto_destroy)
            .field("require_login", &self.require_login)
            .field("subid_validator", &self.subid_validator.is_some())
            .finish()
    }
}

impl ChannelOptions {
    pub fn accepts_subid(&self, subid: &str) -> bool {
        self.subid_validator
            .as_ref()
            .map_or(true, |validate| validate(subid))
    }
}

pub struct ChannelType<B: ChannelBehavior> {
    pub(crate) name: String,
    pub(crate) ctor: Ctor<B>,
    pub(crate) options: ChannelOptions,
    pub(crate) handlers: HashMap<String, Handler<B>>,
    pub(crate) filters: HashMap<String, Filter<B>>,
    pub(crate) cmds: CmdParse<ChannelWorker<B>>,
    collisions: Vec<String>,
}

impl<B: ChannelBehavior> ChannelType<B> {
    pub fn new(name: impl Into<String>, ctor: impl Fn(&ChannelId) -> B + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            ctor: Arc::new(ctor),
            options: ChannelOptions::default(),
            handlers: HashMap::new(),
            filters: HashMap::new(),
            cmds: CmdParse::new(),
            collisions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn autocreate(mut self) -> Self {
        self.options.autocreate = true;
        self
    }

    pub fn maintain_client_list(mut self) -> Self {
        self.options.maintain_client_list = true;
        self
    }

    pub fn emit_join_leave_events(mut self) -> Self {
        self.options.emit_join_leave_events = true;
        self
    }

    pub fn auto_destroy(mut self) -> Self {
        self.options.auto_destroy = true;
        self
    }

    pub fn require_login(mut self) -> Self {
        self.options.require_login = true;
        self
    }

    pub fn subid_validator(mut self, validate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.options.subid_validator = Some(Arc::new(validate));
        self
    }

    pub fn handler(mut self, msg: &str, handler: Handler<B>) -> Self {
        if msg.parse::<Builtin>().is_ok() || self.handlers.insert(msg.to_string(), handler).is_some() {
            self.collisions.push(msg.to_string());
        }
        self
    }

    pub fn filter(mut self, msg: &str, filter: Filter<B>) -> Self {
        if self.filters.insert(msg.to_string(), filter).is_some() {
            self.collisions.push(msg.to_string());
        }
        self
    }

    pub fn cmd(mut self, name: &str, handler: CmdHandler<ChannelWorker<B>>) -> Self {
        if !self.cmds.register(name, handler) {
            self.collisions.push(name.to_string());
        }
        self
    }

    /// Fails with the first name registered twice or shadowing a built-in.
    pub(crate) fn validate(&self) -> Result<(), FabricError> {
        match self.collisions.first() {
            Some(name) => Err(FabricError::DuplicateHandler {
                channel_type: self.name.clone(),
                name: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// A channel built but not yet running.
pub(crate) struct BuiltChannel {
    pub mailbox: mpsc::UnboundedSender<Delivery>,
    /// Packets handed to the mailbox by the exchange and not yet received.
    pub inbound: Arc<AtomicUsize>,
    pub start: Box<dyn FnOnce() -> JoinHandle<()> + Send>,
}

/// Type-erased view of a registered [`ChannelType`].
pub(crate) trait ChannelFactory: Send + Sync {
    fn options(&self) -> &ChannelOptions;
    fn build(&self, server: ChannelServer, id: ChannelId) -> Result<BuiltChannel, FabricError>;
}

pub(crate) struct Registered<B: ChannelBehavior>(pub Arc<ChannelType<B>>);

impl<B: ChannelBehavior> ChannelFactory for Registered<B> {
    fn options(&self) -> &ChannelOptions {
        &self.0.options
    }

    fn build(&self, server: ChannelServer, id: ChannelId) -> Result<BuiltChannel, FabricError> {
        let stored = server.store().get(&id.store_key())?;
        let data = ChannelData::from_stored(id.as_str(), stored);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = Arc::new(AtomicUsize::new(0));
        let worker = ChannelWorker::new(self.0.clone(), server, id, data, tx.clone(), rx, inbound.clone());
        Ok(BuiltChannel {
            mailbox: tx,
            inbound,
            start: Box::new(move || tokio::spawn(worker.run())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl ChannelBehavior for Nop {}

    fn nop_handler(_: &mut ChannelWorker<Nop>, _: &Source, _: Value, responder: Responder) {
        responder.done();
    }

    #[test]
    fn builtin_names_round_trip() {
        for b in Builtin::ALL {
            assert_eq!(b.name().parse::<Builtin>(), Ok(b));
        }
        assert!("chat".parse::<Builtin>().is_err());
    }

    #[test]
    fn shadowing_a_builtin_is_a_collision() {
        let kind = ChannelType::new("room", |_| Nop).handler("subscribe", nop_handler);
        assert!(matches!(
            kind.validate(),
            Err(FabricError::DuplicateHandler { name, .. }) if name == "subscribe"
        ));
    }

    #[test]
    fn duplicate_app_handler_is_a_collision() {
        let kind = ChannelType::new("room", |_| Nop)
            .handler("chat", nop_handler)
            .handler("chat", nop_handler);
        assert!(kind.validate().is_err());
        let ok = ChannelType::new("room", |_| Nop).handler("chat", nop_handler);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn subid_validator_gates_ids() {
        let kind = ChannelType::new("user", |_| Nop)
            .subid_validator(|s| s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(kind.options().accepts_subid("alice"));
        assert!(!kind.options().accepts_subid("al ice"));
        assert!(ChannelOptions::default().accepts_subid("anything"));
    }
}
