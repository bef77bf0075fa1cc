//! # ChannelWorker
//!
//! One task per channel. The worker owns the channel's data, its subscriber list, its
//! outbound subscription refcounts and the correlation state for requests it sent.
//! Nothing else touches these; every change arrives as a [`Delivery`] on the mailbox.
//!
//! ## Loop
//!
//! ```text
//! recv Delivery ─▶ dispatch (sync, panics caught) ─▶ flush outbox (await publish, in order)
//! ```
//!
//! Handlers never await. Anything they send is queued in the outbox and published after
//! the handler returns, one message at a time, so two messages from this channel to the
//! same destination always arrive in the order they were queued.
//!
//! ## Wire layout
//!
//! ```text
//! [flags][Int pkt_idx][JSON SenderIds][ack envelope]
//! ```
//!
//! `pkt_idx` counts per destination and lets the receiver log reordering.

use crate::ack::{read_envelope, AckState, Incoming, Msg, Payload, Reply, ReplySink, Responder, ResponseMode};
use crate::behavior::ChannelBehavior;
use crate::channel::{ChannelId, SenderIds, Source, USER_TYPE};
use crate::cmd_parse::CmdOutcome;
use crate::data::{ChannelData, DataPath, DataPathError};
use crate::error::{
    FabricError, ERR_ACCESS_DENIED, ERR_DISCONNECTED, ERR_NOT_ARRAY, ERR_NOT_FOUND, ERR_NOT_LOGGED_IN,
    ERR_NOT_SUBSCRIBED, ERR_SETIF_MISMATCH, ERR_TIMEOUT,
};
use crate::packet::Packet;
use crate::registry::{Builtin, ChannelType};
use crate::server::{ChannelServer, Delivery};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Resumes a request once its answer (or a routing failure) is known.
pub type Callback<B> = Box<dyn FnOnce(&mut ChannelWorker<B>, Result<Value, String>) + Send>;

struct Outgoing<B: ChannelBehavior> {
    dest: String,
    msg: Msg,
    err: Option<String>,
    data: Payload,
    mode: ResponseMode<Callback<B>>,
    autocreate: bool,
}

type Outbox<B> = Arc<Mutex<VecDeque<Outgoing<B>>>>;

/// Point-in-time view of a channel, for consoles and tests.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub data: ChannelData,
    pub subscribers: Vec<String>,
    pub subscriptions: BTreeMap<String, u32>,
    pub pending_requests: usize,
    /// Last sequence number sent to / received from each peer.
    pub send_pkt_idx: BTreeMap<String, i64>,
    pub recv_pkt_idx: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// [`ChannelWorker::destroy`] was called.
    Requested,
    /// The last subscriber of an auto-destroy channel left. Cancelled if one joins.
    WhenEmpty,
}

pub struct ChannelWorker<B: ChannelBehavior> {
    pub app: B,
    id: ChannelId,
    kind: Arc<ChannelType<B>>,
    server: ChannelServer,
    data: ChannelData,
    ids: SenderIds,
    subscribers: Vec<ChannelId>,
    subscriber_ids: HashMap<ChannelId, SenderIds>,
    adding_client: Option<ChannelId>,
    subscribe_counts: BTreeMap<String, u32>,
    ack: AckState<Callback<B>>,
    send_pkt_idx: HashMap<String, i64>,
    recv_pkt_idx: HashMap<String, i64>,
    outbox: Outbox<B>,
    history: VecDeque<String>,
    mailbox: mpsc::UnboundedReceiver<Delivery>,
    self_tx: mpsc::UnboundedSender<Delivery>,
    inbound: Arc<AtomicUsize>,
    teardown: Option<Teardown>,
}

impl<B: ChannelBehavior> ChannelWorker<B> {
    pub(crate) fn new(
        kind: Arc<ChannelType<B>>,
        server: ChannelServer,
        id: ChannelId,
        mut data: ChannelData,
        self_tx: mpsc::UnboundedSender<Delivery>,
        mailbox: mpsc::UnboundedReceiver<Delivery>,
        inbound: Arc<AtomicUsize>,
    ) -> Self {
        let app = (kind.ctor)(&id);
        if kind.options.maintain_client_list {
            if let Value::Object(public) = &mut data.public {
                public.insert("clients".to_string(), json!({}));
            }
        }
        let mut ids = SenderIds::default();
        if id.is_client() {
            ids.client_id = Some(id.subid().to_string());
        }
        let ack = AckState::new(server.config().response_warn());
        Self {
            app,
            id,
            kind,
            server,
            data,
            ids,
            subscribers: Vec::new(),
            subscriber_ids: HashMap::new(),
            adding_client: None,
            subscribe_counts: BTreeMap::new(),
            ack,
            send_pkt_idx: HashMap::new(),
            recv_pkt_idx: HashMap::new(),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            history: VecDeque::new(),
            mailbox,
            self_tx,
            inbound,
            teardown: None,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn server(&self) -> &ChannelServer {
        &self.server
    }

    pub fn data(&self) -> &ChannelData {
        &self.data
    }

    /// Identity stamped on every outgoing packet.
    pub fn ids(&self) -> &SenderIds {
        &self.ids
    }

    pub fn set_ids(&mut self, ids: SenderIds) {
        self.ids = ids;
    }

    pub fn subscribers(&self) -> &[ChannelId] {
        &self.subscribers
    }

    pub fn subscriber_ids(&self, id: &ChannelId) -> Option<&SenderIds> {
        self.subscriber_ids.get(id)
    }

    /// Current refcount of this channel's subscription to `other`.
    pub fn subscribe_count(&self, other: &str) -> u32 {
        self.subscribe_counts.get(other).copied().unwrap_or(0)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscribe_counts.keys().map(String::as_str)
    }

    pub fn is_subscribed_to(&self, other: &str) -> bool {
        self.subscribe_count(other) > 0
    }

    pub fn pending_requests(&self) -> usize {
        self.ack.pending()
    }

    /// Recent packets, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn get_channel_data(&self, key: &str) -> Option<&Value> {
        key.parse::<DataPath>().ok().and_then(|path| self.data.get(&path))
    }

    /// Writes `key`, or deletes it when `value` is `None`.
    pub fn set_channel_data(&mut self, key: &str, value: Option<Value>) -> Result<(), DataPathError> {
        let path = key.parse::<DataPath>()?;
        self.set_channel_data_at(&path, value, None);
        Ok(())
    }

    /// Writes `path`, broadcasts public changes to every subscriber but `except`, and
    /// persists the whole record.
    pub fn set_channel_data_at(&mut self, path: &DataPath, value: Option<Value>, except: Option<&ChannelId>) {
        self.data.set(path, value.clone());
        if path.is_public() {
            let mut diff = json!({ "key": path.to_string() });
            if let Some(value) = value {
                diff["value"] = value;
            }
            let except = except.or(self.adding_client.as_ref()).cloned();
            self.channel_emit("apply_channel_data", diff, except.as_ref());
        }
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.server.store().set(&self.id.store_key(), &self.data.to_value()) {
            warn!(channel_id = %self.id, error = %e, "Failed to persist channel data");
        }
    }

    pub fn send(&mut self, dest: &str, msg: &str, data: Value) {
        self.queue(dest, Msg::name(msg), None, Payload::Json(data), ResponseMode::FireAndForget, true);
    }

    pub fn request(
        &mut self,
        dest: &str,
        msg: &str,
        data: Value,
        callback: impl FnOnce(&mut Self, Result<Value, String>) + Send + 'static,
    ) {
        self.queue(
            dest,
            Msg::name(msg),
            None,
            Payload::Json(data),
            ResponseMode::Expect(Box::new(callback)),
            true,
        );
    }

    /// Sends `msg` to every subscriber except `except`.
    pub fn channel_emit(&mut self, msg: &str, data: Value, except: Option<&ChannelId>) {
        let targets: Vec<ChannelId> = self
            .subscribers
            .iter()
            .filter(|s| Some(*s) != except)
            .cloned()
            .collect();
        for target in targets {
            self.send(target.as_str(), msg, data.clone());
        }
    }

    fn queue(
        &mut self,
        dest: &str,
        msg: Msg,
        err: Option<String>,
        data: Payload,
        mode: ResponseMode<Callback<B>>,
        autocreate: bool,
    ) {
        enqueue(
            &self.outbox,
            Outgoing {
                dest: dest.to_string(),
                msg,
                err,
                data,
                mode,
                autocreate,
            },
        );
    }

    /// Refcounted: only the 0→1 transition sends `subscribe`.
    pub fn subscribe_other(&mut self, other: &str) {
        self.subscribe_other_with(other, |_, _| {});
    }

    /// Like [`subscribe_other`](Self::subscribe_other), then calls `on_done` once the
    /// target accepted or refused. A subscription that already exists completes at once.
    pub fn subscribe_other_with(
        &mut self,
        other: &str,
        on_done: impl FnOnce(&mut Self, Result<(), String>) + Send + 'static,
    ) {
        let count = self.subscribe_counts.entry(other.to_string()).or_insert(0);
        *count += 1;
        if *count != 1 {
            return on_done(self, Ok(()));
        }
        debug!(channel_id = %self.id, %other, "Subscribing");
        let target = other.to_string();
        self.queue(
            other,
            Msg::name(Builtin::Subscribe.name()),
            None,
            Payload::None,
            ResponseMode::Expect(Box::new(move |w: &mut Self, res: Result<Value, String>| {
                if let Err(err) = &res {
                    if let Some(count) = w.subscribe_counts.get_mut(&target) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            w.subscribe_counts.remove(&target);
                        }
                    }
                    w.on_error(&format!("Error subscribing to {target}: {err}"));
                }
                on_done(w, res.map(|_| ()));
            })),
            true,
        );
    }

    /// Refcounted: only the 1→0 transition sends `unsubscribe`. Never auto-creates the
    /// target.
    pub fn unsubscribe_other(&mut self, other: &str) -> Result<(), FabricError> {
        let Some(count) = self.subscribe_counts.get_mut(other) else {
            debug_assert!(self.id.is_client(), "{} unsubscribed past zero from {other}", self.id);
            error!(channel_id = %self.id, %other, "Unsubscribe from a channel not subscribed to");
            return Err(FabricError::Remote(ERR_NOT_SUBSCRIBED.to_string()));
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        self.subscribe_counts.remove(other);
        debug!(channel_id = %self.id, %other, "Unsubscribing");
        let target = other.to_string();
        self.queue(
            other,
            Msg::name(Builtin::Unsubscribe.name()),
            None,
            Payload::None,
            ResponseMode::Expect(Box::new(move |w: &mut Self, res| {
                if let Err(err) = res {
                    if err != ERR_NOT_FOUND {
                        w.on_error(&format!("Error unsubscribing from {target}: {err}"));
                    }
                }
            })),
            false,
        );
        Ok(())
    }

    pub fn unsubscribe_all(&mut self) {
        let others: Vec<String> = self.subscribe_counts.keys().cloned().collect();
        for other in others {
            self.subscribe_counts.insert(other.clone(), 1);
            let _ = self.unsubscribe_other(&other);
        }
    }

    pub fn on_error(&self, msg: &str) {
        error!(channel_id = %self.id, "{msg}");
    }

    /// Unregisters this channel once the current message has been handled.
    pub fn destroy(&mut self) {
        self.teardown = Some(Teardown::Requested);
    }

    pub(crate) async fn run(mut self) {
        info!(channel_id = %self.id, "Channel started");
        while let Some(delivery) = self.mailbox.recv().await {
            if matches!(delivery, Delivery::Packet { .. }) {
                self.inbound.fetch_sub(1, Ordering::SeqCst);
            }
            let stop = matches!(delivery, Delivery::Shutdown);
            self.guarded(|w| w.handle_delivery(delivery));
            self.flush_outbox().await;
            if stop {
                break;
            }
            if self.teardown.is_some() && self.try_retire().await {
                break;
            }
        }
        info!(channel_id = %self.id, "Channel stopped");
    }

    /// Leaves the exchange unless a packet is already on its way in. In that case the
    /// packet is handled first and the attempt repeats after it.
    async fn try_retire(&mut self) -> bool {
        if self.teardown == Some(Teardown::WhenEmpty) && !self.subscribers.is_empty() {
            debug!(channel_id = %self.id, "Subscriber arrived, keeping channel");
            self.teardown = None;
            return false;
        }
        let inbound = self.inbound.clone();
        let idle = move || inbound.load(Ordering::SeqCst) == 0;
        if !self.server.exchange().unregister_if(self.id.as_str(), &idle).await {
            debug!(channel_id = %self.id, "Packets in flight, destroy postponed");
            return false;
        }
        self.teardown = None;
        self.server.channel_retired(&self.id, &self.self_tx);
        self.guarded(|w| w.handle_delivery(Delivery::Shutdown));
        self.flush_outbox().await;
        true
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Packet { source, pak } => self.handle_packet(source, pak),
            Delivery::Flush => {}
            Delivery::Tick { dt, server_time } => {
                self.expire_requests();
                B::tick(self, dt, server_time);
            }
            Delivery::Connection(event) => B::on_connection_event(self, event),
            Delivery::WorkerRemoved(id) => {
                self.send_pkt_idx.remove(&id);
                self.recv_pkt_idx.remove(&id);
            }
            Delivery::Inject { dest, msg, data, reply } => match reply {
                Some(tx) => self.request(&dest, &msg, data, move |_, res| {
                    let _ = tx.send(res.map_err(FabricError::from_wire));
                }),
                None => self.send(&dest, &msg, data),
            },
            Delivery::Inspect(tx) => {
                let _ = tx.send(self.snapshot());
            }
            Delivery::Shutdown => {
                self.unsubscribe_all();
                for pending in self.ack.fail_all() {
                    (pending.callback)(self, Err(ERR_DISCONNECTED.to_string()));
                }
            }
        }
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            data: self.data.clone(),
            subscribers: self.subscribers.iter().map(|s| s.to_string()).collect(),
            subscriptions: self.subscribe_counts.clone(),
            pending_requests: self.ack.pending(),
            send_pkt_idx: self.send_pkt_idx.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            recv_pkt_idx: self.recv_pkt_idx.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    fn record(&mut self, entry: String) {
        let limit = self.server.config().packet_history;
        if limit == 0 {
            return;
        }
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    fn handle_packet(&mut self, source: String, mut pak: Packet) {
        let pkt_idx = match pak.read_int() {
            Ok(idx) => idx,
            Err(e) => return self.on_error(&format!("Malformed packet from {source}: {e}")),
        };
        let expected = self.recv_pkt_idx.get(&source).copied().unwrap_or(0) + 1;
        if pkt_idx != expected {
            warn!(channel_id = %self.id, %source, pkt_idx, expected, "Out of order packet");
        }
        self.recv_pkt_idx.insert(source.clone(), pkt_idx);

        let ids: SenderIds = match pak.read_json() {
            Ok(ids) => ids,
            Err(e) => return self.on_error(&format!("Malformed sender ids from {source}: {e}")),
        };
        let env = match read_envelope(&mut pak) {
            Ok(env) => env,
            Err(e) => return self.on_error(&format!("Malformed envelope from {source}: {e}")),
        };
        let channel_id = match ChannelId::parse(&source) {
            Ok(id) => id,
            Err(_) => return self.on_error(&format!("Packet from invalid channel id {source:?}")),
        };
        self.record(format!("{source} #{pkt_idx} {}", env.msg));

        let sink = self.reply_sink(&source);
        let incoming = match self.ack.handle_message(&source, env, sink) {
            Ok(incoming) => incoming,
            Err(e) => return self.on_error(&e.to_string()),
        };
        let source = Source { channel_id, ids };
        match incoming {
            Incoming::Request { msg, data, responder } => {
                debug!(channel_id = %self.id, src = %source.channel_id, %msg, "recv");
                self.channel_message(&source, &msg, data.into_json(), responder);
            }
            Incoming::Response { pending, err, data, .. } => {
                let result = match err {
                    Some(err) => Err(err),
                    None => Ok(data.into_json()),
                };
                (pending.callback)(self, result);
            }
        }
    }

    /// Answers go through the outbox so they keep their place among this channel's
    /// other sends.
    fn reply_sink(&self, dest: &str) -> ReplySink {
        let outbox = self.outbox.clone();
        let wake = self.self_tx.clone();
        let dest = dest.to_string();
        Box::new(move |reply: Reply| {
            enqueue(
                &outbox,
                Outgoing {
                    dest,
                    msg: reply.msg,
                    err: reply.err,
                    data: reply.data,
                    mode: ResponseMode::FireAndForget,
                    autocreate: false,
                },
            );
            let _ = wake.send(Delivery::Flush);
        })
    }

    /// Dispatch: filters, then built-ins, then app handlers, then the fallback hook.
    pub fn channel_message(&mut self, source: &Source, msg: &str, data: Value, responder: Responder) {
        let kind = self.kind.clone();
        let mut filtered = false;
        if let Some(filter) = kind.filters.get(msg) {
            filter(self, source, &data);
            filtered = true;
        }
        if kind.options.maintain_client_list
            && source.channel_id.channel_type() == USER_TYPE
            && (msg == "channel_data" || msg == "apply_channel_data")
        {
            self.track_display_name(source, msg, &data);
            filtered = true;
        }
        if let Ok(builtin) = msg.parse::<Builtin>() {
            return self.handle_builtin(builtin, source, data, responder);
        }
        if let Some(handler) = kind.handlers.get(msg) {
            return handler(self, source, data, responder);
        }
        if filtered {
            return responder.done();
        }
        B::on_unhandled(self, source, msg, data, responder);
    }

    fn handle_builtin(&mut self, builtin: Builtin, source: &Source, data: Value, responder: Responder) {
        match builtin {
            Builtin::Subscribe => self.add_client(source, responder),
            Builtin::Unsubscribe => self.remove_client(&source.channel_id, responder),
            Builtin::SetChannelData => self.on_set_channel_data(source, data, responder),
            Builtin::SetChannelDataIf => self.on_set_channel_data_if(source, data, responder),
            Builtin::SetChannelDataPush => self.on_set_channel_data_push(source, data, responder),
            Builtin::Broadcast => self.on_broadcast(source, data, responder),
            Builtin::ClientChanged => {
                self.client_changed(source);
                responder.done();
            }
            Builtin::CmdParse => self.on_cmd_parse(data, responder),
            Builtin::Error => {
                self.on_error(&format!("Unhandled error from {}: {data}", source.channel_id));
                responder.done();
            }
        }
    }

    fn add_client(&mut self, source: &Source, responder: Responder) {
        let client = source.channel_id.clone();
        if self.subscribers.contains(&client) {
            debug!(channel_id = %self.id, %client, "Already subscribed, resending data");
            self.send_snapshot(&client);
            return responder.done();
        }
        if self.kind.options.require_login && source.user_id().is_none() {
            return responder.fail(ERR_NOT_LOGGED_IN);
        }
        if let Err(err) = B::on_new_client(self, source) {
            return responder.fail(err);
        }
        self.adding_client = Some(client.clone());
        if self.kind.options.emit_join_leave_events {
            let event = json!({ "client_id": client.as_str(), "ids": source.ids });
            self.channel_emit("join", event, None);
        }
        self.subscribers.push(client.clone());
        self.subscriber_ids.insert(client.clone(), source.ids.clone());
        if self.kind.options.maintain_client_list && client.is_client() {
            self.write_client_entry(&client, &source.ids);
            if let Some(user_id) = source.user_id() {
                self.subscribe_other(&format!("{USER_TYPE}.{user_id}"));
            }
        }
        self.adding_client = None;
        info!(channel_id = %self.id, %client, "Client subscribed");
        self.send_snapshot(&client);
        responder.done();
    }

    fn send_snapshot(&mut self, client: &ChannelId) {
        let snapshot = json!({ "public": self.data.public });
        self.send(client.as_str(), "channel_data", snapshot);
    }

    fn client_entry_path(client: &ChannelId) -> DataPath {
        DataPath::public(["clients", client.subid()])
    }

    fn write_client_entry(&mut self, client: &ChannelId, ids: &SenderIds) {
        let path = Self::client_entry_path(client);
        let value = json!({ "ids": ids });
        self.set_channel_data_at(&path, Some(value), None);
    }

    fn remove_client(&mut self, client: &ChannelId, responder: Responder) {
        let Some(pos) = self.subscribers.iter().position(|s| s == client) else {
            return responder.fail(ERR_NOT_SUBSCRIBED);
        };
        self.subscribers.remove(pos);
        let ids = self.subscriber_ids.remove(client).unwrap_or_default();
        if self.kind.options.maintain_client_list && client.is_client() {
            self.set_channel_data_at(&Self::client_entry_path(client), None, None);
            if let Some(user_id) = &ids.user_id {
                let _ = self.unsubscribe_other(&format!("{USER_TYPE}.{user_id}"));
            }
        }
        if self.kind.options.emit_join_leave_events {
            let event = json!({ "client_id": client.as_str(), "ids": ids });
            self.channel_emit("leave", event, None);
        }
        B::on_client_leave(self, client);
        info!(channel_id = %self.id, %client, "Client unsubscribed");
        responder.done();
        if self.kind.options.auto_destroy && self.subscribers.is_empty() && self.teardown.is_none() {
            self.teardown = Some(Teardown::WhenEmpty);
        }
    }

    fn client_changed(&mut self, source: &Source) {
        let client = &source.channel_id;
        let Some(old) = self.subscriber_ids.get(client).cloned() else {
            return;
        };
        self.subscriber_ids.insert(client.clone(), source.ids.clone());
        if self.kind.options.maintain_client_list && client.is_client() {
            if old.user_id != source.ids.user_id {
                if let Some(user_id) = &old.user_id {
                    let _ = self.unsubscribe_other(&format!("{USER_TYPE}.{user_id}"));
                }
                if let Some(user_id) = &source.ids.user_id {
                    self.subscribe_other(&format!("{USER_TYPE}.{user_id}"));
                }
            }
            self.write_client_entry(client, &source.ids);
        }
        B::on_client_changed(self, source);
    }

    /// Keeps `display_name` in client entries in step with the user channels.
    fn track_display_name(&mut self, source: &Source, msg: &str, data: &Value) {
        let display_name = match msg {
            "channel_data" => data.pointer("/public/display_name"),
            _ if data.get("key").and_then(Value::as_str) == Some("public.display_name") => data.get("value"),
            _ => return,
        };
        let Some(display_name) = display_name.and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let user_id = source.channel_id.subid();
        let clients: Vec<ChannelId> = self
            .subscriber_ids
            .iter()
            .filter(|(id, ids)| id.is_client() && ids.user_id.as_deref() == Some(user_id))
            .map(|(id, _)| id.clone())
            .collect();
        for client in clients {
            let path = DataPath::public(["clients", client.subid(), "ids", "display_name"]);
            if self.data.get(&path).and_then(Value::as_str) == Some(display_name.as_str()) {
                continue;
            }
            if let Some(ids) = self.subscriber_ids.get_mut(&client) {
                ids.display_name = Some(display_name.clone());
            }
            self.set_channel_data_at(&path, Some(Value::String(display_name.clone())), None);
        }
    }

    /// Shared front half of the `set_channel_data*` family.
    fn parse_write(&self, source: &Source, data: &Value) -> Result<(DataPath, Option<Value>, Option<ChannelId>), String> {
        let key = data
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| DataPathError::MissingMember.to_string())?;
        let path = key.parse::<DataPath>().map_err(|e| e.to_string())?;
        let value = data.get("value").cloned();
        if !B::on_set_channel_data(self, source, &path, value.as_ref()) {
            return Err(ERR_ACCESS_DENIED.to_string());
        }
        let pred = data.get("pred").and_then(Value::as_bool).unwrap_or(false);
        Ok((path, value, pred.then(|| source.channel_id.clone())))
    }

    fn on_set_channel_data(&mut self, source: &Source, data: Value, responder: Responder) {
        match self.parse_write(source, &data) {
            Ok((path, value, except)) => {
                self.set_channel_data_at(&path, value, except.as_ref());
                responder.done();
            }
            Err(err) => responder.fail(err),
        }
    }

    fn on_set_channel_data_if(&mut self, source: &Source, data: Value, responder: Responder) {
        let (path, value, except) = match self.parse_write(source, &data) {
            Ok(write) => write,
            Err(err) => return responder.fail(err),
        };
        let current = self.data.get(&path).cloned().unwrap_or(Value::Null);
        let expected = data.get("set_if").cloned().unwrap_or(Value::Null);
        if current != expected {
            return responder.fail(ERR_SETIF_MISMATCH);
        }
        self.set_channel_data_at(&path, value, except.as_ref());
        responder.done();
    }

    fn on_set_channel_data_push(&mut self, source: &Source, data: Value, responder: Responder) {
        let (path, value, except) = match self.parse_write(source, &data) {
            Ok(write) => write,
            Err(err) => return responder.fail(err),
        };
        let mut items = match self.data.get(&path) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return responder.fail(ERR_NOT_ARRAY),
        };
        items.push(value.unwrap_or(Value::Null));
        let index = items.len() - 1;
        self.set_channel_data_at(&path, Some(Value::Array(items)), except.as_ref());
        responder.ok(json!({ "index": index }));
    }

    fn on_broadcast(&mut self, source: &Source, data: Value, responder: Responder) {
        let Some(msg) = data.get("msg").and_then(Value::as_str).map(str::to_string) else {
            return responder.fail("Broadcast requires msg");
        };
        let mut payload = data.get("data").cloned().unwrap_or(Value::Null);
        if let Value::Object(map) = &mut payload {
            map.insert("client_ids".to_string(), serde_json::to_value(&source.ids).unwrap_or_default());
        }
        self.channel_emit(&msg, payload, None);
        responder.done();
    }

    fn on_cmd_parse(&mut self, data: Value, responder: Responder) {
        let input = data.as_str().unwrap_or_default().to_string();
        let reply = self.cmd_parse(&input);
        responder.ok(reply);
    }

    /// Runs a console command against this channel's table. Answers
    /// `{found, resp}` or `{found, err}`.
    pub fn cmd_parse(&mut self, input: &str) -> Value {
        let kind = self.kind.clone();
        match kind.cmds.handle(self, input) {
            CmdOutcome::NotFound(err) => json!({ "found": false, "err": err }),
            CmdOutcome::Handled(Ok(resp)) => json!({ "found": true, "resp": resp }),
            CmdOutcome::Handled(Err(err)) => json!({ "found": true, "err": err }),
        }
    }

    fn expire_requests(&mut self) {
        let Some(ttl) = self.server.config().rpc_ttl() else {
            return;
        };
        for pending in self.ack.take_expired(ttl) {
            warn!(channel_id = %self.id, msg = %pending.msg, id = pending.id, "Request expired");
            (pending.callback)(self, Err(ERR_TIMEOUT.to_string()));
        }
    }

    /// Runs `f`, turning a panic into a crash report instead of killing the task.
    fn guarded(&mut self, f: impl FnOnce(&mut Self)) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(self))) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            self.report_crash(&reason);
        }
    }

    fn report_crash(&mut self, reason: &str) {
        let history: Vec<String> = self.history.iter().cloned().collect();
        error!(
            channel_id = %self.id,
            %reason,
            data = %self.data.to_value(),
            ?history,
            "Handler panicked"
        );
        if let Some(admin) = self.server.config().admin_channel.clone() {
            let report = json!({
                "channel_id": self.id.as_str(),
                "reason": reason,
                "data": self.data.to_value(),
                "history": history,
            });
            self.send(&admin, "crash", report);
        }
    }

    fn pop_outgoing(&self) -> Option<Outgoing<B>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    async fn flush_outbox(&mut self) {
        while let Some(out) = self.pop_outgoing() {
            self.deliver(out).await;
        }
    }

    async fn deliver(&mut self, out: Outgoing<B>) {
        let Outgoing {
            dest,
            msg,
            err,
            data,
            mode,
            autocreate,
        } = out;
        // Committed only once the packet is delivered.
        let pkt_idx = self.send_pkt_idx.get(&dest).copied().unwrap_or(0) + 1;

        let mut pak = Packet::create(0, 64);
        pak.write_int(pkt_idx);
        pak.write_json(&self.ids);
        let pak_id = self.ack.wrap_message(&mut pak, msg.clone(), err.as_deref(), data, mode);
        pak.make_readable();
        debug!(channel_id = %self.id, %dest, %msg, "send");

        let published = self
            .server
            .publish_with_retry(self.id.as_str(), &dest, pak, autocreate)
            .await;
        match published {
            Ok(()) => {
                self.send_pkt_idx.insert(dest, pkt_idx);
            }
            Err(e) => match pak_id.and_then(|id| self.ack.take_pending(id)) {
                Some(pending) => {
                    let code = e.code();
                    self.guarded(move |w| (pending.callback)(w, Err(code)));
                }
                None => warn!(channel_id = %self.id, %dest, %msg, error = %e, "Failed to deliver message"),
            },
        }
    }
}

fn enqueue<B: ChannelBehavior>(outbox: &Outbox<B>, out: Outgoing<B>) {
    outbox
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_back(out);
}
