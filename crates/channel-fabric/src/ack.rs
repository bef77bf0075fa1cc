//! # Ack / RPC Layer
//!
//! Correlates requests with responses on top of [`Packet`].
//!
//! ## Envelope
//!
//! ```text
//! flags: IS_RESP | HAS_RESP | ERR | DATA | DATA_JSON   (upper five bits of byte 0)
//! msg:          AnsiString name, or Int request id when IS_RESP
//! resp_pak_id:  Int, present when HAS_RESP (the sender wants an answer)
//! err:          String, present when ERR
//! data:         JSON when DATA_JSON, or the rest of the packet when DATA
//! ```
//!
//! ## Flow
//!
//! 1. The sender calls [`AckState::wrap_message`] with a [`ResponseMode`]. `Expect(cb)`
//!    allocates a packet id and parks `cb` until the answer arrives.
//! 2. The receiver reads the [`Envelope`] and calls [`AckState::handle_message`], which
//!    returns either a [`Incoming::Request`] for the message tables or a resolved
//!    [`Incoming::Response`] carrying the parked callback.
//! 3. Requests come with a [`Responder`]. It is consumed by use, so a request can never
//!    be answered twice.
//!
//! Slow answers are only logged (15 s by default). Nothing here aborts or retries.

use crate::error::ERR_DISCONNECTED;
use crate::packet::{Packet, PacketError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const ACK_IS_RESP: u8 = 1 << 3;
pub const ACK_HAS_RESP: u8 = 1 << 4;
pub const ACK_ERR: u8 = 1 << 5;
pub const ACK_DATA: u8 = 1 << 6;
pub const ACK_DATA_JSON: u8 = 1 << 7;

pub const DEFAULT_RESPONSE_WARN: Duration = Duration::from_secs(15);

/// Message selector: a name for requests, a packet id for responses.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Name(String),
    Response(u32),
}

impl Msg {
    pub fn name(name: impl Into<String>) -> Self {
        Msg::Name(name.into())
    }
}

impl std::fmt::Display for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Msg::Name(name) => write!(f, "{name}"),
            Msg::Response(id) => write!(f, "#{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    None,
    Json(Value),
    Packet(Packet),
}

impl Payload {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    /// JSON view of the payload. Binary payloads have no JSON form and read as `null`.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(v) => v,
            Payload::None | Payload::Packet(_) => Value::Null,
        }
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

/// Whether the sender wants an answer. `Expect` carries whatever the endpoint uses
/// to resume once the answer arrives.
pub enum ResponseMode<C> {
    FireAndForget,
    Expect(C),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub msg: Msg,
    pub pak_id: Option<u32>,
    pub err: Option<String>,
    pub data: Payload,
}

/// Protocol violations detected while correlating.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AckError {
    #[error("Received response to unknown packet with id {id} from {peer}")]
    UnknownPacketId { id: u32, peer: String },
    #[error("Received message with no .msg from {peer}")]
    MissingMsg { peer: String },
}

/// A parked callback.
pub struct PendingRpc<C> {
    pub id: u32,
    pub msg: String,
    pub callback: C,
    pub registered_at: Instant,
}

/// Outgoing answer produced by a [`Responder`].
#[derive(Debug)]
pub struct Reply {
    pub msg: Msg,
    pub err: Option<String>,
    pub data: Payload,
}

pub type ReplySink = Box<dyn FnOnce(Reply) + Send>;

pub enum Incoming<C> {
    Request {
        msg: String,
        data: Payload,
        responder: Responder,
    },
    Response {
        pending: PendingRpc<C>,
        err: Option<String>,
        data: Payload,
        responder: Responder,
    },
}

/// Per-endpoint correlation state.
pub struct AckState<C> {
    last_pak_id: u32,
    resp_cbs: HashMap<u32, PendingRpc<C>>,
    responses_waiting: Arc<AtomicI64>,
    warn_after: Duration,
}

impl<C> Default for AckState<C> {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_WARN)
    }
}

impl<C> AckState<C> {
    pub fn new(warn_after: Duration) -> Self {
        Self {
            last_pak_id: 0,
            resp_cbs: HashMap::new(),
            responses_waiting: Arc::new(AtomicI64::new(0)),
            warn_after,
        }
    }

    /// Callbacks still waiting for an answer.
    pub fn pending(&self) -> usize {
        self.resp_cbs.len()
    }

    /// Requests received that still owe an answer.
    pub fn responses_waiting(&self) -> i64 {
        self.responses_waiting.load(Ordering::Relaxed)
    }

    /// Writes the envelope header into `pak`. Returns the allocated packet id when
    /// `mode` expects a response.
    pub fn wrap_message(
        &mut self,
        pak: &mut Packet,
        msg: Msg,
        err: Option<&str>,
        data: Payload,
        mode: ResponseMode<C>,
    ) -> Option<u32> {
        let pak_id = match mode {
            ResponseMode::FireAndForget => None,
            ResponseMode::Expect(callback) => {
                self.last_pak_id += 1;
                let id = self.last_pak_id;
                self.resp_cbs.insert(
                    id,
                    PendingRpc {
                        id,
                        msg: msg.to_string(),
                        callback,
                        registered_at: Instant::now(),
                    },
                );
                Some(id)
            }
        };
        write_envelope(pak, &msg, pak_id, err, data);
        pak_id
    }

    /// Removes a parked callback without resolving it through a response, e.g. when
    /// delivery failed and the caller reports the routing error itself.
    pub fn take_pending(&mut self, id: u32) -> Option<PendingRpc<C>> {
        self.resp_cbs.remove(&id)
    }

    /// Correlates a received envelope.
    pub fn handle_message(
        &mut self,
        source: &str,
        env: Envelope,
        sink: ReplySink,
    ) -> Result<Incoming<C>, AckError> {
        let reply_id = match &env.msg {
            Msg::Response(id) if env.pak_id.is_some() => {
                warn!(%source, id = *id, "Response asked for a reply, answers to responses are never sent");
                None
            }
            _ => env.pak_id,
        };
        let responder = self.responder(source, &env.msg, reply_id, sink);
        match env.msg {
            Msg::Response(id) => {
                let pending = self.resp_cbs.remove(&id).ok_or(AckError::UnknownPacketId {
                    id,
                    peer: source.to_string(),
                })?;
                let elapsed = pending.registered_at.elapsed();
                if elapsed > self.warn_after {
                    info!(
                        msg = %pending.msg,
                        %source,
                        secs = elapsed.as_secs_f64(),
                        "Response finally received"
                    );
                }
                Ok(Incoming::Response {
                    pending,
                    err: env.err,
                    data: env.data,
                    responder,
                })
            }
            Msg::Name(name) if name.is_empty() => Err(AckError::MissingMsg {
                peer: source.to_string(),
            }),
            Msg::Name(msg) => Ok(Incoming::Request {
                msg,
                data: env.data,
                responder,
            }),
        }
    }

    fn responder(
        &self,
        source: &str,
        msg: &Msg,
        pak_id: Option<u32>,
        sink: ReplySink,
    ) -> Responder {
        let mut responder = Responder {
            msg: msg.to_string(),
            source: source.to_string(),
            pak_id,
            sink: Some(sink),
            started: Instant::now(),
            warn_after: self.warn_after,
            done: None,
            waiting: None,
        };
        if pak_id.is_some() {
            self.responses_waiting.fetch_add(1, Ordering::Relaxed);
            responder.waiting = Some(self.responses_waiting.clone());
            responder.done = spawn_slow_response_watch(source, msg, self.warn_after);
        }
        responder
    }

    /// Drains every parked callback. The caller resolves each one with `ERR_DISCONNECTED`
    /// (or whatever error it passes on).
    pub fn fail_all(&mut self) -> Vec<PendingRpc<C>> {
        let mut drained: Vec<_> = self.resp_cbs.drain().map(|(_, p)| p).collect();
        drained.sort_by_key(|p| p.id);
        if !drained.is_empty() {
            debug!(count = drained.len(), err = ERR_DISCONNECTED, "Failing pending callbacks");
        }
        self.responses_waiting.store(0, Ordering::Relaxed);
        drained
    }

    /// Removes callbacks registered longer than `ttl` ago.
    pub fn take_expired(&mut self, ttl: Duration) -> Vec<PendingRpc<C>> {
        let expired: Vec<u32> = self
            .resp_cbs
            .values()
            .filter(|p| p.registered_at.elapsed() >= ttl)
            .map(|p| p.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.resp_cbs.remove(&id))
            .collect()
    }
}

fn spawn_slow_response_watch(
    source: &str,
    msg: &Msg,
    warn_after: Duration,
) -> Option<oneshot::Sender<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let source = source.to_string();
    let msg = msg.to_string();
    handle.spawn(async move {
        match tokio::time::timeout(warn_after, done_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!(%msg, %source, "Responder dropped without answering"),
            Err(_) => warn!(
                %msg,
                %source,
                secs = warn_after.as_secs(),
                "Response not sent yet"
            ),
        }
    });
    Some(done_tx)
}

/// Writes an envelope without touching any correlation state.
pub fn write_envelope(
    pak: &mut Packet,
    msg: &Msg,
    pak_id: Option<u32>,
    err: Option<&str>,
    data: Payload,
) {
    let mut flags = 0u8;
    match msg {
        Msg::Response(id) => {
            flags |= ACK_IS_RESP;
            pak.write_int(i64::from(*id));
        }
        Msg::Name(name) => pak.write_ansi_string(name),
    }
    if let Some(id) = pak_id {
        flags |= ACK_HAS_RESP;
        pak.write_int(i64::from(id));
    }
    if let Some(err) = err {
        flags |= ACK_ERR;
        pak.write_string(err);
    }
    match data {
        Payload::None => {}
        Payload::Json(v) => {
            flags |= ACK_DATA_JSON;
            pak.write_json(&v);
        }
        Payload::Packet(sub) => {
            flags |= ACK_DATA;
            pak.append(&sub);
            sub.pool();
        }
    }
    pak.update_flags(flags);
}

/// Reads the envelope that [`write_envelope`] produced. A sub-packet payload takes the
/// rest of `pak`.
pub fn read_envelope(pak: &mut Packet) -> Result<Envelope, PacketError> {
    let flags = pak.flags();
    let msg = if flags & ACK_IS_RESP != 0 {
        Msg::Response(read_id(pak)?)
    } else {
        Msg::Name(pak.read_ansi_string()?)
    };
    let pak_id = if flags & ACK_HAS_RESP != 0 {
        Some(read_id(pak)?)
    } else {
        None
    };
    let err = if flags & ACK_ERR != 0 {
        Some(pak.read_string()?)
    } else {
        None
    };
    let data = if flags & ACK_DATA_JSON != 0 {
        Payload::Json(pak.read_json()?)
    } else if flags & ACK_DATA != 0 {
        Payload::Packet(pak.split_remaining())
    } else {
        Payload::None
    };
    Ok(Envelope {
        msg,
        pak_id,
        err,
        data,
    })
}

fn read_id(pak: &mut Packet) -> Result<u32, PacketError> {
    let raw = pak.read_int()?;
    u32::try_from(raw).map_err(|_| PacketError::NegativeLength(raw))
}

/// One-shot answer handle for a received message.
pub struct Responder {
    msg: String,
    source: String,
    pak_id: Option<u32>,
    sink: Option<ReplySink>,
    started: Instant,
    warn_after: Duration,
    done: Option<oneshot::Sender<()>>,
    waiting: Option<Arc<AtomicI64>>,
}

impl Responder {
    /// A responder for locally originated work; answers go nowhere.
    pub fn detached() -> Self {
        Self {
            msg: String::new(),
            source: String::new(),
            pak_id: None,
            sink: None,
            started: Instant::now(),
            warn_after: DEFAULT_RESPONSE_WARN,
            done: None,
            waiting: None,
        }
    }

    pub fn expects_response(&self) -> bool {
        self.pak_id.is_some()
    }

    pub fn respond(mut self, err: Option<String>, data: Payload) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        match self.pak_id {
            None => {
                if let Some(err) = err {
                    sink(Reply {
                        msg: Msg::name("error"),
                        err: None,
                        data: Payload::Json(Value::String(err)),
                    });
                } else if !data.is_none() {
                    debug!(msg = %self.msg, source = %self.source, "Dropping answer to a message that expected none");
                }
            }
            Some(id) => {
                let elapsed = self.started.elapsed();
                if elapsed > self.warn_after {
                    info!(msg = %self.msg, source = %self.source, secs = elapsed.as_secs_f64(), "Response finally sent");
                }
                if let Some(waiting) = self.waiting.take() {
                    waiting.fetch_sub(1, Ordering::Relaxed);
                }
                sink(Reply {
                    msg: Msg::Response(id),
                    err,
                    data,
                });
            }
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    pub fn ok(self, data: Value) {
        self.respond(None, Payload::Json(data));
    }

    pub fn done(self) {
        self.respond(None, Payload::None);
    }

    pub fn fail(self, err: impl Into<String>) {
        self.respond(Some(err.into()), Payload::None);
    }

    pub fn result(self, result: Result<Value, String>) {
        match result {
            Ok(v) => self.ok(v),
            Err(e) => self.fail(e),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(waiting) = self.waiting.take() {
            waiting.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    type Cb = &'static str;

    fn roundtrip(state: &mut AckState<Cb>, msg: Msg, err: Option<&str>, data: Payload, mode: ResponseMode<Cb>) -> Envelope {
        let mut pak = Packet::create(0, 32);
        state.wrap_message(&mut pak, msg, err, data, mode);
        pak.make_readable();
        read_envelope(&mut pak).unwrap()
    }

    fn capture() -> (Arc<Mutex<Vec<Reply>>>, ReplySink) {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink_replies = replies.clone();
        (replies, Box::new(move |r| sink_replies.lock().unwrap().push(r)))
    }

    #[test]
    fn envelope_header_round_trips() {
        let mut state = AckState::<Cb>::default();
        let env = roundtrip(
            &mut state,
            Msg::name("login"),
            None,
            Payload::Json(json!({ "password": "x" })),
            ResponseMode::Expect("cb"),
        );
        assert_eq!(env.msg, Msg::name("login"));
        assert_eq!(env.pak_id, Some(1));
        assert_eq!(env.err, None);
        assert_eq!(env.data, Payload::Json(json!({ "password": "x" })));
        assert_eq!(state.pending(), 1);

        let env = roundtrip(&mut state, Msg::Response(9), Some("invalid password"), Payload::None, ResponseMode::FireAndForget);
        assert_eq!(env.msg, Msg::Response(9));
        assert_eq!(env.pak_id, None);
        assert_eq!(env.err.as_deref(), Some("invalid password"));
        assert!(env.data.is_none());
    }

    #[test]
    fn sub_packet_payload_takes_remaining_bytes() {
        let mut sub = Packet::create(0, 8);
        sub.write_int(77);
        sub.write_string("tail");
        let mut state = AckState::<Cb>::default();
        let env = roundtrip(&mut state, Msg::name("blob"), None, Payload::Packet(sub), ResponseMode::FireAndForget);
        let Payload::Packet(mut data) = env.data else {
            panic!("expected packet payload");
        };
        assert_eq!(data.read_int().unwrap(), 77);
        assert_eq!(data.read_string().unwrap(), "tail");
    }

    #[tokio::test]
    async fn response_resolves_parked_callback_once() {
        let mut sender = AckState::<Cb>::default();
        let mut receiver = AckState::<Cb>::default();
        let request = roundtrip(&mut sender, Msg::name("ping"), None, Payload::None, ResponseMode::Expect("ping-cb"));

        let (replies, sink) = capture();
        let Ok(Incoming::Request { msg, responder, .. }) = receiver.handle_message("a", request, sink) else {
            panic!("expected request");
        };
        assert_eq!(msg, "ping");
        assert!(responder.expects_response());
        assert_eq!(receiver.responses_waiting(), 1);
        responder.ok(json!("pong"));
        assert_eq!(receiver.responses_waiting(), 0);

        let reply = replies.lock().unwrap().pop().unwrap();
        let mut pak = Packet::create(0, 16);
        write_envelope(&mut pak, &reply.msg, None, reply.err.as_deref(), reply.data);
        pak.make_readable();
        let response = read_envelope(&mut pak).unwrap();

        let (_, sink) = capture();
        let Ok(Incoming::Response { pending, data, .. }) = sender.handle_message("b", response.clone(), sink) else {
            panic!("expected response");
        };
        assert_eq!(pending.callback, "ping-cb");
        assert_eq!(data, Payload::Json(json!("pong")));

        let (_, sink) = capture();
        assert_eq!(
            sender.handle_message("b", response, sink).err(),
            Some(AckError::UnknownPacketId { id: 1, peer: "b".into() })
        );
    }

    #[tokio::test]
    async fn responses_are_never_answered() {
        let mut sender = AckState::<Cb>::default();
        roundtrip(&mut sender, Msg::name("ping"), None, Payload::None, ResponseMode::Expect("ping-cb"));
        let response = Envelope {
            msg: Msg::Response(1),
            pak_id: Some(9),
            err: None,
            data: Payload::None,
        };

        let (replies, sink) = capture();
        let Ok(Incoming::Response { pending, responder, .. }) = sender.handle_message("b", response, sink) else {
            panic!("expected response");
        };
        assert_eq!(pending.callback, "ping-cb");
        assert!(!responder.expects_response());
        assert_eq!(sender.responses_waiting(), 0);

        responder.ok(json!("thanks"));
        assert!(replies.lock().unwrap().is_empty());
    }

    #[test]
    fn error_answer_to_fire_and_forget_becomes_error_message() {
        let mut receiver = AckState::<Cb>::default();
        let env = Envelope { msg: Msg::name("poke"), pak_id: None, err: None, data: Payload::None };
        let (replies, sink) = capture();
        let Ok(Incoming::Request { responder, .. }) = receiver.handle_message("a", env, sink) else {
            panic!("expected request");
        };
        responder.fail("bad poke");
        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg, Msg::name("error"));
        assert_eq!(replies[0].data, Payload::Json(json!("bad poke")));
    }

    #[test]
    fn success_answer_to_fire_and_forget_is_dropped() {
        let mut receiver = AckState::<Cb>::default();
        let env = Envelope { msg: Msg::name("poke"), pak_id: None, err: None, data: Payload::None };
        let (replies, sink) = capture();
        let Ok(Incoming::Request { responder, .. }) = receiver.handle_message("a", env, sink) else {
            panic!("expected request");
        };
        responder.ok(json!(1));
        assert!(replies.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_name_is_a_protocol_error() {
        let mut receiver = AckState::<Cb>::default();
        let env = Envelope { msg: Msg::name(""), pak_id: None, err: None, data: Payload::None };
        let (_, sink) = capture();
        assert_eq!(
            receiver.handle_message("a", env, sink).err(),
            Some(AckError::MissingMsg { peer: "a".into() })
        );
    }

    #[test]
    fn fail_all_drains_in_id_order_and_late_answers_are_rejected() {
        let mut state = AckState::<Cb>::default();
        for cb in ["one", "two", "three"] {
            let mut pak = Packet::create(0, 8);
            state.wrap_message(&mut pak, Msg::name("q"), None, Payload::None, ResponseMode::Expect(cb));
        }
        let drained: Vec<_> = state.fail_all().into_iter().map(|p| p.callback).collect();
        assert_eq!(drained, vec!["one", "two", "three"]);
        assert_eq!(state.pending(), 0);

        let late = Envelope { msg: Msg::Response(2), pak_id: None, err: None, data: Payload::None };
        let (_, sink) = capture();
        assert!(matches!(
            state.handle_message("peer", late, sink),
            Err(AckError::UnknownPacketId { id: 2, .. })
        ));
    }

    #[test]
    fn expired_callbacks_are_taken_once() {
        let mut state = AckState::<Cb>::default();
        let mut pak = Packet::create(0, 8);
        state.wrap_message(&mut pak, Msg::name("q"), None, Payload::None, ResponseMode::Expect("cb"));
        assert!(state.take_expired(Duration::from_secs(3600)).is_empty());
        assert_eq!(state.take_expired(Duration::ZERO).len(), 1);
        assert!(state.take_expired(Duration::ZERO).is_empty());
    }
}
