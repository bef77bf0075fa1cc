//! # Subscription Manager
//!
//! The client-side mirror. Every channel the client touches gets a [`MirroredChannel`]
//! with a refcount and a shadow copy of the channel's public data.
//!
//! ## Replication
//!
//! The first `subscribe` is answered with a `channel_data` snapshot; after that the
//! channel pushes `apply_channel_data {key, value}` diffs, applied with the same dot-path
//! rules the server uses. Local predictive writes are applied at once and the server
//! skips echoing them back to this client.
//!
//! ## Reconnect
//!
//! On every connect the manager resubscribes each channel with a non-zero refcount, in
//! the order the channels were first subscribed, then replays the last successful login
//! (or the stored credentials).
//!
//! Changes are published as [`MirrorEvent`]s on a broadcast channel.

use super::{Link, LinkEvent};
use crate::ack::Responder;
use crate::data::{ChannelData, DataPath};
use crate::error::FabricError;
use crate::store::DataStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CREDENTIALS_KEY: &str = "client/credentials";
const PREHASH_PREFIX: &str = "prehashed$$";
/// Backward server-time corrections smaller than this are ignored.
const SERVER_TIME_JITTER_MS: u64 = 250;

/// `prehashed$$hex(blake3(hex(blake3(name)) + password))`. Already prehashed input is
/// returned unchanged.
pub fn prehash(name: &str, password: &str) -> String {
    if password.starts_with(PREHASH_PREFIX) {
        return password.to_string();
    }
    let salt = blake3::hash(name.as_bytes()).to_hex();
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{PREHASH_PREFIX}{}", hasher.finalize().to_hex())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    Connected { client_id: String, reconnect: bool },
    Disconnected,
    ChannelData { channel_id: String },
    ApplyChannelData { channel_id: String, key: String, value: Option<Value> },
    /// Any other message a channel sent to this client.
    Message { channel_id: String, msg: String, data: Value },
    Login { user_id: String, display_name: String },
    LoginFailed { err: String },
    Logout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirroredChannel {
    pub channel_id: String,
    pub subscriptions: u32,
    /// True once the snapshot for the current subscription arrived.
    pub got_subscription: bool,
    data: ChannelData,
}

impl MirroredChannel {
    fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            subscriptions: 0,
            got_subscription: false,
            data: ChannelData::new(channel_id),
        }
    }

    pub fn public(&self) -> &Value {
        &self.data.public
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        key.parse::<DataPath>().ok().and_then(|path| self.data.get(&path))
    }
}

#[derive(Default)]
struct MirrorState {
    /// First-subscribe order.
    order: Vec<String>,
    channels: HashMap<String, MirroredChannel>,
    client_id: Option<String>,
    connected: bool,
    ever_connected: bool,
    user_id: Option<String>,
    display_name: Option<String>,
    /// Replayed on reconnect.
    credentials: Option<Credentials>,
    login_in_flight: bool,
    server_time: u64,
}

type MessageHandler = Arc<dyn Fn(&str, Value) -> Result<Value, String> + Send + Sync>;

pub struct SubscriptionManager<L: Link> {
    link: Arc<L>,
    state: Mutex<MirrorState>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    events: broadcast::Sender<MirrorEvent>,
    store: Option<Arc<dyn DataStore>>,
}

impl<L: Link + 'static> SubscriptionManager<L> {
    pub fn new(link: Arc<L>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            link,
            state: Mutex::new(MirrorState::default()),
            handlers: Mutex::new(HashMap::new()),
            events,
            store: None,
        }
    }

    /// Persists credentials in `store` and auto-logs-in from them on connect.
    pub fn with_credentials_store(mut self, store: Arc<dyn DataStore>) -> Self {
        let stored = store
            .get(CREDENTIALS_KEY)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value::<Credentials>(v).ok());
        if let Some(creds) = stored {
            debug!(name = %creds.name, "Loaded stored credentials");
            self.lock().credentials = Some(creds);
        }
        self.store = Some(store);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MirrorEvent) {
        let _ = self.events.send(event);
    }

    pub fn events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events.subscribe()
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Answers `msg` requests pushed by channels. Without a handler the message is
    /// only published as [`MirrorEvent::Message`].
    pub fn on_msg(&self, msg: &str, handler: impl Fn(&str, Value) -> Result<Value, String> + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg.to_string(), Arc::new(handler));
    }

    /// Feeds link events into the manager until the link goes away.
    pub fn spawn(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Connected { client_id } => manager.handle_connect(&client_id).await,
                    LinkEvent::Disconnected => manager.handle_disconnect(),
                    LinkEvent::Message { msg, data, responder } => manager.handle_message(&msg, data, responder),
                }
            }
        })
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<MirroredChannel> {
        self.lock().channels.get(channel_id).cloned()
    }

    pub fn get_channel_data(&self, channel_id: &str, key: &str) -> Option<Value> {
        self.lock()
            .channels
            .get(channel_id)
            .and_then(|c| c.get(key).cloned())
    }

    pub fn client_id(&self) -> Option<String> {
        self.lock().client_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn logged_in(&self) -> Option<(String, String)> {
        let state = self.lock();
        state.user_id.clone().zip(state.display_name.clone())
    }

    pub fn server_time(&self) -> u64 {
        self.lock().server_time
    }

    /// Advances the local estimate between server ticks.
    pub fn tick(&self, dt_ms: u64) {
        self.lock().server_time += dt_ms;
    }

    pub fn handle_server_time(&self, server_time: u64) {
        let mut state = self.lock();
        if server_time < state.server_time && state.server_time - server_time < SERVER_TIME_JITTER_MS {
            return;
        }
        state.server_time = server_time;
    }

    /// Refcounted. Only the first subscribe goes to the server; while disconnected it
    /// waits for the next connect.
    pub async fn subscribe(&self, channel_id: &str) -> Result<(), FabricError> {
        let send = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.channels.contains_key(channel_id) {
                state.order.push(channel_id.to_string());
            }
            let channel = state
                .channels
                .entry(channel_id.to_string())
                .or_insert_with(|| MirroredChannel::new(channel_id));
            channel.subscriptions += 1;
            channel.subscriptions == 1 && state.connected
        };
        if send {
            debug!(%channel_id, "Subscribing");
            self.link.request("subscribe", json!(channel_id)).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, channel_id: &str) -> Result<(), FabricError> {
        let send = {
            let mut state = self.lock();
            let connected = state.connected;
            let Some(channel) = state.channels.get_mut(channel_id) else {
                warn!(%channel_id, "Unsubscribe from a channel not subscribed to");
                return Ok(());
            };
            channel.subscriptions = channel.subscriptions.saturating_sub(1);
            if channel.subscriptions > 0 {
                false
            } else {
                state.channels.remove(channel_id);
                state.order.retain(|id| id != channel_id);
                connected
            }
        };
        if send {
            debug!(%channel_id, "Unsubscribing");
            self.link.request("unsubscribe", json!(channel_id)).await?;
        }
        Ok(())
    }

    /// Writes through the client channel. With `predictive` the mirror is updated now
    /// and the server does not echo the change back.
    pub async fn set_channel_data(
        &self,
        channel_id: &str,
        key: &str,
        value: Option<Value>,
        predictive: bool,
    ) -> Result<(), FabricError> {
        let path = key.parse::<DataPath>().map_err(|e| FabricError::Remote(e.to_string()))?;
        if predictive {
            let mut state = self.lock();
            if let Some(channel) = state.channels.get_mut(channel_id) {
                channel.data.set(&path, value.clone());
            }
        }
        let mut data = json!({ "channel_id": channel_id, "key": key, "pred": predictive });
        if let Some(value) = value {
            data["value"] = value;
        }
        self.link.request("set_channel_data", data).await.map(|_| ())
    }

    pub async fn send_channel_msg(
        &self,
        channel_id: &str,
        msg: &str,
        data: Value,
        broadcast: bool,
    ) -> Result<Value, FabricError> {
        let mut payload = json!({ "channel_id": channel_id, "msg": msg, "data": data });
        if broadcast {
            payload["broadcast"] = Value::Bool(true);
        }
        self.link.request("channel_msg", payload).await
    }

    pub async fn handle_connect(&self, client_id: &str) {
        let (reconnect, resubscribe, credentials) = {
            let mut state = self.lock();
            let reconnect = state.ever_connected;
            state.connected = true;
            state.ever_connected = true;
            state.client_id = Some(client_id.to_string());
            let order = state.order.clone();
            let resubscribe: Vec<String> = order
                .into_iter()
                .filter(|id| state.channels.get(id).is_some_and(|c| c.subscriptions > 0))
                .collect();
            (reconnect, resubscribe, state.credentials.clone())
        };
        info!(%client_id, reconnect, "Connected");
        self.emit(MirrorEvent::Connected {
            client_id: client_id.to_string(),
            reconnect,
        });
        for channel_id in resubscribe {
            if let Err(e) = self.link.request("subscribe", json!(channel_id)).await {
                warn!(%channel_id, error = %e, "Resubscribe failed");
            }
        }
        if let Some(creds) = credentials {
            if let Err(e) = self.login_prehashed(creds, true).await {
                warn!(error = %e, "Auto-login failed");
            }
        }
    }

    pub fn handle_disconnect(&self) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.user_id = None;
            state.display_name = None;
            state.login_in_flight = false;
            for channel in state.channels.values_mut() {
                channel.got_subscription = false;
            }
        }
        info!("Disconnected");
        self.emit(MirrorEvent::Disconnected);
    }

    /// Dispatches a message pushed by the server.
    pub fn handle_message(&self, msg: &str, data: Value, responder: Responder) {
        match msg {
            "server_time" => {
                if let Some(t) = data.as_u64() {
                    self.handle_server_time(t);
                }
                responder.done();
            }
            "channel_msg" => {
                let channel_id = data.get("channel_id").and_then(Value::as_str).unwrap_or_default().to_string();
                let inner_msg = data.get("msg").and_then(Value::as_str).unwrap_or_default().to_string();
                let payload = data.get("data").cloned().unwrap_or(Value::Null);
                self.handle_channel_msg(&channel_id, &inner_msg, payload, responder);
            }
            _ => responder.fail(format!("No handler registered for \"{msg}\"")),
        }
    }

    pub fn handle_channel_msg(&self, channel_id: &str, msg: &str, data: Value, responder: Responder) {
        match msg {
            "channel_data" => {
                let public = data.get("public").cloned().unwrap_or_else(|| json!({}));
                {
                    let mut state = self.lock();
                    let Some(channel) = state.channels.get_mut(channel_id) else {
                        debug!(%channel_id, "Snapshot for a channel no longer mirrored");
                        return responder.done();
                    };
                    channel.data.public = public;
                    channel.got_subscription = true;
                }
                self.emit(MirrorEvent::ChannelData {
                    channel_id: channel_id.to_string(),
                });
                responder.done();
            }
            "apply_channel_data" => {
                let Some(key) = data.get("key").and_then(Value::as_str) else {
                    return responder.fail("Missing key");
                };
                let path = match key.parse::<DataPath>() {
                    Ok(path) => path,
                    Err(e) => return responder.fail(e.to_string()),
                };
                let value = data.get("value").cloned();
                {
                    let mut state = self.lock();
                    if let Some(channel) = state.channels.get_mut(channel_id) {
                        channel.data.set(&path, value.clone());
                    }
                }
                self.emit(MirrorEvent::ApplyChannelData {
                    channel_id: channel_id.to_string(),
                    key: key.to_string(),
                    value,
                });
                responder.done();
            }
            _ => {
                let handler = self
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(msg)
                    .cloned();
                self.emit(MirrorEvent::Message {
                    channel_id: channel_id.to_string(),
                    msg: msg.to_string(),
                    data: data.clone(),
                });
                match handler {
                    Some(handler) => responder.result(handler(channel_id, data)),
                    None => responder.done(),
                }
            }
        }
    }

    /// Logs in with a plain password. Only one login may be in flight.
    pub async fn login(&self, name: &str, password: &str) -> Result<String, FabricError> {
        let creds = Credentials {
            name: name.to_string(),
            password: prehash(name, password),
        };
        self.login_prehashed(creds, false).await
    }

    async fn login_prehashed(&self, creds: Credentials, auto: bool) -> Result<String, FabricError> {
        {
            let mut state = self.lock();
            if state.login_in_flight {
                return Err(FabricError::Remote("Login already in progress".to_string()));
            }
            state.login_in_flight = true;
        }
        let result = self
            .link
            .request("login", json!({ "name": creds.name, "password": creds.password }))
            .await;
        self.lock().login_in_flight = false;
        match result {
            Ok(resp) => {
                let display_name = resp
                    .get("display_name")
                    .and_then(Value::as_str)
                    .unwrap_or(&creds.name)
                    .to_string();
                {
                    let mut state = self.lock();
                    state.user_id = Some(creds.name.clone());
                    state.display_name = Some(display_name.clone());
                    state.credentials = Some(creds.clone());
                }
                self.persist_credentials(Some(&creds));
                info!(user_id = %creds.name, %display_name, auto, "Logged in");
                self.emit(MirrorEvent::Login {
                    user_id: creds.name,
                    display_name: display_name.clone(),
                });
                Ok(display_name)
            }
            Err(e) => {
                if auto {
                    // Stored credentials that no longer work are forgotten.
                    self.lock().credentials = None;
                    self.persist_credentials(None);
                }
                self.emit(MirrorEvent::LoginFailed { err: e.code() });
                Err(e)
            }
        }
    }

    pub async fn logout(&self) -> Result<(), FabricError> {
        if self.lock().user_id.is_none() {
            return Err(FabricError::NotLoggedIn);
        }
        self.link.request("logout", Value::Null).await?;
        {
            let mut state = self.lock();
            state.user_id = None;
            state.display_name = None;
            state.credentials = None;
        }
        self.persist_credentials(None);
        self.emit(MirrorEvent::Logout);
        Ok(())
    }

    fn persist_credentials(&self, creds: Option<&Credentials>) {
        let Some(store) = &self.store else {
            return;
        };
        let value = creds.map_or(Value::Null, |c| json!(c));
        if let Err(e) = store.set(CREDENTIALS_KEY, &value) {
            warn!(error = %e, "Failed to persist credentials");
        }
    }

    /// Tries the client channel, then every mirrored channel in subscribe order, until
    /// one knows the command.
    pub async fn send_cmd_parse(&self, cmd: &str) -> Result<String, String> {
        let reply = self
            .link
            .request("cmdparse", json!(cmd))
            .await
            .map_err(|e| e.code())?;
        if let Some(result) = found(&reply) {
            return result;
        }
        let mut last_err = not_found_err(&reply);
        let targets = self.lock().order.clone();
        for channel_id in targets {
            let reply = match self.send_channel_msg(&channel_id, "cmdparse", json!(cmd), false).await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(%channel_id, error = %e, "cmdparse failed");
                    continue;
                }
            };
            if let Some(result) = found(&reply) {
                return result;
            }
            last_err = not_found_err(&reply);
        }
        Err(last_err)
    }
}

fn found(reply: &Value) -> Option<Result<String, String>> {
    if !reply.get("found").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    Some(match reply.get("err").and_then(Value::as_str) {
        Some(err) => Err(err.to_string()),
        None => Ok(reply.get("resp").and_then(Value::as_str).unwrap_or_default().to_string()),
    })
}

fn not_found_err(reply: &Value) -> String {
    reply
        .get("err")
        .and_then(Value::as_str)
        .unwrap_or("Unknown command")
        .to_string()
}
