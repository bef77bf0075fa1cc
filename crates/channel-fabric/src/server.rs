//! # ChannelServer
//!
//! Owns the channel type registry and the channels running in this process.
//!
//! The server is a cheap handle (`Arc` inside) that every worker holds a clone of. It
//! never touches channel state itself: it builds workers, registers them with the
//! [`Exchange`], and talks to them through their mailboxes.
//!
//! ## Auto-create
//!
//! A publish that fails with `ERR_NOT_FOUND` resolves the destination's type and, if the
//! type allows it, creates the channel and tries again. Two creators racing for the same
//! id both build an instance, but only the one that wins the exchange registration is
//! started; the other is dropped and the retry reaches the winner.

use crate::behavior::ChannelBehavior;
use crate::channel::{ChannelId, CLIENT_TYPE};
use crate::client_channel;
use crate::config::ServerConfig;
use crate::error::FabricError;
use crate::exchange::{Exchange, ExchangeHandler};
use crate::net::{Connection, ConnectionEvent};
use crate::packet::Packet;
use crate::registry::{ChannelFactory, ChannelType, Registered};
use crate::store::DataStore;
use crate::worker::ChannelSnapshot;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Everything a worker's mailbox can carry.
pub(crate) enum Delivery {
    Packet { source: String, pak: Packet },
    /// Wakes the worker so queued answers get published.
    Flush,
    Tick { dt: Duration, server_time: u64 },
    Connection(ConnectionEvent),
    /// Another local channel went away; forget its sequence counters.
    WorkerRemoved(String),
    Inject {
        dest: String,
        msg: String,
        data: Value,
        reply: Option<oneshot::Sender<Result<Value, FabricError>>>,
    },
    Inspect(oneshot::Sender<ChannelSnapshot>),
    Shutdown,
}

struct LocalChannel {
    channel_type: String,
    mailbox: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Clock {
    server_time: u64,
    last_tick: Option<Instant>,
}

struct ServerInner {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn DataStore>,
    config: ServerConfig,
    channel_types: RwLock<HashMap<String, Arc<dyn ChannelFactory>>>,
    local_channels: Mutex<HashMap<String, LocalChannel>>,
    connections: Mutex<HashMap<u64, Connection>>,
    clock: Mutex<Clock>,
    last_client_id: AtomicU64,
    closing: AtomicBool,
}

#[derive(Clone)]
pub struct ChannelServer {
    inner: Arc<ServerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a socket hands its frames.
pub struct ConnectionRoute {
    channel_id: ChannelId,
    mailbox: mpsc::UnboundedSender<Delivery>,
}

impl ConnectionRoute {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Returns false once the client channel is gone.
    pub fn frame(&self, pak: Packet) -> bool {
        self.mailbox
            .send(Delivery::Connection(ConnectionEvent::Frame(pak)))
            .is_ok()
    }

    pub fn closed(&self) {
        let _ = self
            .mailbox
            .send(Delivery::Connection(ConnectionEvent::Closed));
    }
}

impl ChannelServer {
    pub fn new(exchange: Arc<dyn Exchange>, store: Arc<dyn DataStore>, config: ServerConfig) -> Self {
        let mut channel_types: HashMap<String, Arc<dyn ChannelFactory>> = HashMap::new();
        channel_types.insert(
            CLIENT_TYPE.to_string(),
            Arc::new(Registered(Arc::new(client_channel::channel_type()))),
        );
        Self {
            inner: Arc::new(ServerInner {
                exchange,
                store,
                config,
                channel_types: RwLock::new(channel_types),
                local_channels: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                clock: Mutex::new(Clock::default()),
                last_client_id: AtomicU64::new(0),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.inner.store
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.inner.exchange
    }

    /// Adds a channel type. Fails on a duplicate type name or a handler name collision.
    pub fn register_channel_type<B: ChannelBehavior>(&self, kind: ChannelType<B>) -> Result<(), FabricError> {
        kind.validate()?;
        let name = kind.name().to_string();
        let mut types = self
            .inner
            .channel_types
            .write()
            .map_err(|_| FabricError::ActorClosed)?;
        if types.contains_key(&name) {
            return Err(FabricError::DuplicateChannelType(name));
        }
        debug!(channel_type = %name, options = ?kind.options(), "Registered channel type");
        types.insert(name, Arc::new(Registered(Arc::new(kind))));
        Ok(())
    }

    fn factory(&self, channel_type: &str) -> Option<Arc<dyn ChannelFactory>> {
        self.inner
            .channel_types
            .read()
            .ok()
            .and_then(|types| types.get(channel_type).cloned())
    }

    /// Creates `id` in this process regardless of the type's auto-create flag.
    #[instrument(skip(self))]
    pub async fn create_channel_local(&self, id: &str) -> Result<(), FabricError> {
        let id = ChannelId::parse(id)?;
        let factory = self
            .factory(id.channel_type())
            .ok_or(FabricError::UnknownChannelType)?;
        if self.spawn_channel(id, factory).await? {
            Ok(())
        } else {
            Err(FabricError::AlreadyRegistered)
        }
    }

    /// Returns false when another creator registered `id` first.
    async fn spawn_channel(&self, id: ChannelId, factory: Arc<dyn ChannelFactory>) -> Result<bool, FabricError> {
        let built = factory.build(self.clone(), id.clone())?;
        let mailbox = built.mailbox.clone();
        let inbound = built.inbound.clone();
        let handler: ExchangeHandler = Arc::new(move |source, pak| {
            inbound.fetch_add(1, Ordering::SeqCst);
            if mailbox.send(Delivery::Packet { source, pak }).is_err() {
                inbound.fetch_sub(1, Ordering::SeqCst);
            }
        });
        match self.inner.exchange.register(id.as_str(), handler).await {
            Ok(()) => {
                let task = (built.start)();
                lock(&self.inner.local_channels).insert(
                    id.to_string(),
                    LocalChannel {
                        channel_type: id.channel_type().to_string(),
                        mailbox: built.mailbox,
                        task,
                    },
                );
                info!(channel_id = %id, "Channel created");
                Ok(true)
            }
            Err(FabricError::AlreadyRegistered) => {
                debug!(channel_id = %id, "Lost creation race, discarding instance");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Publishes `pak`, auto-creating the destination on `ERR_NOT_FOUND` when allowed.
    pub(crate) async fn publish_with_retry(
        &self,
        src: &str,
        dest: &str,
        pak: Packet,
        autocreate: bool,
    ) -> Result<(), FabricError> {
        let attempts = self.inner.config.max_send_attempts.max(1);
        for attempt in 1..=attempts {
            match self.inner.exchange.publish(src, dest, pak.clone()).await {
                Ok(()) => {
                    pak.pool();
                    return Ok(());
                }
                Err(FabricError::NotFound) => {}
                Err(e) => return Err(e),
            }
            if !autocreate || self.inner.closing.load(Ordering::Relaxed) {
                return Err(FabricError::NotFound);
            }
            let id = ChannelId::parse(dest)?;
            let factory = self
                .factory(id.channel_type())
                .ok_or(FabricError::UnknownChannelType)?;
            if !factory.options().autocreate {
                return Err(FabricError::NotFound);
            }
            if !factory.options().accepts_subid(id.subid()) {
                return Err(FabricError::InvalidChannelId);
            }
            debug!(%src, %dest, attempt, "Auto-creating channel");
            self.spawn_channel(id, factory).await?;
        }
        warn!(%src, %dest, attempts, "Giving up on delivery");
        Err(FabricError::RetriesExhausted)
    }

    /// Unregisters `id` and stops its worker. Other local channels drop their sequence
    /// state for it.
    pub async fn destroy_channel(&self, id: &str) {
        self.inner.exchange.unregister(id).await;
        self.notify_removed(id);
        let removed = lock(&self.inner.local_channels).remove(id);
        if let Some(channel) = removed {
            let _ = channel.mailbox.send(Delivery::Shutdown);
            info!(channel_id = %id, "Channel destroyed");
        }
    }

    /// A worker left the exchange on its own. The map entry is only dropped if it still
    /// belongs to that worker, since a fresh instance may already own the id.
    pub(crate) fn channel_retired(&self, id: &ChannelId, mailbox: &mpsc::UnboundedSender<Delivery>) {
        self.notify_removed(id.as_str());
        let mut channels = lock(&self.inner.local_channels);
        if channels
            .get(id.as_str())
            .is_some_and(|c| c.mailbox.same_channel(mailbox))
        {
            channels.remove(id.as_str());
        }
        info!(channel_id = %id, "Channel destroyed");
    }

    fn notify_removed(&self, id: &str) {
        let others: Vec<_> = lock(&self.inner.local_channels)
            .iter()
            .filter(|(other, _)| other.as_str() != id)
            .map(|(_, c)| c.mailbox.clone())
            .collect();
        for mailbox in others {
            let _ = mailbox.send(Delivery::WorkerRemoved(id.to_string()));
        }
    }

    pub fn channels_by_type(&self, channel_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.local_channels)
            .iter()
            .filter(|(_, c)| c.channel_type == channel_type)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn has_channel(&self, id: &str) -> bool {
        lock(&self.inner.local_channels).contains_key(id)
    }

    /// Milliseconds of server time, advanced by ticks only.
    pub fn server_time(&self) -> u64 {
        lock(&self.inner.clock).server_time
    }

    /// Advances the clock, sends `server_time` to every live connection and ticks every
    /// local channel. A stall longer than two intervals counts as one interval.
    pub fn do_tick(&self) {
        let tick = self.inner.config.tick_interval();
        let (dt, server_time) = {
            let mut clock = lock(&self.inner.clock);
            let now = Instant::now();
            let mut dt = clock.last_tick.map_or(tick, |last| now.duration_since(last));
            if dt > tick * 2 {
                dt = tick;
            }
            clock.last_tick = Some(now);
            clock.server_time += dt.as_millis() as u64;
            (dt, clock.server_time)
        };

        let connections: Vec<Connection> = lock(&self.inner.connections).values().cloned().collect();
        for conn in connections {
            conn.send_message("server_time", json!(server_time));
        }
        let mailboxes: Vec<_> = lock(&self.inner.local_channels)
            .values()
            .map(|c| c.mailbox.clone())
            .collect();
        for mailbox in mailboxes {
            let _ = mailbox.send(Delivery::Tick { dt, server_time });
        }
    }

    pub fn start_ticking(&self) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config().tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if server.inner.closing.load(Ordering::Relaxed) {
                    break;
                }
                server.do_tick();
            }
        })
    }

    pub fn next_client_id(&self) -> u64 {
        self.inner.last_client_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Creates the `client.u<id>` channel for a freshly accepted connection.
    #[instrument(skip(self, conn), fields(client_id = conn.client_id()))]
    pub async fn attach_connection(&self, conn: Connection) -> Result<ConnectionRoute, FabricError> {
        let channel_id = ChannelId::new(CLIENT_TYPE, &format!("u{}", conn.client_id()))?;
        self.create_channel_local(channel_id.as_str()).await?;
        let mailbox = lock(&self.inner.local_channels)
            .get(channel_id.as_str())
            .map(|c| c.mailbox.clone())
            .ok_or(FabricError::NotFound)?;
        lock(&self.inner.connections).insert(conn.client_id(), conn.clone());
        mailbox
            .send(Delivery::Connection(ConnectionEvent::Attached(conn)))
            .map_err(|_| FabricError::ActorClosed)?;
        Ok(ConnectionRoute { channel_id, mailbox })
    }

    pub fn connection_closed(&self, client_id: u64) {
        lock(&self.inner.connections).remove(&client_id);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    fn send_to_local(&self, id: &str, delivery: Delivery) -> Result<(), FabricError> {
        let mailbox = lock(&self.inner.local_channels)
            .get(id)
            .map(|c| c.mailbox.clone())
            .ok_or(FabricError::NotFound)?;
        mailbox.send(delivery).map_err(|_| FabricError::ActorClosed)
    }

    /// Makes local channel `src` send a request to `dest` and waits for the answer.
    pub async fn request_from(&self, src: &str, dest: &str, msg: &str, data: Value) -> Result<Value, FabricError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_local(
            src,
            Delivery::Inject {
                dest: dest.to_string(),
                msg: msg.to_string(),
                data,
                reply: Some(tx),
            },
        )?;
        rx.await.map_err(|_| FabricError::ActorDropped)?
    }

    /// Fire-and-forget counterpart of [`request_from`](Self::request_from).
    pub fn send_from(&self, src: &str, dest: &str, msg: &str, data: Value) -> Result<(), FabricError> {
        self.send_to_local(
            src,
            Delivery::Inject {
                dest: dest.to_string(),
                msg: msg.to_string(),
                data,
                reply: None,
            },
        )
    }

    pub async fn inspect(&self, id: &str) -> Result<ChannelSnapshot, FabricError> {
        let (tx, rx) = oneshot::channel();
        self.send_to_local(id, Delivery::Inspect(tx))?;
        rx.await.map_err(|_| FabricError::ActorDropped)
    }

    /// Stops every local channel and waits for the workers to finish. Nothing is
    /// auto-created once shutdown has begun.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::Relaxed);
        let connections: Vec<Connection> = lock(&self.inner.connections).drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.close();
        }
        let channels: Vec<(String, LocalChannel)> = lock(&self.inner.local_channels).drain().collect();
        for (id, _) in &channels {
            self.inner.exchange.unregister(id).await;
        }
        for (_, channel) in &channels {
            let _ = channel.mailbox.send(Delivery::Shutdown);
        }
        for (id, channel) in channels {
            if let Err(e) = channel.task.await {
                warn!(channel_id = %id, error = %e, "Channel task failed");
            }
        }
        info!("Channel server stopped");
    }
}
