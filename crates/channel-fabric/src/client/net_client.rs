//! Reconnecting TCP link.

use super::Link;
use crate::ack::{read_envelope, write_envelope, AckState, Incoming, Msg, Payload, Reply, Responder, ResponseMode};
use crate::config::ClientConfig;
use crate::error::{FabricError, ERR_DISCONNECTED};
use crate::net::{read_frame, write_frame};
use crate::packet::Packet;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    /// Lost the connection and waiting to retry.
    Reconnecting,
}

/// What the link tells its owner.
pub enum LinkEvent {
    /// The server assigned this connection a client id.
    Connected { client_id: String },
    /// Fired after every pending request has failed with `ERR_DISCONNECTED`.
    Disconnected,
    /// A message pushed by the server (`server_time`, `channel_msg`, ...).
    Message {
        msg: String,
        data: Value,
        responder: Responder,
    },
}

type ResponseSender = oneshot::Sender<Result<Value, String>>;

struct NetInner {
    config: ClientConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    ack: Mutex<AckState<ResponseSender>>,
    status: watch::Sender<LinkStatus>,
    events: mpsc::UnboundedSender<LinkEvent>,
    closing: AtomicBool,
    close_notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct NetClient {
    inner: Arc<NetInner>,
}

impl NetClient {
    /// Starts connecting in the background. Events arrive on the returned receiver.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<LinkEvent>, JoinHandle<()>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(LinkStatus::Connecting);
        let inner = Arc::new(NetInner {
            config,
            outbound: Mutex::new(None),
            ack: Mutex::new(AckState::default()),
            status,
            events,
            closing: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        let handle = tokio::spawn(run(inner.clone()));
        (Self { inner }, rx, handle)
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.status.borrow() == LinkStatus::Connected
    }

    /// Drops the connection and stops reconnecting.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Relaxed);
        self.inner.close_notify.notify_waiters();
    }

    fn outbound(&self, msg: &str) -> Result<mpsc::UnboundedSender<Packet>, FabricError> {
        lock(&self.inner.outbound).clone().ok_or_else(|| {
            warn!(%msg, "Not connected, dropping message");
            FabricError::Disconnected
        })
    }
}

#[async_trait]
impl Link for NetClient {
    async fn send(&self, msg: &str, data: Value) -> Result<(), FabricError> {
        let outbound = self.outbound(msg)?;
        let mut pak = Packet::create(0, 32);
        lock(&self.inner.ack).wrap_message(
            &mut pak,
            Msg::name(msg),
            None,
            Payload::Json(data),
            ResponseMode::FireAndForget,
        );
        pak.make_readable();
        outbound.send(pak).map_err(|_| FabricError::Disconnected)
    }

    async fn request(&self, msg: &str, data: Value) -> Result<Value, FabricError> {
        let outbound = self.outbound(msg)?;
        let (tx, rx) = oneshot::channel();
        let mut pak = Packet::create(0, 32);
        let pak_id = lock(&self.inner.ack).wrap_message(
            &mut pak,
            Msg::name(msg),
            None,
            Payload::Json(data),
            ResponseMode::Expect(tx),
        );
        pak.make_readable();
        if outbound.send(pak).is_err() {
            if let Some(id) = pak_id {
                lock(&self.inner.ack).take_pending(id);
            }
            return Err(FabricError::Disconnected);
        }
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(FabricError::from_wire(err)),
            Err(_) => Err(FabricError::Disconnected),
        }
    }
}

async fn run(inner: Arc<NetInner>) {
    let mut retry_count: u32 = 0;
    while !inner.closing.load(Ordering::Relaxed) {
        match TcpStream::connect(&inner.config.server_addr).await {
            Ok(stream) => {
                retry_count = 0;
                debug!(addr = %inner.config.server_addr, "Socket open");
                serve(&inner, stream).await;
                disconnected(&inner);
            }
            Err(e) => debug!(addr = %inner.config.server_addr, error = %e, "Connect failed"),
        }
        if inner.closing.load(Ordering::Relaxed) {
            break;
        }
        inner.status.send_replace(LinkStatus::Reconnecting);
        retry_count += 1;
        let delay = inner.config.reconnect_delay(retry_count);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.close_notify.notified() => break,
        }
    }
    debug!("Link stopped");
}

async fn serve(inner: &Arc<NetInner>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    *lock(&inner.outbound) = Some(tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(pak) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &pak).await {
                debug!(error = %e, "Write failed");
                break;
            }
        }
    });

    let max_len = inner.config.max_frame_len;
    loop {
        tokio::select! {
            frame = read_frame(&mut reader, max_len) => match frame {
                Ok(Some(pak)) => handle_frame(inner, &tx, pak),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Dropping connection");
                    break;
                }
            },
            _ = inner.close_notify.notified() => break,
        }
    }
    writer_task.abort();
}

fn handle_frame(inner: &NetInner, outbound: &mpsc::UnboundedSender<Packet>, mut pak: Packet) {
    let env = match read_envelope(&mut pak) {
        Ok(env) => env,
        Err(e) => {
            warn!(error = %e, "Malformed frame");
            return;
        }
    };
    let reply_to = outbound.clone();
    let sink = Box::new(move |reply: Reply| {
        let mut pak = Packet::create(0, 32);
        write_envelope(&mut pak, &reply.msg, None, reply.err.as_deref(), reply.data);
        pak.make_readable();
        let _ = reply_to.send(pak);
    });
    let incoming = lock(&inner.ack).handle_message("server", env, sink);
    match incoming {
        Ok(Incoming::Request { msg, data, responder }) => {
            let data = data.into_json();
            if msg == "internal_client_id" {
                let client_id = data.as_str().unwrap_or_default().to_string();
                info!(%client_id, "Connected");
                inner.status.send_replace(LinkStatus::Connected);
                responder.done();
                let _ = inner.events.send(LinkEvent::Connected { client_id });
            } else {
                let _ = inner.events.send(LinkEvent::Message { msg, data, responder });
            }
        }
        Ok(Incoming::Response { pending, err, data, .. }) => {
            let result = match err {
                Some(err) => Err(err),
                None => Ok(data.into_json()),
            };
            let _ = pending.callback.send(result);
        }
        Err(e) => warn!(error = %e, "Protocol error"),
    }
}

fn disconnected(inner: &NetInner) {
    *lock(&inner.outbound) = None;
    let pending = lock(&inner.ack).fail_all();
    for rpc in pending {
        let _ = rpc.callback.send(Err(ERR_DISCONNECTED.to_string()));
    }
    let was_connected = *inner.status.borrow() == LinkStatus::Connected;
    if was_connected {
        info!("Disconnected");
        let _ = inner.events.send(LinkEvent::Disconnected);
    }
}
