//! Socket transport: length-prefixed frames over TCP.
//!
//! ```text
//! [u32 little-endian length][packet bytes, flags byte first]
//! ```
//!
//! Frames between a socket and its `client.u<id>` channel carry a bare ack envelope (no
//! sequence number, no sender ids). A frame longer than the configured limit drops the
//! connection.

use crate::ack::{write_envelope, Msg, Payload};
use crate::error::FabricError;
use crate::packet::Packet;
use crate::server::ChannelServer;
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Write side of one live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    client_id: u64,
    outbound: mpsc::UnboundedSender<Packet>,
    closed: Arc<Notify>,
}

impl Connection {
    pub fn new(client_id: u64, outbound: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            client_id,
            outbound,
            closed: Arc::new(Notify::new()),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Queues a frame. Returns false if the socket writer is gone.
    pub fn send_packet(&self, pak: Packet) -> bool {
        self.outbound.send(pak).is_ok()
    }

    pub fn send_message(&self, msg: &str, data: Value) -> bool {
        self.send_packet(message_packet(msg, data))
    }

    /// Asks the writer to shut the socket down.
    pub fn close(&self) {
        self.closed.notify_one();
    }
}

/// What a client channel hears about its socket.
#[derive(Debug)]
pub enum ConnectionEvent {
    Attached(Connection),
    Frame(Packet),
    Closed,
}

/// A fire-and-forget envelope, ready to go on the wire.
pub fn message_packet(msg: &str, data: Value) -> Packet {
    let mut pak = Packet::create(0, 32);
    write_envelope(&mut pak, &Msg::name(msg), None, None, Payload::Json(data));
    pak.make_readable();
    pak
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, pak: &Packet) -> io::Result<()> {
    let bytes = pak.as_bytes();
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Reads one frame. `Ok(None)` is a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> io::Result<Option<Packet>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {max_len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Packet::from_bytes(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Binds `addr` and serves every accepted socket. Returns the bound address.
pub async fn listen(server: ChannelServer, addr: &str) -> Result<(SocketAddr, JoinHandle<()>), FabricError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "Listening");
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    tokio::spawn(serve_socket(server.clone(), socket, peer));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    });
    Ok((local_addr, handle))
}

async fn serve_socket(server: ChannelServer, socket: TcpStream, peer: SocketAddr) {
    let client_id = server.next_client_id();
    let _ = socket.set_nodelay(true);
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let conn = Connection::new(client_id, tx);
    let closed = conn.closed.clone();

    let route = match server.attach_connection(conn).await {
        Ok(route) => route,
        Err(e) => {
            warn!(client_id, %peer, error = %e, "Could not attach connection");
            return;
        }
    };
    info!(client_id, %peer, channel_id = %route.channel_id(), "Connection accepted");

    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                pak = rx.recv() => match pak {
                    Some(pak) => {
                        if let Err(e) = write_frame(&mut writer, &pak).await {
                            debug!(client_id, error = %e, "Write failed");
                            break;
                        }
                    }
                    None => break,
                },
                _ = closed.notified() => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let max_len = server.config().max_frame_len;
    loop {
        match read_frame(&mut reader, max_len).await {
            Ok(Some(pak)) => {
                if !route.frame(pak) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(client_id, error = %e, "Dropping connection");
                break;
            }
        }
    }
    route.closed();
    writer_task.abort();
    server.connection_closed(client_id);
    info!(client_id, %peer, "Connection closed");
}
