use crate::error::ChatError;
use crate::{room_channel, user_channel};
use channel_fabric::{net, ChannelServer, DataStore, FileStore, LocalExchange, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ChatSystem {
    pub server: ChannelServer,
    addr: SocketAddr,
    handles: Vec<JoinHandle<()>>,
}

impl ChatSystem {
    /// Starts with a [`FileStore`] rooted at `config.data_dir`.
    pub async fn start(config: ServerConfig) -> Result<Self, ChatError> {
        let store = Arc::new(FileStore::new(config.data_dir.clone()));
        Self::start_with_store(config, store).await
    }

    pub async fn start_with_store(config: ServerConfig, store: Arc<dyn DataStore>) -> Result<Self, ChatError> {
        let bind_addr = config.bind_addr.clone();
        let server = ChannelServer::new(Arc::new(LocalExchange::new()), store, config);
        server.register_channel_type(user_channel::channel_type())?;
        server.register_channel_type(room_channel::channel_type())?;

        let ticker = server.start_ticking();
        let (addr, listener) = match net::listen(server.clone(), &bind_addr).await {
            Ok(bound) => bound,
            Err(e) => {
                ticker.abort();
                return Err(e.into());
            }
        };
        info!(%addr, "Chat system started");
        Ok(Self {
            server,
            addr,
            handles: vec![listener, ticker],
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) -> Result<(), String> {
        info!("Shutting down system...");
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    warn!(error = %e, "Background task failed");
                    return Err(e.to_string());
                }
            }
        }
        self.server.shutdown().await;
        info!("System shutdown complete.");
        Ok(())
    }
}
