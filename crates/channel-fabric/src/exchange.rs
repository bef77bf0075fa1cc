//! # Exchange
//!
//! Address-based delivery between channels.
//!
//! The exchange is the only component that knows whether a destination lives in this
//! process. Callers see a trait with three operations, so a networked backend can
//! replace [`LocalExchange`] without touching the channel runtime.
//!
//! ## Guarantees
//!
//! - `publish` never delivers in the caller's stack frame; it yields to the scheduler
//!   first.
//! - Messages from one source to one destination arrive in `publish` order, as long as
//!   the source awaits each `publish` before starting the next (the channel runtime does).
//! - An unknown destination yields [`FabricError::NotFound`].
//! - [`Exchange::unregister_if`] and the hand-off inside `publish` exclude each other, so
//!   a handler never runs for an address once it has been released.

use crate::error::FabricError;
use crate::packet::Packet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Receives `(source address, packet)` for a registered address.
pub type ExchangeHandler = Arc<dyn Fn(String, Packet) + Send + Sync>;

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Claims `id`. Fails with [`FabricError::AlreadyRegistered`] if it is taken.
    async fn register(&self, id: &str, handler: ExchangeHandler) -> Result<(), FabricError>;

    async fn unregister(&self, id: &str);

    /// Releases `id` only if `idle()` holds while no `publish` to it is mid hand-off.
    /// Returns false and keeps the registration otherwise.
    async fn unregister_if(&self, id: &str, idle: &(dyn Fn() -> bool + Send + Sync)) -> bool;

    async fn publish(&self, src: &str, dest: &str, pak: Packet) -> Result<(), FabricError>;
}

/// In-process exchange backed by a handler map.
#[derive(Default)]
pub struct LocalExchange {
    queues: RwLock<HashMap<String, ExchangeHandler>>,
}

impl LocalExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.queues
            .read()
            .map(|queues| queues.contains_key(id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Exchange for LocalExchange {
    async fn register(&self, id: &str, handler: ExchangeHandler) -> Result<(), FabricError> {
        let mut queues = self.queues.write().map_err(|_| FabricError::ActorClosed)?;
        if queues.contains_key(id) {
            return Err(FabricError::AlreadyRegistered);
        }
        queues.insert(id.to_string(), handler);
        debug!(%id, "Registered");
        Ok(())
    }

    async fn unregister(&self, id: &str) {
        if let Ok(mut queues) = self.queues.write() {
            if queues.remove(id).is_some() {
                debug!(%id, "Unregistered");
            }
        }
    }

    async fn unregister_if(&self, id: &str, idle: &(dyn Fn() -> bool + Send + Sync)) -> bool {
        let Ok(mut queues) = self.queues.write() else {
            return false;
        };
        if !idle() {
            return false;
        }
        if queues.remove(id).is_some() {
            debug!(%id, "Unregistered");
        }
        true
    }

    async fn publish(&self, src: &str, dest: &str, pak: Packet) -> Result<(), FabricError> {
        tokio::task::yield_now().await;
        let queues = self.queues.read().map_err(|_| FabricError::ActorClosed)?;
        let Some(handler) = queues.get(dest) else {
            return Err(FabricError::NotFound);
        };
        trace!(%src, %dest, size = pak.total_size(), "Publish");
        // Called under the read lock: `unregister_if` waits for the hand-off to finish.
        handler(src.to_string(), pak);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<(String, i64)>>>, ExchangeHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: ExchangeHandler = Arc::new(move |src, mut pak: Packet| {
            let v = pak.read_int().unwrap();
            sink.lock().unwrap().push((src, v));
        });
        (seen, handler)
    }

    fn pak(v: i64) -> Packet {
        let mut pak = Packet::create(0, 4);
        pak.write_int(v);
        pak.make_readable();
        pak
    }

    #[tokio::test]
    async fn unknown_destination_is_not_found() {
        let exchange = LocalExchange::new();
        assert!(matches!(
            exchange.publish("a.1", "b.1", pak(1)).await,
            Err(FabricError::NotFound)
        ));
    }

    #[tokio::test]
    async fn duplicate_register_fails() {
        let exchange = LocalExchange::new();
        let (_, handler) = recorder();
        exchange.register("b.1", handler.clone()).await.unwrap();
        assert!(matches!(
            exchange.register("b.1", handler).await,
            Err(FabricError::AlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn delivers_once_per_publish_in_order() {
        let exchange = LocalExchange::new();
        let (seen, handler) = recorder();
        exchange.register("b.1", handler).await.unwrap();
        for v in 0..20 {
            exchange.publish("a.1", "b.1", pak(v)).await.unwrap();
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().enumerate().all(|(i, (src, v))| src == "a.1" && *v == i as i64));
    }

    #[tokio::test]
    async fn unregister_makes_destination_unknown_again() {
        let exchange = LocalExchange::new();
        let (seen, handler) = recorder();
        exchange.register("b.1", handler).await.unwrap();
        exchange.publish("a.1", "b.1", pak(1)).await.unwrap();
        exchange.unregister("b.1").await;
        assert!(!exchange.is_registered("b.1"));
        assert!(matches!(
            exchange.publish("a.1", "b.1", pak(2)).await,
            Err(FabricError::NotFound)
        ));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conditional_unregister_keeps_a_busy_address() {
        let exchange = LocalExchange::new();
        let (_, handler) = recorder();
        exchange.register("b.1", handler).await.unwrap();

        assert!(!exchange.unregister_if("b.1", &|| false).await);
        assert!(exchange.is_registered("b.1"));
        exchange.publish("a.1", "b.1", pak(1)).await.unwrap();

        assert!(exchange.unregister_if("b.1", &|| true).await);
        assert!(!exchange.is_registered("b.1"));
        assert!(exchange.unregister_if("b.1", &|| true).await);
    }
}
