//! # Chat Client
//!
//! Wraps a [`NetClient`] and its [`SubscriptionManager`] and exposes chat-shaped
//! methods. Rooms are addressed by name; the `room.` prefix is added here.
use crate::error::ChatError;
use crate::room_channel::ROOM_TYPE;
use channel_fabric::channel::USER_TYPE;
use channel_fabric::client::{MirrorEvent, MirroredChannel, NetClient, SubscriptionManager};
use channel_fabric::{ClientConfig, SenderIds};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

/// One line of chat as rooms emit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
    pub msg: String,
    #[serde(default)]
    pub client_ids: SenderIds,
}

impl ChatLine {
    /// Returns the room id and line if `event` is a chat message.
    pub fn from_event(event: &MirrorEvent) -> Option<(String, ChatLine)> {
        match event {
            MirrorEvent::Message { channel_id, msg, data } if msg == "chat" => {
                let line = serde_json::from_value(data.clone()).ok()?;
                Some((channel_id.clone(), line))
            }
            _ => None,
        }
    }
}

pub struct ChatClient {
    link: NetClient,
    manager: Arc<SubscriptionManager<NetClient>>,
    tasks: Vec<JoinHandle<()>>,
}

fn room_id(room: &str) -> String {
    format!("{ROOM_TYPE}.{room}")
}

impl ChatClient {
    /// Connects and waits up to `wait` for the server to assign a client id.
    pub async fn connect(config: ClientConfig, wait: Duration) -> Result<Self, ChatError> {
        let server_addr = config.server_addr.clone();
        let (link, link_events, link_task) = NetClient::connect(config);
        let manager = Arc::new(SubscriptionManager::new(Arc::new(link.clone())));
        let mut events = manager.events();
        let pump = manager.spawn(link_events);
        let client = Self {
            link,
            manager,
            tasks: vec![link_task, pump],
        };

        let connected = tokio::time::timeout(wait, async {
            loop {
                match events.recv().await {
                    Ok(MirrorEvent::Connected { client_id, .. }) => return Some(client_id),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await;
        match connected {
            Ok(Some(client_id)) => {
                debug!(%client_id, "Chat client connected");
                Ok(client)
            }
            _ => {
                client.close();
                Err(ChatError::ConnectTimeout(server_addr))
            }
        }
    }

    /// Logs in and subscribes to the account's user channel. Returns the display name.
    #[instrument(skip(self, password))]
    pub async fn login(&self, name: &str, password: &str) -> Result<String, ChatError> {
        let display_name = self.manager.login(name, password).await?;
        self.manager.subscribe(&format!("{USER_TYPE}.{name}")).await?;
        Ok(display_name)
    }

    pub async fn logout(&self) -> Result<(), ChatError> {
        if let Some((user_id, _)) = self.manager.logged_in() {
            self.manager.unsubscribe(&format!("{USER_TYPE}.{user_id}")).await?;
        }
        Ok(self.manager.logout().await?)
    }

    #[instrument(skip(self))]
    pub async fn join(&self, room: &str) -> Result<(), ChatError> {
        Ok(self.manager.subscribe(&room_id(room)).await?)
    }

    pub async fn leave(&self, room: &str) -> Result<(), ChatError> {
        Ok(self.manager.unsubscribe(&room_id(room)).await?)
    }

    pub async fn say(&self, room: &str, text: &str) -> Result<(), ChatError> {
        self.manager
            .send_channel_msg(&room_id(room), "chat", json!({ "msg": text }), false)
            .await?;
        Ok(())
    }

    /// Runs a `/command` line against the client channel and then every joined channel.
    pub async fn command(&self, cmd: &str) -> Result<String, ChatError> {
        self.manager.send_cmd_parse(cmd).await.map_err(ChatError::Command)
    }

    pub async fn rename(&self, display_name: &str) -> Result<String, ChatError> {
        self.command(&format!("rename {display_name}")).await
    }

    /// Writes a key on any subscribed channel.
    pub async fn set_data(&self, channel_id: &str, key: &str, value: Option<Value>) -> Result<(), ChatError> {
        Ok(self.manager.set_channel_data(channel_id, key, value, false).await?)
    }

    pub fn events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.manager.events()
    }

    pub fn room(&self, room: &str) -> Option<MirroredChannel> {
        self.manager.get_channel(&room_id(room))
    }

    pub fn channel(&self, channel_id: &str) -> Option<MirroredChannel> {
        self.manager.get_channel(channel_id)
    }

    pub fn manager(&self) -> &Arc<SubscriptionManager<NetClient>> {
        &self.manager
    }

    pub fn client_id(&self) -> Option<String> {
        self.manager.client_id()
    }

    pub fn close(&self) {
        self.link.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.close();
    }
}
