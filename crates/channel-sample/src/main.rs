//! # Channel Chat Server
//!
//! Starts the chat system from `channels.toml` (defaults when missing), runs a short
//! self-check with two in-process clients, then serves until Ctrl-C.
//!
//! ```bash
//! RUST_LOG=info cargo run -p channel-sample
//! ```

use channel_fabric::{ClientConfig, ServerConfig};
use channel_sample::clients::ChatClient;
use channel_sample::error::ChatError;
use channel_sample::lifecycle::{setup_tracing, ChatSystem};
use std::time::Duration;
use tracing::{error, info, Instrument};

const CONNECT_WAIT: Duration = Duration::from_secs(5);

async fn self_check(config: ClientConfig) -> Result<(), ChatError> {
    let alice = ChatClient::connect(config.clone(), CONNECT_WAIT).await?;
    let bob = ChatClient::connect(config, CONNECT_WAIT).await?;

    alice.login("alice", "alice-password").await?;
    bob.login("bob", "bob-password").await?;
    alice.join("lobby").await?;
    bob.join("lobby").await?;

    let topic = alice.command("topic Welcome").await?;
    info!(%topic, "Topic set");
    bob.say("lobby", "hello from bob").await?;
    let who = alice.command("who").await?;
    info!(%who, "Lobby members");

    alice.close();
    bob.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();

    let config = ServerConfig::load();
    info!(bind_addr = %config.bind_addr, data_dir = %config.data_dir.display(), "Starting chat system");
    let system = ChatSystem::start(config).await.map_err(|e| e.to_string())?;

    let client_config = ClientConfig {
        server_addr: system.addr().to_string(),
        ..ClientConfig::default()
    };
    let span = tracing::info_span!("self_check");
    match self_check(client_config).instrument(span).await {
        Ok(()) => info!("Self-check passed"),
        Err(e) => error!(error = %e, "Self-check failed"),
    }

    info!(addr = %system.addr(), "Serving, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for Ctrl-C");
    }

    system.shutdown().await?;
    info!("Application completed successfully");
    Ok(())
}
