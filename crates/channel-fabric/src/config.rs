use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "channels.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the socket listener binds to.
    pub bind_addr: String,
    /// Root directory of the file store.
    pub data_dir: PathBuf,
    pub tick_interval_ms: u64,
    /// Unanswered requests are logged after this long. Diagnostic only.
    pub response_warn_secs: u64,
    /// Publish attempts per message, auto-create retries included.
    pub max_send_attempts: u32,
    /// Parked callbacks older than this fail with `ERR_TIMEOUT`. Off when unset.
    pub rpc_ttl_secs: Option<u64>,
    /// Receives crash reports from panicking handlers.
    pub admin_channel: Option<String>,
    pub max_frame_len: usize,
    /// Recent packets kept per channel for crash dumps.
    pub packet_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            data_dir: PathBuf::from("data_store"),
            tick_interval_ms: 250,
            response_warn_secs: 15,
            max_send_attempts: 10,
            rpc_ttl_secs: None,
            admin_channel: None,
            max_frame_len: 1 << 20,
            packet_history: 16,
        }
    }
}

impl ServerConfig {
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Loads from `path`, falling back to defaults when the file is missing or invalid.
    pub fn load_from_path(path: &Path) -> Self {
        load_or_default(path)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn response_warn(&self) -> Duration {
        Duration::from_secs(self.response_warn_secs)
    }

    pub fn rpc_ttl(&self) -> Option<Duration> {
        self.rpc_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:3000".to_string(),
            reconnect_base_ms: 100,
            reconnect_max_ms: 1000,
            max_frame_len: 1 << 20,
        }
    }
}

impl ClientConfig {
    /// Delay before reconnect attempt `retry_count`: `min(retry_count² × base, max)`.
    pub fn reconnect_delay(&self, retry_count: u32) -> Duration {
        let steps = u64::from(retry_count).saturating_mul(u64::from(retry_count));
        Duration::from_millis(
            steps
                .saturating_mul(self.reconnect_base_ms)
                .min(self.reconnect_max_ms),
        )
    }
}

fn load_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<T>(&contents) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Failed to parse {}: {err}. Using defaults", path.display());
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: ServerConfig = toml::from_str("tick_interval_ms = 100\nadmin_channel = \"admin.log\"").unwrap();
        assert_eq!(cfg.tick_interval(), Duration::from_millis(100));
        assert_eq!(cfg.admin_channel.as_deref(), Some("admin.log"));
        assert_eq!(cfg.max_send_attempts, 10);
        assert_eq!(cfg.response_warn(), Duration::from_secs(15));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load_from_path(Path::new("/nonexistent/channels.toml"));
        assert_eq!(cfg.tick_interval_ms, 250);
        assert_eq!(cfg.rpc_ttl(), None);
    }

    #[test]
    fn reconnect_delay_is_quadratic_and_capped() {
        let cfg = ClientConfig::default();
        let delays: Vec<u64> = (0..6).map(|n| cfg.reconnect_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![0, 100, 400, 900, 1000, 1000]);
    }
}
