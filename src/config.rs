use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::rendezvous::RendezvousConfig;
use crate::transport::{FidelityLevel, TransportConfig, DEFAULT_STUN_SERVERS};

/// Overrides `server.base_url` when set
pub const SERVER_URL_ENV: &str = "MESHLINK_SERVER_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP(S) base URL of the rendezvous relay; the WebSocket URL is derived from it
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Listen address for `meshlink relay`
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Outbound frames kept while the relay is unreachable
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
    #[serde(default = "default_fidelity_interval_ms")]
    pub fidelity_interval_ms: u64,
    #[serde(default = "default_initial_fidelity")]
    pub initial_fidelity: FidelityLevel,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_max_pending() -> usize {
    1024
}

fn default_negotiation_timeout_ms() -> u64 {
    15_000
}

fn default_fidelity_interval_ms() -> u64 {
    4_000
}

fn default_initial_fidelity() -> FidelityLevel {
    FidelityLevel::High
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_event_capacity() -> usize {
    256
}

fn default_data_dir() -> String {
    get_meshlink_dir()
        .join("data")
        .to_string_lossy()
        .to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            bind_address: default_bind_address(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_pending: default_max_pending(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            fidelity_interval_ms: default_fidelity_interval_ms(),
            initial_fidelity: default_initial_fidelity(),
            stun_servers: default_stun_servers(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist.
    /// `MESHLINK_SERVER_URL` is applied on top.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&get_config_path())?;
        config.override_server_url(std::env::var(SERVER_URL_ENV).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn override_server_url(&mut self, url: Option<String>) {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            self.server.base_url = url.trim().to_string();
        }
    }

    /// WebSocket URL of the relay (`http` -> `ws`, `https` -> `wss`)
    pub fn ws_url(&self) -> String {
        ws_url_from_base(&self.server.base_url)
    }

    pub fn rendezvous_config(&self, public_key: Option<String>) -> RendezvousConfig {
        let t = &self.transport;
        RendezvousConfig {
            url: self.ws_url(),
            connect_timeout_ms: t.connect_timeout_ms,
            retry_delay_ms: t.retry_delay_ms,
            max_retry_delay_ms: t.max_retry_delay_ms,
            max_pending: t.max_pending,
            auto_reconnect: true,
            public_key,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig {
            negotiation_timeout_ms: t.negotiation_timeout_ms,
            fidelity_interval_ms: t.fidelity_interval_ms,
            initial_fidelity: t.initial_fidelity,
            stun_servers: t.stun_servers.clone(),
            event_capacity: t.event_capacity,
        }
    }

    /// Contact directory file
    pub fn directory_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join("contacts.json")
    }
}

pub fn ws_url_from_base(base: &str) -> String {
    let base = base.trim();
    let url = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };
    // Bare host gets a root path
    let bare_host = url
        .split_once("://")
        .is_some_and(|(_, rest)| !rest.contains('/'));
    if bare_host {
        format!("{}/", url)
    } else {
        url
    }
}

/// Get the meshlink directory (~/.meshlink)
pub fn get_meshlink_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshlink")
}

/// Get the config file path (~/.meshlink/config.toml)
pub fn get_config_path() -> PathBuf {
    get_meshlink_dir().join("config.toml")
}

/// Get the nsec file path (~/.meshlink/nsec)
pub fn get_nsec_path() -> PathBuf {
    get_meshlink_dir().join("nsec")
}
