//! Configuration structs with sensible defaults and RON persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Process-wide server settings.
    pub server: ServerConfig,
    /// WebSocket backend settings.
    pub websocket: WebSocketConfig,
    /// UDP backend settings.
    pub udp: UdpConfig,
    /// Defaults applied to every room.
    pub rooms: RoomDefaults,
    /// Rooms created at startup.
    pub presets: Vec<RoomPreset>,
    /// Logging settings.
    pub log: LogConfig,
}

/// Process-wide server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address every backend binds to.
    pub bind_address: String,
    /// Interval between two polls of a room's transport context.
    pub tick_interval_ms: u64,
    /// Maximum number of rooms alive at the same time.
    pub max_rooms: usize,
}

/// WebSocket backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Start the WebSocket listener.
    pub enabled: bool,
    /// Listener port. Rooms are told apart by URL path.
    pub port: u16,
}

/// UDP backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UdpConfig {
    /// Start the UDP backend.
    pub enabled: bool,
    /// First port handed out to a room; each room gets its own port.
    /// A value of 0 lets the OS pick a port per room.
    pub base_port: u16,
    /// Peers silent for longer than this are disconnected.
    pub timeout_ms: u64,
    /// Interval between keepalive datagrams on idle connections.
    pub heartbeat_ms: u64,
    /// Interval after which an unacknowledged reliable datagram is resent.
    pub resend_ms: u64,
    /// Resends of one reliable datagram before the peer is dropped.
    pub max_resends: u32,
}

/// Defaults applied to every room unless the creation request overrides them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomDefaults {
    /// Capacity used when a request asks for 0 clients.
    pub max_clients: u16,
    /// Pending query responses older than this are dropped.
    pub rpr_ttl_ms: u64,
    /// Minimum time before a released client id is handed out again.
    pub client_id_grace_ms: u64,
    /// Close a room once it has been empty this long (0 = never).
    pub auto_close_ms: u64,
    /// Upper bound of one batched packet on unbounded-MTU modes.
    pub max_batch_bytes: usize,
}

/// Backend a room is served on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportKind {
    /// Shared WebSocket listener, one URL path per room.
    #[default]
    WebSocket,
    /// One UDP port per room.
    Udp,
    /// In-process channels, for embedding and tests.
    Memory,
}

/// A room created when the server starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomPreset {
    /// Display name, also used as the WebSocket path.
    pub name: String,
    /// Backend serving the room.
    pub transport: TransportKind,
    /// Client version required to join.
    pub version: String,
    /// Capacity (0 = use [`RoomDefaults::max_clients`]).
    pub capacity: u16,
    /// Optional join password.
    pub password: Option<String>,
    /// Opaque key/value attributes published with the room.
    pub attributes: BTreeMap<String, String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g., "info", "debug,rally_net=trace").
    pub log_level: String,
    /// Directory for the JSON log file, if any.
    pub log_dir: Option<PathBuf>,
    /// Write the JSON file layer.
    pub json_file: bool,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            tick_interval_ms: 15,
            max_rooms: 64,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7780,
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_port: 7790,
            timeout_ms: 10_000,
            heartbeat_ms: 1_000,
            resend_ms: 100,
            max_resends: 50,
        }
    }
}

impl Default for RoomDefaults {
    fn default() -> Self {
        Self {
            max_clients: 16,
            rpr_ttl_ms: 30_000,
            client_id_grace_ms: 5_000,
            auto_close_ms: 0,
            max_batch_bytes: 64 * 1024,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            json_file: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the relay (`<config>/rally`).
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("rally"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            return Ok(config);
        }
        let config = Self::read(&config_path)?;
        log::info!("Loaded config from {}", config_path.display());
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let write_error = |source| ConfigError::Write {
            path: config_path.clone(),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_error)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized = ron::ser::to_string_pretty(self, pretty)?;
        std::fs::write(&config_path, serialized).map_err(write_error)
    }
}
