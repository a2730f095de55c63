//! Configuration system for the Rally relay server.
//!
//! Settings persist to disk as a RON file. CLI flags parsed with clap override
//! whatever was loaded, and unknown or missing fields fall back to defaults so
//! old config files keep working.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, LogConfig, RoomDefaults, RoomPreset, ServerConfig, TransportKind, UdpConfig,
    WebSocketConfig,
};
pub use error::ConfigError;
