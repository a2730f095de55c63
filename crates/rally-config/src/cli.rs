//! Command-line argument parsing for the relay server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Rally relay server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "rally-server", about = "Room-based relay server for multiplayer games")]
pub struct CliArgs {
    /// Address every backend binds to.
    #[arg(long)]
    pub bind: Option<String>,

    /// WebSocket listener port.
    #[arg(long)]
    pub ws_port: Option<u16>,

    /// First UDP port handed out to rooms.
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// Disable the WebSocket backend.
    #[arg(long)]
    pub no_websocket: bool,

    /// Disable the UDP backend.
    #[arg(long)]
    pub no_udp: bool,

    /// Room poll interval in milliseconds.
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.ws_port {
            self.websocket.port = port;
        }
        if let Some(port) = args.udp_port {
            self.udp.base_port = port;
        }
        if args.no_websocket {
            self.websocket.enabled = false;
        }
        if args.no_udp {
            self.udp.enabled = false;
        }
        if let Some(tick) = args.tick_ms {
            self.server.tick_interval_ms = tick;
        }
        if let Some(ref level) = args.log_level {
            self.log.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            ws_port: Some(9001),
            no_udp: true,
            log_level: Some("debug".to_string()),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.websocket.port, 9001);
        assert!(!config.udp.enabled);
        assert_eq!(config.log.log_level, "debug");
        // Non-overridden fields retain defaults
        assert!(config.websocket.enabled);
        assert_eq!(config.server.tick_interval_ms, 15);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["rally-server", "--udp-port", "8000", "--no-websocket"]);
        assert_eq!(args.udp_port, Some(8000));
        assert!(args.no_websocket);
        assert!(args.config.is_none());
    }
}
