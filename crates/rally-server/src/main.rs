//! Relay server binary.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p rally-server -- --ws-port 9000 --no-udp`.

use std::process::ExitCode;

use clap::Parser;
use rally_config::{CliArgs, Config};
use rally_server::RelayServer;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Load or create config, then apply CLI overrides
    let config_dir = args.config.clone().or_else(|| Config::default_dir().ok());
    let mut config = match &config_dir {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    rally_log::init_logging(Some(&config.log));

    let server = match RelayServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Relay running with {} rooms", server.registry().len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {e}");
    }
    server.shutdown().await;
    ExitCode::SUCCESS
}
