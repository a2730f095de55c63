//! Structured logging for the Rally relay.
//!
//! Wraps `tracing-subscriber`: a console layer with uptime timestamps and
//! module paths, an optional JSON file layer, and an `EnvFilter` that honours
//! `RUST_LOG` before falling back to the configured level.

use std::path::Path;

use rally_config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config supplies one.
const DEFAULT_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn";

/// Name of the JSON log file written inside `log_dir`.
pub const LOG_FILE_NAME: &str = "rally.log";

/// Build the filter string from the config, falling back to the default.
pub fn filter_directive(config: Option<&LogConfig>) -> String {
    match config {
        Some(config) if !config.log_level.is_empty() => {
            format!("{},tungstenite=warn,tokio_tungstenite=warn", config.log_level)
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Initialize the global tracing subscriber.
///
/// Calling this twice panics inside `tracing-subscriber`; the server binary
/// calls it once at startup. Tests should not call it.
pub fn init_logging(config: Option<&LogConfig>) {
    let filter_str = filter_directive(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(config) = config
        && config.json_file
        && let Some(log_dir) = config.log_dir.as_deref()
        && let Some(log_file) = open_log_file(log_dir)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// Create `log_dir` and open a fresh log file inside it.
fn open_log_file(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    std::fs::File::create(log_dir.join(LOG_FILE_NAME)).ok()
}

/// Create an `EnvFilter` with the default filter string.
fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
