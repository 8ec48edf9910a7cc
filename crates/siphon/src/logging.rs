//! Logging subsystem initialization.
//!
//! Builds a `tracing` subscriber from the `logging` config section: level
//! (`debug`..`error`) and output format (`text` or `json`). `RUST_LOG`
//! overrides the configured level when set, which keeps ad-hoc debugging
//! possible without touching the config file.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global tracing subscriber. Call once, before anything logs.
pub fn init(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    };

    // Noise from the HTTP stack stays off unless explicitly requested.
    let default_filter = format!("h2=off,hyper=off,rustls=off,{level}");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false);

    if config.format.to_lowercase() == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
