//! Klaxon daemon
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - KLAXON_CONFIG: Path to the JSON configuration (default: klaxon.json)
//! - KLAXON_HOST: Bind address for the control API (default: 127.0.0.1)
//! - KLAXON_PORT: Port number (default: 8087)
//! - KLAXON_PLAY_COMMAND: Audio command template, e.g. `paplay --volume={volume} {sound}`
//! - RUST_LOG: Log level (default: info)

use klaxon::api::{run_server, ServerConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "klaxon=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        host: std::env::var("KLAXON_HOST").unwrap_or(defaults.host),
        port: std::env::var("KLAXON_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port),
        config_path: std::env::var("KLAXON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_path),
        play_command: std::env::var("KLAXON_PLAY_COMMAND")
            .ok()
            .filter(|c| !c.trim().is_empty()),
    };

    tracing::info!("Klaxon configuration:");
    tracing::info!("  API: {}:{}", config.host, config.port);
    tracing::info!("  Config file: {}", config.config_path.display());
    match &config.play_command {
        Some(command) => tracing::info!("  Play command: {}", command),
        None => tracing::info!("  Play command: none (play requests are logged)"),
    }

    println!(
        r#"
  _  ___
 | |/ / | __ ___  _____  _ __
 | ' /| |/ _` \ \/ / _ \| '_ \
 | . \| | (_| |>  < (_) | | | |
 |_|\_\_|\__,_/_/\_\___/|_| |_|

 Detection & Dispatch for System Monitors
 Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run_server(config).await {
        tracing::error!(error = %e, "Klaxon failed to start");
        std::process::exit(1);
    }
    Ok(())
}
