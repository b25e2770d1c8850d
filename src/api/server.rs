use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    disable_trigger, enable_trigger, entity_status, health_check, list_runs, list_status,
    list_triggers, reload, stats, AppState,
};
use crate::config;
use crate::engine::Engine;
use crate::scheduler::Scheduler;
use crate::sinks::{ActionSink, DefaultSink};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
    /// Audio command template with `{sound}` and `{volume}`
    pub play_command: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8087,
            config_path: PathBuf::from("klaxon.json"),
            play_command: None,
        }
    }
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Entity status
        .route("/status", get(list_status))
        .route("/status/*key", get(entity_status))
        // Trigger control
        .route("/triggers", get(list_triggers))
        .route("/triggers/:id/enable", post(enable_trigger))
        .route("/triggers/:id/disable", post(disable_trigger))
        // Runs and stats
        .route("/runs", get(list_runs))
        .route("/stats", get(stats))
        .route("/reload", post(reload))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Load configuration, start monitors and serve the control API
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Rejected configuration stops us before any monitor runs
    let compiled = config::load(&config.config_path)?;

    let sink: Arc<dyn ActionSink> =
        Arc::new(DefaultSink::new().with_play_command(config.play_command.clone()));
    let cancel = CancellationToken::new();
    let engine = Arc::new(
        Engine::new(
            &compiled.settings,
            compiled.triggers,
            sink,
            cancel.clone(),
            TaskTracker::new(),
        )
        .with_config_path(config.config_path.clone()),
    );

    let scheduler = Scheduler::new(Arc::clone(&engine));
    scheduler.spawn_all(compiled.monitors);
    engine.spawn_maintenance(MAINTENANCE_INTERVAL);
    tracing::info!(monitors = scheduler.monitor_ids().len(), "Monitors started");

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting Klaxon on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    engine.shutdown().await;

    tracing::info!("Klaxon stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for CTRL+C");
            }
            tracing::info!("Shutdown signal received, stopping monitors...");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}
