use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ConfigError;
use crate::engine::{Engine, StatsSnapshot, TriggerInfo};
use crate::state::MonitoredEntity;
use crate::workflow::RunReport;

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<Engine>,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Entity Status
// ============================================================================

#[derive(Serialize)]
pub struct StatusResponse {
    pub entities: Vec<MonitoredEntity>,
    pub count: usize,
    /// Entities that are failing or unknown
    pub degraded: usize,
}

pub async fn list_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let entities = state.engine.store().list();
    let degraded = entities
        .iter()
        .filter(|e| !e.status.is_healthy())
        .count();

    Json(StatusResponse {
        count: entities.len(),
        degraded,
        entities,
    })
}

pub async fn entity_status(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<MonitoredEntity>, ApiError> {
    state
        .engine
        .store()
        .get(&key)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Entity '{}' not found", key)))
}

// ============================================================================
// Triggers
// ============================================================================

pub async fn list_triggers(State(state): State<Arc<AppState>>) -> Json<Vec<TriggerInfo>> {
    Json(state.engine.triggers())
}

#[derive(Serialize)]
pub struct ToggleResponse {
    pub id: String,
    pub enabled: bool,
}

pub async fn enable_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>, ApiError> {
    set_enabled(&state, id, true)
}

pub async fn disable_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>, ApiError> {
    set_enabled(&state, id, false)
}

fn set_enabled(
    state: &AppState,
    id: String,
    enabled: bool,
) -> Result<Json<ToggleResponse>, ApiError> {
    match state.engine.set_enabled(&id, enabled) {
        Some(enabled) => Ok(Json(ToggleResponse { id, enabled })),
        None => Err(ApiError::NotFound(format!("Trigger '{}' not found", id))),
    }
}

// ============================================================================
// Runs & Stats
// ============================================================================

#[derive(Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Json<Vec<RunReport>> {
    Json(state.engine.recent_runs(query.limit.unwrap_or(50)))
}

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub engine: StatsSnapshot,
    pub entities: usize,
    pub cooldowns: usize,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        engine: state.engine.stats(),
        entities: state.engine.store().len(),
        cooldowns: state.engine.rate().cooldowns().len(),
    })
}

// ============================================================================
// Reload
// ============================================================================

#[derive(Serialize)]
pub struct ReloadResponse {
    pub triggers: usize,
}

pub async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, ApiError> {
    // Reading and compiling the file is blocking work
    let engine = Arc::clone(&state.engine);
    let triggers = tokio::task::spawn_blocking(move || engine.reload())
        .await
        .map_err(|e| ApiError::Internal(format!("Reload task failed: {}", e)))??;
    Ok(Json(ReloadResponse { triggers }))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io(e) => ApiError::Internal(format!("Reload failed: {}", e)),
            other => ApiError::BadRequest(format!("Reload rejected: {}", other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
