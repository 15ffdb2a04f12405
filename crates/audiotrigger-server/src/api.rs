//! REST API endpoints for audiotrigger
//!
//! All endpoints are under /api/v1/ and return JSON.

use crate::AppState;
use audiotrigger_core::{EngineSnapshot, TriggerConfig};
use axum::extract::State;
use axum::response::Json;
use chrono::Utc;
use serde::Serialize;

/// Application status response
///
/// The engine snapshot fields are flattened into the top level.
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub build_date: String,
    pub device: Option<String>,
    pub uptime_seconds: i64,
    #[serde(flatten)]
    pub snapshot: EngineSnapshot,
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.status.current_snapshot();
    Json(StatusResponse {
        version: audiotrigger_core::VERSION.to_string(),
        build_date: audiotrigger_core::BUILD_DATE.to_string(),
        device: state.device.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        snapshot: EngineSnapshot::clone(&snapshot),
    })
}

/// GET /api/v1/config
pub async fn get_config(State(state): State<AppState>) -> Json<TriggerConfig> {
    Json(TriggerConfig::clone(&state.config))
}
