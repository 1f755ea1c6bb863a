//! Status Handler

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::services::matching::EngineStats;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub timestamp: i64,
    pub engine: EngineStats,
    /// Whether the external store mirror is connected and answering
    pub mirror: bool,
}

/// GET /status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let mirror = match &state.external {
        Some(external) => external.ping().await,
        None => false,
    };
    Json(StatusResponse {
        status: "online",
        timestamp: chrono::Utc::now().timestamp_millis(),
        engine: state.engine.stats(),
        mirror,
    })
}
