use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use session_manager::SessionState;

use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub instances: usize,
    pub connected: usize,
}

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let instances = state.manager.list_all().await;
    let connected = instances
        .iter()
        .filter(|i| i.status == SessionState::Connected)
        .count();

    Json(HealthStatus {
        status: "OK",
        uptime_secs: state.started_at.elapsed().as_secs(),
        instances: instances.len(),
        connected,
    })
}
