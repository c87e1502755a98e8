//! Health check endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use conclave_common::SessionState;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    session: SessionState,
}

/// Readiness check (is the coordination session live?)
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    let session = state.session_state();

    if session == SessionState::Connected {
        Ok(Json(ReadyResponse {
            status: "ready",
            session,
        }))
    } else {
        tracing::debug!(session = ?session, "Not ready");
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
