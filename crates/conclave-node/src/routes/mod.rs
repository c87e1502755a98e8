//! HTTP status surface for Conclave nodes.

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod cluster;
mod health;

/// Create the status router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Cluster view
        .route("/cluster", get(cluster::cluster_view))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
