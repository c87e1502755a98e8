//! Cluster view endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use conclave_common::{ElectionRole, SessionState};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct ClusterResponse {
    node_id: String,
    address: String,
    role: ElectionRole,
    session: SessionState,
    /// Membership entry held while working
    membership: Option<String>,
    addresses: Vec<String>,
    uptime_secs: u64,
}

/// This node's view of the cluster
pub async fn cluster_view(
    State(state): State<AppState>,
) -> Result<Json<ClusterResponse>, StatusCode> {
    let addresses = state.registry.get_all_addresses().await.map_err(|e| {
        tracing::warn!(error = %e, "Failed to read cluster addresses");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(ClusterResponse {
        node_id: state.node_id.clone(),
        address: state.address.clone(),
        role: state.role(),
        session: state.session_state(),
        membership: state.registry.membership().await,
        addresses: addresses.as_ref().clone(),
        uptime_secs: state.started.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::cluster::{RegistryConfig, ServiceRegistry};
    use crate::coordination::Coordinator;
    use crate::routes::{create_router, test_support};
    use axum::http::StatusCode;
    use conclave_common::{ElectionRole, SessionState};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_cluster_view_lists_workers() {
        let role = ElectionRole::Leader {
            candidate: "c_0000000000".to_string(),
        };
        let (state, ensemble) = test_support::state(role, SessionState::Connected).await;

        let (worker, _watch) =
            ServiceRegistry::new(Arc::new(ensemble.connect()), RegistryConfig::default());
        worker.register_to_cluster("http://10.0.0.7:8080").await.unwrap();

        let response = create_router(state)
            .oneshot(test_support::get("/cluster"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = test_support::json(response).await;
        assert_eq!(body["node_id"], "node-test");
        assert_eq!(body["role"]["state"], "leader");
        assert_eq!(body["role"]["candidate"], "c_0000000000");
        assert_eq!(body["session"], "connected");
        assert_eq!(body["addresses"], serde_json::json!(["http://10.0.0.7:8080"]));
        assert!(body["membership"].is_null());
    }

    #[tokio::test]
    async fn test_cluster_view_unavailable_without_root() {
        let (state, ensemble) =
            test_support::state(ElectionRole::Unregistered, SessionState::Connected).await;
        let session = ensemble.connect();
        session.delete("/service_registry", None).await.unwrap();

        let response = create_router(state)
            .oneshot(test_support::get("/cluster"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
