//! Application state shared with the HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use conclave_common::{ElectionRole, SessionState};
use tokio::sync::watch;

use crate::cluster::ServiceRegistry;
use crate::node::ClusterNode;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Node identifier for clustering
    pub node_id: String,

    /// Address this node publishes while working
    pub address: String,

    /// Election role published by the election driver
    pub role: watch::Receiver<ElectionRole>,

    /// Coordination session state
    pub session: watch::Receiver<SessionState>,

    /// Membership and address cache
    pub registry: Arc<ServiceRegistry>,

    /// Process start, for uptime reporting
    pub started: Instant,
}

impl AppState {
    pub fn new(node: &ClusterNode) -> Self {
        Self {
            node_id: node.node_id().to_string(),
            address: node.address().to_string(),
            role: node.role(),
            session: node.session_state(),
            registry: node.registry(),
            started: Instant::now(),
        }
    }

    /// Current election role
    pub fn role(&self) -> ElectionRole {
        self.role.borrow().clone()
    }

    /// Current session state
    pub fn session_state(&self) -> SessionState {
        *self.session.borrow()
    }
}
