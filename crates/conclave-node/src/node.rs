//! Cluster participation for one process.
//!
//! Wires the coordinator, election, registry and session monitor together
//! and owns the background tasks that service their notifications.

use anyhow::{Context, Result};
use conclave_common::{ElectionRole, SessionState};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{LeaderElection, RegistryElectionAdapter, ServiceRegistry};
use crate::config::{AppConfig, BackendKind};
use crate::coordination::{Coordinator, MemoryEnsemble, RedisCoordinator};
use crate::routes;
use crate::session::SessionMonitor;
use crate::state::AppState;

/// A running cluster member
pub struct ClusterNode {
    node_id: String,
    address: String,
    coordinator: Arc<dyn Coordinator>,
    registry: Arc<ServiceRegistry>,
    role: watch::Receiver<ElectionRole>,
    session_lost: CancellationToken,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterNode {
    /// Connect to the configured backend and join the cluster
    pub async fn start(config: &AppConfig) -> Result<Self> {
        let coordinator: Arc<dyn Coordinator> = match config.coordinator.backend {
            BackendKind::Redis => {
                let backend = config.coordinator.redis_backend(&config.node_id);
                let coordinator = RedisCoordinator::connect(backend)
                    .await
                    .context("Failed to connect to coordination service")?;
                Arc::new(coordinator)
            }
            BackendKind::Memory => {
                tracing::warn!("Using in-process coordinator, cluster is limited to this process");
                Arc::new(MemoryEnsemble::new().connect())
            }
        };

        tracing::info!(
            backend = ?config.coordinator.backend,
            session = %coordinator.session_id(),
            "Coordination session established"
        );

        Self::start_with(coordinator, config).await
    }

    /// Join the cluster over an existing session
    pub async fn start_with(coordinator: Arc<dyn Coordinator>, config: &AppConfig) -> Result<Self> {
        let address = config.advertised_address();
        let shutdown = CancellationToken::new();

        let (registry, registry_watch) =
            ServiceRegistry::new(coordinator.clone(), config.registry.clone());
        let adapter = RegistryElectionAdapter::new(registry.clone(), address.clone())
            .with_policy(config.registration.clone());
        let mut election =
            LeaderElection::new(coordinator.clone(), config.election.clone(), Arc::new(adapter));

        election
            .ensure_namespace()
            .await
            .context("Failed to create election namespace")?;
        registry
            .ensure_root()
            .await
            .context("Failed to create service registry root")?;

        let monitor = SessionMonitor::new(coordinator.session_state());
        let session_lost = monitor.lost_token();
        let mut tasks = vec![
            tokio::spawn(monitor.run(shutdown.clone())),
            tokio::spawn(registry_watch.run(shutdown.clone())),
        ];

        election.volunteer().await.context("Failed to volunteer")?;
        let role = election.reelect().await.context("Failed to determine leadership")?;
        tracing::info!(node_id = %config.node_id, role = ?role, "Joined cluster");

        let role = election.role();
        tasks.push(tokio::spawn(election.run(shutdown.clone())));

        Ok(Self {
            node_id: config.node_id.clone(),
            address,
            coordinator,
            registry,
            role,
            session_lost,
            shutdown,
            tasks,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Address published while working
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn session_id(&self) -> &str {
        self.coordinator.session_id()
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    /// Current election role
    pub fn role(&self) -> watch::Receiver<ElectionRole> {
        self.role.clone()
    }

    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.coordinator.session_state()
    }

    /// Token released once the session is lost
    pub fn session_lost(&self) -> CancellationToken {
        self.session_lost.clone()
    }

    /// Block until the coordination session is lost
    pub async fn wait_for_session_loss(&self) {
        self.session_lost.cancelled().await;
    }

    /// Serve the status surface until `signal` fires or the session is lost,
    /// then leave the cluster
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = routes::create_router(AppState::new(&self));
        let session_lost = self.session_lost();
        let shutdown = async move {
            tokio::select! {
                _ = signal => tracing::info!("🛑 Shutdown signal received"),
                _ = session_lost.cancelled() => {
                    tracing::warn!("🛑 Coordination session lost, shutting down");
                }
            }
        };

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("Server error");

        // Leave the cluster even when serving failed
        let closed = self.close().await;
        served?;
        closed
    }

    /// Leave the cluster: retract membership, stop tasks and end the session
    pub async fn close(self) -> Result<()> {
        if !self.session_lost.is_cancelled() {
            if let Err(e) = self.registry.unregister_from_cluster().await {
                tracing::warn!(error = %e, "Failed to unregister during shutdown");
            }
        }

        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.coordinator
            .close()
            .await
            .context("Failed to close coordination session")?;
        tracing::info!(node_id = %self.node_id, "Left cluster");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn node_config(port: u16) -> AppConfig {
        AppConfig {
            listen_addr: format!("127.0.0.1:{port}"),
            node_id: format!("node-{port}"),
            ..AppConfig::default()
        }
    }

    async fn join(ensemble: &MemoryEnsemble, port: u16) -> ClusterNode {
        let session: Arc<MemoryCoordinator> = Arc::new(ensemble.connect());
        ClusterNode::start_with(session, &node_config(port)).await.unwrap()
    }

    async fn wait_until<F>(node: &ClusterNode, mut predicate: F)
    where
        F: FnMut(&[String]) -> bool,
    {
        let registry = node.registry();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if registry.cached_addresses().is_some_and(|a| predicate(&a)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registry did not converge");
    }

    #[tokio::test]
    async fn test_cluster_failover() {
        let ensemble = MemoryEnsemble::new();
        let first = join(&ensemble, 8001).await;
        let second = join(&ensemble, 8002).await;
        let third = join(&ensemble, 8003).await;

        assert!(first.role().borrow().is_leader());
        assert!(!second.role().borrow().is_leader());
        assert!(first.registry().membership().await.is_none());

        wait_until(&first, |a| {
            a == ["http://127.0.0.1:8002", "http://127.0.0.1:8003"]
        })
        .await;

        // Leader crash promotes the next candidate, which retracts itself
        ensemble.expire_session(first.session_id());
        first.wait_for_session_loss().await;

        let mut role = second.role();
        tokio::time::timeout(Duration::from_secs(2), role.wait_for(|r| r.is_leader()))
            .await
            .expect("second node was not promoted")
            .unwrap();
        assert!(second.registry().membership().await.is_none());
        assert!(!third.role().borrow().is_leader());

        wait_until(&second, |a| a == ["http://127.0.0.1:8003"]).await;

        third.close().await.unwrap();
        wait_until(&second, |a| a.is_empty()).await;
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_retracts_worker() {
        let ensemble = MemoryEnsemble::new();
        let leader = join(&ensemble, 9001).await;
        let worker = join(&ensemble, 9002).await;
        wait_until(&leader, |a| a.len() == 1).await;

        worker.close().await.unwrap();
        wait_until(&leader, |a| a.is_empty()).await;
        assert_eq!(ensemble.session_count(), 1);
    }

    #[tokio::test]
    async fn test_serve_answers_on_advertised_port_then_leaves() {
        let ensemble = MemoryEnsemble::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = join(&ensemble, port).await;
        assert_eq!(node.address(), format!("http://127.0.0.1:{port}"));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(node.serve(listener, async move {
            let _ = stop_rx.await;
        }));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(ensemble.session_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_stops_on_session_loss() {
        let ensemble = MemoryEnsemble::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = join(&ensemble, port).await;
        let session_id = node.session_id().to_string();

        let server = tokio::spawn(node.serve(listener, std::future::pending()));
        ensemble.expire_session(&session_id);

        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server outlived the session")
            .unwrap()
            .unwrap();
    }
}
