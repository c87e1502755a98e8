//! Election outcome handling.
//!
//! The election engine only knows the [`ElectionCallback`] contract; the
//! registry adapter is the production implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conclave_common::ClusterError;
use conclave_common::constants::{DEFAULT_REGISTRATION_ATTEMPTS, DEFAULT_REGISTRATION_RETRY_MS};
use serde::Deserialize;

use super::registry::ServiceRegistry;

/// Reactions to role determinations.
///
/// Both may be invoked more than once over a process lifetime.
#[async_trait]
pub trait ElectionCallback: Send + Sync {
    /// This process now holds the smallest candidate
    async fn on_elected_leader(&self) -> Result<(), ClusterError>;

    /// This process is not the leader and watches its predecessor
    async fn on_become_worker(&self);
}

/// Retry policy for worker registration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 { DEFAULT_REGISTRATION_ATTEMPTS }
fn default_retry_delay_ms() -> u64 { DEFAULT_REGISTRATION_RETRY_MS }

/// Publishes workers and retracts the leader from the registry
pub struct RegistryElectionAdapter {
    registry: Arc<ServiceRegistry>,
    address: String,
    policy: RegistrationPolicy,
}

impl RegistryElectionAdapter {
    pub fn new(registry: Arc<ServiceRegistry>, address: impl Into<String>) -> Self {
        Self {
            registry,
            address: address.into(),
            policy: RegistrationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RegistrationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl ElectionCallback for RegistryElectionAdapter {
    async fn on_elected_leader(&self) -> Result<(), ClusterError> {
        // A promoted worker must not advertise itself as a worker
        self.registry.unregister_from_cluster().await?;
        self.registry.register_for_updates().await?;

        tracing::info!(address = %self.address, "Serving as cluster leader");
        Ok(())
    }

    async fn on_become_worker(&self) {
        if let Some(path) = self.registry.membership().await {
            tracing::debug!(path = %path, "Already registered as worker");
            return;
        }

        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.registry.register_to_cluster(&self.address).await {
                Ok(_) => return,
                Err(ClusterError::AlreadyRegistered(_)) => return,
                Err(e) if attempt < attempts && !e.is_fatal() => {
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Worker registration failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.policy.retry_delay_ms)).await;
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        address = %self.address,
                        error = %e,
                        "Giving up on worker registration"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::RegistryConfig;
    use crate::coordination::{Coordinator, MemoryEnsemble};
    use crate::testing::InterceptCoordinator;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_worker_registration_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let intercept = Arc::new(InterceptCoordinator::new(&ensemble));
        let (registry, _watch) = ServiceRegistry::new(intercept.clone(), RegistryConfig::default());
        registry.ensure_root().await.unwrap();
        let creates_before = InterceptCoordinator::count(&intercept.creates);

        let adapter = RegistryElectionAdapter::new(registry.clone(), "http://10.0.0.2:8080");
        adapter.on_become_worker().await;
        adapter.on_become_worker().await;

        assert_eq!(InterceptCoordinator::count(&intercept.creates) - creates_before, 1);
        let members = intercept.get_children("/service_registry", None).await.unwrap();
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_retracts_membership() {
        let ensemble = MemoryEnsemble::new();
        let (registry, _watch) =
            ServiceRegistry::new(Arc::new(ensemble.connect()), RegistryConfig::default());
        registry.ensure_root().await.unwrap();

        let (peer, _peer_watch) =
            ServiceRegistry::new(Arc::new(ensemble.connect()), RegistryConfig::default());
        peer.register_to_cluster("http://10.0.0.3:8080").await.unwrap();

        let adapter = RegistryElectionAdapter::new(registry.clone(), "http://10.0.0.2:8080");
        adapter.on_become_worker().await;
        assert!(registry.membership().await.is_some());

        assert_ok!(adapter.on_elected_leader().await);
        assert!(registry.membership().await.is_none());

        let cached = registry.cached_addresses().unwrap();
        assert_eq!(cached.as_slice(), ["http://10.0.0.3:8080"]);
    }

    #[tokio::test]
    async fn test_registration_gives_up_after_max_attempts() {
        let ensemble = MemoryEnsemble::new();
        let intercept = Arc::new(InterceptCoordinator::new(&ensemble));
        // Missing root makes every attempt fail with NoNode
        let (registry, _watch) = ServiceRegistry::new(intercept.clone(), RegistryConfig::default());

        let adapter = RegistryElectionAdapter::new(registry.clone(), "addr").with_policy(
            RegistrationPolicy {
                max_attempts: 3,
                retry_delay_ms: 1,
            },
        );
        adapter.on_become_worker().await;

        assert_eq!(InterceptCoordinator::count(&intercept.creates), 3);
        assert!(registry.membership().await.is_none());
    }
}
