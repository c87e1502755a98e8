//! Service registry and address cache.
//!
//! Workers publish an ephemeral membership entry under a persistent root.
//! The cache of member addresses is rebuilt in full on every refresh and
//! swapped in one step, so readers see either the previous or the new list.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use conclave_common::constants::{
    DEFAULT_MEMBER_PREFIX, DEFAULT_REGISTRY_ROOT, DEFAULT_WATCH_RETRY_MS,
};
use conclave_common::{ClusterError, CoordinationError, CreateMode, EventType, WatchedEvent};
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::coordination::{Coordinator, Watcher, ensure_persistent, join_path, watch_channel};
use crate::session::retry_pause;

/// Registry namespace configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Persistent root holding the membership entries
    #[serde(default = "default_root")]
    pub root: String,

    /// Name prefix of membership entries
    #[serde(default = "default_member_prefix")]
    pub member_prefix: String,

    /// Delay before repeating a failed refresh while the session lives
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            member_prefix: default_member_prefix(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_root() -> String { DEFAULT_REGISTRY_ROOT.to_string() }
fn default_member_prefix() -> String { DEFAULT_MEMBER_PREFIX.to_string() }
fn default_retry_delay_ms() -> u64 { DEFAULT_WATCH_RETRY_MS }

/// Cluster membership and address discovery
pub struct ServiceRegistry {
    coordinator: Arc<dyn Coordinator>,
    config: RegistryConfig,
    /// Full path of this process's membership entry
    membership: Mutex<Option<String>>,
    /// Last published address snapshot; `None` until the first refresh
    addresses: ArcSwapOption<Vec<String>>,
    /// Serializes list -> check -> read -> swap
    refresh_lock: Mutex<()>,
    /// Armed on the root's child list by every refresh
    watcher: Watcher,
}

/// Task owning the registry's change notifications
pub struct RegistryWatch {
    registry: Arc<ServiceRegistry>,
    events: mpsc::UnboundedReceiver<WatchedEvent>,
}

impl ServiceRegistry {
    /// Create the registry and the task that keeps its cache current
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        config: RegistryConfig,
    ) -> (Arc<Self>, RegistryWatch) {
        let (watcher, events) = watch_channel();
        let registry = Arc::new(Self {
            coordinator,
            config,
            membership: Mutex::new(None),
            addresses: ArcSwapOption::from(None),
            refresh_lock: Mutex::new(()),
            watcher,
        });

        let watch = RegistryWatch {
            registry: registry.clone(),
            events,
        };
        (registry, watch)
    }

    /// Create the persistent root if absent; losing the creation race is fine
    pub async fn ensure_root(&self) -> Result<(), ClusterError> {
        ensure_persistent(self.coordinator.as_ref(), &self.config.root).await?;
        Ok(())
    }

    /// Publish this process's address as an ephemeral membership entry
    pub async fn register_to_cluster(&self, metadata: &str) -> Result<String, ClusterError> {
        let mut membership = self.membership.lock().await;
        if let Some(existing) = membership.as_ref() {
            return Err(ClusterError::AlreadyRegistered(existing.clone()));
        }

        let prefix = join_path(&self.config.root, &self.config.member_prefix);
        let path = self
            .coordinator
            .create(&prefix, metadata.as_bytes(), CreateMode::EphemeralSequential)
            .await?;

        tracing::info!(path = %path, address = %metadata, "Registered to service registry");
        *membership = Some(path.clone());
        Ok(path)
    }

    /// Retract the membership entry; a no-op without one
    pub async fn unregister_from_cluster(&self) -> Result<(), ClusterError> {
        let mut membership = self.membership.lock().await;
        let Some(path) = membership.as_ref() else {
            return Ok(());
        };

        if self.coordinator.exists(path, None).await?.is_some() {
            match self.coordinator.delete(path, None).await {
                Ok(()) => tracing::info!(path = %path, "Unregistered from service registry"),
                Err(CoordinationError::NoNode(_)) => {
                    tracing::debug!(path = %path, "Membership entry already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        *membership = None;
        Ok(())
    }

    /// Path of the current membership entry, if any
    pub async fn membership(&self) -> Option<String> {
        self.membership.lock().await.clone()
    }

    /// Populate the cache and subscribe to membership changes
    pub async fn register_for_updates(&self) -> Result<(), ClusterError> {
        self.refresh().await?;
        Ok(())
    }

    /// Rebuild the address cache and re-arm the child watch
    pub async fn refresh(&self) -> Result<Arc<Vec<String>>, ClusterError> {
        let _guard = self.refresh_lock.lock().await;
        self.rebuild().await
    }

    /// Current addresses, refreshing synchronously if never populated
    pub async fn get_all_addresses(&self) -> Result<Arc<Vec<String>>, ClusterError> {
        if let Some(addresses) = self.addresses.load_full() {
            return Ok(addresses);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another reader may have populated it while we waited
        if let Some(addresses) = self.addresses.load_full() {
            return Ok(addresses);
        }
        self.rebuild().await
    }

    /// Last snapshot without touching the coordination service
    pub fn cached_addresses(&self) -> Option<Arc<Vec<String>>> {
        self.addresses.load_full()
    }

    /// Caller must hold `refresh_lock`
    async fn rebuild(&self) -> Result<Arc<Vec<String>>, ClusterError> {
        let root = &self.config.root;
        let members = self
            .coordinator
            .get_children(root, Some(self.watcher.clone()))
            .await?;

        let mut addresses = Vec::with_capacity(members.len());
        for member in &members {
            let path = join_path(root, member);

            if self.coordinator.exists(&path, None).await?.is_none() {
                tracing::debug!(path = %path, "Member vanished before existence check");
                continue;
            }

            match self.coordinator.get_data(&path, None).await {
                Ok(bytes) => addresses.push(String::from_utf8_lossy(&bytes).into_owned()),
                Err(CoordinationError::NoNode(_)) => {
                    tracing::debug!(path = %path, "Member vanished before read");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let snapshot = Arc::new(addresses);
        self.addresses.store(Some(snapshot.clone()));

        tracing::info!(addresses = ?snapshot, "Cluster addresses refreshed");
        Ok(snapshot)
    }
}

impl RegistryWatch {
    /// Refresh on every child-list notification until shutdown
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut session = self.registry.coordinator.session_state();
        let delay = Duration::from_millis(self.registry.config.retry_delay_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if event.event_type == EventType::NodeDeleted {
                        tracing::warn!(path = %event.path, "Registry root deleted");
                    }

                    // Only a successful refresh re-arms the child watch
                    while let Err(e) = self.registry.refresh().await {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "Registry refresh failed");
                        } else {
                            tracing::warn!(error = %e, "Registry refresh failed");
                        }
                        if !retry_pause(&mut session, &shutdown, delay).await {
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("Registry watch stopped");
    }
}
