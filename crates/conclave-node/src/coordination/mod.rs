//! Coordination service capability.
//!
//! Election and registry code only ever talks to a [`Coordinator`]:
//! a hierarchical namespace with sequential/ephemeral node creation,
//! one-shot watches, and a client session.
//!
//! Backends:
//! - [`MemoryCoordinator`] - in-process ensemble (single-process runs, tests)
//! - [`RedisCoordinator`] - Redis-backed emulation shared by many processes

mod memory;
mod redis_backend;
mod watches;

pub use self::memory::{MemoryCoordinator, MemoryEnsemble};
pub use self::redis_backend::{RedisBackendConfig, RedisCoordinator};
pub use self::watches::{WatchKind, WatchRegistry};

use async_trait::async_trait;
use conclave_common::{CoordinationError, CreateMode, NodeStat, SessionState, WatchedEvent};
use tokio::sync::{mpsc, watch};

/// Receiving end of a watch; notifications are delivered on this channel
pub type Watcher = mpsc::UnboundedSender<WatchedEvent>;

/// Create a watcher and the receiver its notifications arrive on
pub fn watch_channel() -> (Watcher, mpsc::UnboundedReceiver<WatchedEvent>) {
    mpsc::unbounded_channel()
}

/// Capability set consumed by election and registry.
///
/// Watches are one-shot: a watcher is notified at most once per arming and
/// must be re-armed by the next read. Arming the same channel twice on the
/// same path and kind is a single watch.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a node and return its full path (with sequence suffix if sequential)
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordinationError>;

    /// Delete a node; `None` matches any version
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError>;

    /// Stat a node. A watch is armed only when the node exists and fires on
    /// deletion or data change.
    async fn exists(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Option<NodeStat>, CoordinationError>;

    /// Child names sorted lexicographically. The watch fires when the child
    /// list changes or the parent is deleted.
    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<String>, CoordinationError>;

    /// Node payload
    async fn get_data(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<u8>, CoordinationError>;

    /// Identifier of the client session
    fn session_id(&self) -> &str;

    /// Session state stream
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// End the session, removing every ephemeral node it owns
    async fn close(&self) -> Result<(), CoordinationError>;
}

/// Validate an absolute, normalized path
pub fn validate_path(path: &str) -> Result<(), CoordinationError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(CoordinationError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Join a parent path and a child name
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a path into (parent, name); `None` for the root
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// Name of a node relative to its parent
pub fn node_name(path: &str) -> &str {
    split_path(path).map(|(_, name)| name).unwrap_or(path)
}

/// Create a persistent node and every missing ancestor.
///
/// Losing a creation race is success: the coordination service admits a
/// single creator per path.
pub async fn ensure_persistent(
    coordinator: &dyn Coordinator,
    path: &str,
) -> Result<(), CoordinationError> {
    validate_path(path)?;
    if path == "/" {
        return Ok(());
    }

    let mut current = String::new();
    for component in path[1..].split('/') {
        current.push('/');
        current.push_str(component);

        if coordinator.exists(&current, None).await?.is_some() {
            continue;
        }
        match coordinator.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) => tracing::info!(path = %current, "Created persistent node"),
            Err(CoordinationError::NodeExists(_)) => {
                tracing::debug!(path = %current, "Persistent node created concurrently");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/election").is_ok());
        assert!(validate_path("/apps/registry").is_ok());
        assert!(validate_path("election").is_err());
        assert!(validate_path("/election/").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_path("/election/c_1"), Some(("/election", "c_1")));
        assert_eq!(split_path("/election"), Some(("/", "election")));
        assert_eq!(split_path("/"), None);
        assert_eq!(join_path("/", "election"), "/election");
        assert_eq!(join_path("/election", "c_1"), "/election/c_1");
        assert_eq!(node_name("/service_registry/n_0000000003"), "n_0000000003");
    }

    #[tokio::test]
    async fn test_ensure_persistent_creates_ancestors() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();

        ensure_persistent(&session, "/apps/conclave/registry").await.unwrap();
        // Second call is a no-op
        ensure_persistent(&session, "/apps/conclave/registry").await.unwrap();

        assert_eq!(session.get_children("/apps", None).await.unwrap(), vec!["conclave"]);
        let stat = session.exists("/apps/conclave/registry", None).await.unwrap();
        assert!(stat.is_some_and(|s| s.ephemeral_owner.is_none()));
    }
}
