//! In-process coordination ensemble.
//!
//! Every [`MemoryCoordinator`] connected to the same [`MemoryEnsemble`] sees one
//! namespace. Sessions own their ephemeral nodes; expiring or closing a session
//! removes them and notifies the watchers of the surviving sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use conclave_common::{
    CoordinationError, CreateMode, EventType, NodeStat, SessionState, WatchedEvent,
    sequential_name,
};
use tokio::sync::watch;

use super::{Coordinator, WatchKind, WatchRegistry, Watcher, split_path, validate_path};

struct ZNode {
    data: Vec<u8>,
    version: i32,
    owner: Option<String>,
    next_sequence: u64,
    created_at_ms: i64,
}

impl ZNode {
    fn new(data: Vec<u8>, owner: Option<String>) -> Self {
        Self {
            data,
            version: 0,
            owner,
            next_sequence: 0,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

struct SessionSlot {
    watches: Arc<WatchRegistry>,
    state: watch::Sender<SessionState>,
}

struct EnsembleState {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<String, SessionSlot>,
    next_session: u64,
}

impl EnsembleState {
    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str) -> Option<NodeStat> {
        let node = self.nodes.get(path)?;
        Some(NodeStat {
            version: node.version,
            ephemeral_owner: node.owner.clone(),
            data_length: node.data.len(),
            num_children: self.child_names(path).len(),
            created_at_ms: node.created_at_ms,
        })
    }

    fn notify(&self, events: &[WatchedEvent]) {
        for event in events {
            for slot in self.sessions.values() {
                slot.watches.trigger(event);
            }
        }
    }

    fn remove_node(&mut self, path: &str) -> Vec<WatchedEvent> {
        if self.nodes.remove(path).is_none() {
            return Vec::new();
        }
        let mut events = vec![WatchedEvent::new(EventType::NodeDeleted, path)];
        if let Some((parent, _)) = split_path(path) {
            events.push(WatchedEvent::new(EventType::NodeChildrenChanged, parent));
        }
        events
    }

    /// Drop a session and every ephemeral node it owns
    fn purge_session(&mut self, session_id: &str, terminal: SessionState) -> bool {
        let Some(slot) = self.sessions.remove(session_id) else {
            return false;
        };
        slot.watches.clear();

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.as_deref() == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();

        let mut events = Vec::new();
        for path in &owned {
            events.extend(self.remove_node(path));
        }
        self.notify(&events);

        slot.state.send_replace(terminal);
        tracing::debug!(
            session = %session_id,
            removed = owned.len(),
            state = ?terminal,
            "Session ended"
        );
        true
    }
}

/// A shared in-memory namespace
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<Mutex<EnsembleState>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None));
        Self {
            inner: Arc::new(Mutex::new(EnsembleState {
                nodes,
                sessions: HashMap::new(),
                next_session: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EnsembleState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new client session
    pub fn connect(&self) -> MemoryCoordinator {
        let mut state = self.lock();
        let session_id = format!("{:016x}", state.next_session);
        state.next_session += 1;

        let watches = Arc::new(WatchRegistry::new());
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        state.sessions.insert(
            session_id.clone(),
            SessionSlot {
                watches: watches.clone(),
                state: state_tx,
            },
        );

        MemoryCoordinator {
            ensemble: self.clone(),
            session_id,
            watches,
            state: state_rx,
        }
    }

    /// Expire a session as if its process crashed
    ///
    /// Returns false if the session was already gone.
    pub fn expire_session(&self, session_id: &str) -> bool {
        self.lock().purge_session(session_id, SessionState::Expired)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

/// Client session on a [`MemoryEnsemble`]
pub struct MemoryCoordinator {
    ensemble: MemoryEnsemble,
    session_id: String,
    watches: Arc<WatchRegistry>,
    state: watch::Receiver<SessionState>,
}

impl MemoryCoordinator {
    fn live_state(&self) -> Result<MutexGuard<'_, EnsembleState>, CoordinationError> {
        let state = self.ensemble.lock();
        if !state.sessions.contains_key(&self.session_id) {
            return Err(CoordinationError::SessionExpired);
        }
        Ok(state)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        validate_path(path)?;
        let Some((parent, _)) = split_path(path) else {
            return Err(CoordinationError::NodeExists(path.to_string()));
        };

        let mut state = self.live_state()?;
        let parent_node = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| CoordinationError::NoNode(parent.to_string()))?;
        if parent_node.owner.is_some() {
            return Err(CoordinationError::NoChildrenForEphemerals(parent.to_string()));
        }

        let full_path = if mode.is_sequential() {
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            sequential_name(path, sequence)
        } else {
            path.to_string()
        };

        if state.nodes.contains_key(&full_path) {
            return Err(CoordinationError::NodeExists(full_path));
        }

        let owner = mode.is_ephemeral().then(|| self.session_id.clone());
        state
            .nodes
            .insert(full_path.clone(), ZNode::new(data.to_vec(), owner));

        state.notify(&[
            WatchedEvent::new(EventType::NodeCreated, full_path.as_str()),
            WatchedEvent::new(EventType::NodeChildrenChanged, parent),
        ]);

        Ok(full_path)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::InvalidPath(path.to_string()));
        }

        let mut state = self.live_state()?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        if version.is_some_and(|v| v != node.version) {
            return Err(CoordinationError::BadVersion(path.to_string()));
        }
        if !state.child_names(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_string()));
        }

        let events = state.remove_node(path);
        state.notify(&events);
        Ok(())
    }

    async fn exists(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Option<NodeStat>, CoordinationError> {
        validate_path(path)?;
        let state = self.live_state()?;
        let stat = state.stat(path);
        if let (Some(_), Some(watcher)) = (&stat, watch) {
            self.watches.arm(path, WatchKind::Exists, watcher);
        }
        Ok(stat)
    }

    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<String>, CoordinationError> {
        validate_path(path)?;
        let state = self.live_state()?;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        if let Some(watcher) = watch {
            self.watches.arm(path, WatchKind::Children, watcher);
        }
        Ok(state.child_names(path))
    }

    async fn get_data(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<u8>, CoordinationError> {
        validate_path(path)?;
        let state = self.live_state()?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        if let Some(watcher) = watch {
            self.watches.arm(path, WatchKind::Data, watcher);
        }
        Ok(node.data.clone())
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        self.ensemble
            .lock()
            .purge_session(&self.session_id, SessionState::Closed);
        Ok(())
    }
}
