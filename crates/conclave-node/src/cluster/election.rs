//! Leader election over sequential ephemeral candidates.
//!
//! Every process creates one candidate entry. The smallest sequence number
//! leads; every other process watches only its immediate predecessor, so a
//! deletion notifies exactly one process.

use std::sync::Arc;
use std::time::Duration;

use conclave_common::constants::{
    DEFAULT_CANDIDATE_PREFIX, DEFAULT_ELECTION_NAMESPACE, DEFAULT_WATCH_RETRY_MS,
};
use conclave_common::{
    ClusterError, CreateMode, ElectionRole, EventType, WatchedEvent, sequence_number,
};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::callback::ElectionCallback;
use crate::coordination::{Coordinator, Watcher, ensure_persistent, join_path, node_name, watch_channel};
use crate::session::retry_pause;

/// Election namespace configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ElectionConfig {
    /// Persistent node holding the candidate entries
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name prefix of candidate entries
    #[serde(default = "default_candidate_prefix")]
    pub candidate_prefix: String,

    /// Create the namespace at startup when missing
    #[serde(default = "default_create_namespace")]
    pub create_namespace: bool,

    /// Delay before repeating a failed determination while the session lives
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            candidate_prefix: default_candidate_prefix(),
            create_namespace: default_create_namespace(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_namespace() -> String { DEFAULT_ELECTION_NAMESPACE.to_string() }
fn default_candidate_prefix() -> String { DEFAULT_CANDIDATE_PREFIX.to_string() }
fn default_create_namespace() -> bool { true }
fn default_retry_delay_ms() -> u64 { DEFAULT_WATCH_RETRY_MS }

/// Election state for one process.
///
/// Owned by a single task once [`LeaderElection::run`] is spawned; the
/// current role is observable through [`LeaderElection::role`].
pub struct LeaderElection {
    coordinator: Arc<dyn Coordinator>,
    config: ElectionConfig,
    callback: Arc<dyn ElectionCallback>,
    /// Namespace-relative name of our candidate entry
    current_candidate: Option<String>,
    role: watch::Sender<ElectionRole>,
    watcher: Watcher,
    events: mpsc::UnboundedReceiver<WatchedEvent>,
}

impl LeaderElection {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        config: ElectionConfig,
        callback: Arc<dyn ElectionCallback>,
    ) -> Self {
        let (watcher, events) = watch_channel();
        let (role, _) = watch::channel(ElectionRole::Unregistered);
        Self {
            coordinator,
            config,
            callback,
            current_candidate: None,
            role,
            watcher,
            events,
        }
    }

    /// Subscribe to role changes
    pub fn role(&self) -> watch::Receiver<ElectionRole> {
        self.role.subscribe()
    }

    pub fn current_candidate(&self) -> Option<&str> {
        self.current_candidate.as_deref()
    }

    /// Create the namespace if configured to; concurrent creators all succeed
    pub async fn ensure_namespace(&self) -> Result<(), ClusterError> {
        if self.config.create_namespace {
            ensure_persistent(self.coordinator.as_ref(), &self.config.namespace).await?;
        }
        Ok(())
    }

    /// Create this process's candidate entry.
    ///
    /// Coordination failures are returned unretried; the entry is
    /// meaningless without a live session.
    pub async fn volunteer(&mut self) -> Result<String, ClusterError> {
        if let Some(existing) = &self.current_candidate {
            tracing::warn!(candidate = %existing, "Already volunteered");
            return Ok(existing.clone());
        }

        let prefix = join_path(&self.config.namespace, &self.config.candidate_prefix);
        let path = self
            .coordinator
            .create(&prefix, &[], CreateMode::EphemeralSequential)
            .await?;
        let candidate = node_name(&path).to_string();

        tracing::info!(candidate = %candidate, "Volunteered for leadership");
        self.role.send_replace(ElectionRole::Candidate {
            candidate: candidate.clone(),
        });
        self.current_candidate = Some(candidate.clone());
        Ok(candidate)
    }

    /// Determine leadership, arming a predecessor watch unless leading.
    ///
    /// Returns only after declaring leadership or arming a watch on a
    /// predecessor that existed at arming time.
    pub async fn reelect(&mut self) -> Result<ElectionRole, ClusterError> {
        let candidate = self
            .current_candidate
            .clone()
            .ok_or(ClusterError::NotVolunteered)?;

        loop {
            let children = self
                .coordinator
                .get_children(&self.config.namespace, None)
                .await?;
            let ranked = rank_candidates(&self.config.namespace, children)?;

            if ranked[0] == candidate {
                let role = ElectionRole::Leader { candidate };
                self.role.send_replace(role.clone());
                tracing::info!(candidate = %ranked[0], "Elected leader");
                self.callback.on_elected_leader().await?;
                return Ok(role);
            }

            let position = ranked
                .iter()
                .position(|name| *name == candidate)
                .ok_or_else(|| ClusterError::CandidateMissing(candidate.clone()))?;
            let predecessor = ranked[position - 1].clone();
            let predecessor_path = join_path(&self.config.namespace, &predecessor);

            let stat = self
                .coordinator
                .exists(&predecessor_path, Some(self.watcher.clone()))
                .await?;
            if stat.is_none() {
                tracing::debug!(
                    predecessor = %predecessor,
                    "Predecessor vanished before watch, re-ranking"
                );
                continue;
            }

            let role = ElectionRole::Watching {
                candidate,
                predecessor,
            };
            self.role.send_replace(role.clone());
            tracing::info!(
                candidate = ?role.candidate(),
                predecessor = ?role.predecessor(),
                "Following leader, watching predecessor"
            );
            self.callback.on_become_worker().await;
            return Ok(role);
        }
    }

    /// React to a watch notification; events for other paths are ignored.
    ///
    /// Any event on the watched predecessor consumes the watch, so each one
    /// re-runs the determination, which re-arms it.
    pub async fn handle_event(&mut self, event: &WatchedEvent) -> Result<(), ClusterError> {
        let watched = {
            let role = self.role.borrow();
            role.predecessor()
                .map(|name| join_path(&self.config.namespace, name))
        };

        match watched {
            Some(path) if path == event.path => {
                if event.event_type == EventType::NodeDeleted {
                    tracing::info!(predecessor = %path, "Predecessor deleted, re-running election");
                } else {
                    tracing::debug!(
                        predecessor = %path,
                        event = ?event.event_type,
                        "Predecessor changed, re-arming watch"
                    );
                }
                self.reelect().await?;
            }
            _ => {
                tracing::debug!(
                    event = ?event.event_type,
                    path = %event.path,
                    "Ignoring election notification"
                );
            }
        }
        Ok(())
    }

    /// Process notifications until shutdown.
    ///
    /// A failed pass leaves no watch armed, so it is repeated until it
    /// succeeds or the session ends.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut session = self.coordinator.session_state();
        let delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    let mut result = self.handle_event(&event).await;

                    while let Err(e) = result {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "Election failed");
                        } else {
                            tracing::warn!(error = %e, "Election failed");
                        }
                        if !retry_pause(&mut session, &shutdown, delay).await {
                            tracing::warn!("Session ended, abandoning election");
                            break;
                        }
                        result = self.reelect().await.map(|_| ());
                    }
                }
            }
        }

        tracing::debug!("Election driver stopped");
    }
}

/// Sort candidate names by their sequence number
fn rank_candidates(namespace: &str, children: Vec<String>) -> Result<Vec<String>, ClusterError> {
    if children.is_empty() {
        return Err(ClusterError::EmptyElection(namespace.to_string()));
    }

    let mut ranked = children
        .into_iter()
        .map(|name| match sequence_number(&name) {
            Some(seq) => Ok((seq, name)),
            None => Err(ClusterError::MalformedCandidate(name)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    ranked.sort();

    Ok(ranked.into_iter().map(|(_, name)| name).collect())
}
