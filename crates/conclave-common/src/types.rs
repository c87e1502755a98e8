//! Core types shared across Conclave components.

use serde::{Deserialize, Serialize};

use crate::constants::SEQUENCE_DIGITS;

/// How a node is created in the coordination namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Persistent, with a sequence counter appended to the name
    PersistentSequential,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a sequence counter appended to the name
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Metadata returned by an existence check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    /// Data version, bumped on every write
    pub version: i32,

    /// Owning session for ephemeral nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_owner: Option<String>,

    /// Payload length in bytes
    pub data_length: usize,

    /// Number of direct children
    pub num_children: usize,

    /// Creation time (Unix epoch milliseconds)
    pub created_at_ms: i64,
}

/// Kind of change reported to a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A one-shot watch notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub path: String,
}

impl WatchedEvent {
    pub fn new(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
        }
    }
}

/// Client session state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Handshake in progress
    #[default]
    Connecting,
    /// Live session, ephemeral nodes are held
    Connected,
    /// Session timed out; ephemeral nodes are gone
    Expired,
    /// Session closed by this client
    Closed,
}

impl SessionState {
    /// Returns true once the session is lost for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Closed)
    }
}

/// Where this process stands in the election
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ElectionRole {
    /// No candidate entry yet
    #[default]
    Unregistered,
    /// Candidate entry created, leadership not determined
    Candidate { candidate: String },
    /// Smallest live sequence number
    Leader { candidate: String },
    /// Worker watching its immediate predecessor
    Watching {
        candidate: String,
        predecessor: String,
    },
}

impl ElectionRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }

    /// Name of this process's candidate entry, if registered
    pub fn candidate(&self) -> Option<&str> {
        match self {
            Self::Unregistered => None,
            Self::Candidate { candidate }
            | Self::Leader { candidate }
            | Self::Watching { candidate, .. } => Some(candidate),
        }
    }

    /// Entry currently being watched
    pub fn predecessor(&self) -> Option<&str> {
        match self {
            Self::Watching { predecessor, .. } => Some(predecessor),
            _ => None,
        }
    }
}

/// Parse the counter the coordination service appends to sequential names
///
/// `c_0000000042` yields `42`. Names without a trailing counter yield `None`.
pub fn sequence_number(name: &str) -> Option<u64> {
    let digits = name
        .bytes()
        .rev()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

/// Append a zero-padded counter to a sequential name prefix
pub fn sequential_name(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:0width$}", width = SEQUENCE_DIGITS)
}
