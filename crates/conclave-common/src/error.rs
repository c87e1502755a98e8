//! Common error types for Conclave components.

use thiserror::Error;

/// Failures reported by the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// Connection to the coordination service was lost
    #[error("Connection lost: {0}")]
    ConnectionLoss(String),

    /// The client session expired or was closed
    #[error("Session expired")]
    SessionExpired,

    /// The node does not exist
    #[error("No node: {0}")]
    NoNode(String),

    /// A plain (non-sequential) node already exists at this path
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// The node still has children
    #[error("Node not empty: {0}")]
    NotEmpty(String),

    /// Expected version did not match
    #[error("Version mismatch: {0}")]
    BadVersion(String),

    /// Ephemeral nodes cannot have children
    #[error("Ephemeral parent: {0}")]
    NoChildrenForEphemerals(String),

    /// Malformed path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// Returns true for races between processes that callers absorb
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::NoNode(_) | Self::NodeExists(_))
    }

    /// Returns true if the session can no longer be trusted
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLoss(_) | Self::SessionExpired)
    }
}

/// Errors raised by the election and registry components
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Coordination service failure
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// `reelect` was called before `volunteer`
    #[error("Process has not volunteered for leadership")]
    NotVolunteered,

    /// The election namespace has no candidates
    #[error("Election namespace {0} is empty")]
    EmptyElection(String),

    /// A child of the election namespace carries no sequence number
    #[error("Malformed candidate entry: {0}")]
    MalformedCandidate(String),

    /// This process's own candidate entry is missing from the listing
    #[error("Candidate {0} is no longer registered")]
    CandidateMissing(String),

    /// A membership entry is already published for this process
    #[error("Already registered at {0}")]
    AlreadyRegistered(String),
}

impl ClusterError {
    /// Returns true if the broken state cannot be recovered without a new session
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_session_fatal(),
            Self::EmptyElection(_) | Self::MalformedCandidate(_) | Self::CandidateMissing(_) => {
                true
            }
            Self::NotVolunteered | Self::AlreadyRegistered(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_races() {
        assert!(CoordinationError::NoNode("/a".into()).is_benign_race());
        assert!(CoordinationError::NodeExists("/a".into()).is_benign_race());
        assert!(!CoordinationError::SessionExpired.is_benign_race());
        assert!(CoordinationError::ConnectionLoss("reset".into()).is_session_fatal());
    }

    #[test]
    fn test_cluster_error_fatality() {
        let err: ClusterError = CoordinationError::SessionExpired.into();
        assert!(err.is_fatal());
        assert!(ClusterError::MalformedCandidate("x".into()).is_fatal());
        assert!(!ClusterError::AlreadyRegistered("/r/n_1".into()).is_fatal());
        assert!(!ClusterError::from(CoordinationError::NoNode("/a".into())).is_fatal());
    }
}
