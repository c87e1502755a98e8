//! Shared constants for Conclave components.
//!
//! These are defaults only. Components receive their namespaces and timeouts
//! through explicit configuration structs.

/// Default coordination backend URL
pub const DEFAULT_COORDINATOR_URL: &str = "redis://127.0.0.1:6379";

/// Default status server listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default session timeout (milliseconds)
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 3000;

/// Default election namespace
pub const DEFAULT_ELECTION_NAMESPACE: &str = "/election";

/// Prefix of candidate entries under the election namespace
pub const DEFAULT_CANDIDATE_PREFIX: &str = "c_";

/// Default service registry root
pub const DEFAULT_REGISTRY_ROOT: &str = "/service_registry";

/// Prefix of membership entries under the registry root
pub const DEFAULT_MEMBER_PREFIX: &str = "n_";

/// Width of the zero-padded counter appended to sequential node names
pub const SEQUENCE_DIGITS: usize = 10;

/// Worker registration attempts before giving up
pub const DEFAULT_REGISTRATION_ATTEMPTS: u32 = 3;

/// Delay between worker registration attempts (milliseconds)
pub const DEFAULT_REGISTRATION_RETRY_MS: u64 = 500;

/// Delay before repeating a failed election or refresh pass (milliseconds)
pub const DEFAULT_WATCH_RETRY_MS: u64 = 500;

/// Redis key layout used by the Redis coordination backend
pub mod redis_keys {
    /// Default prefix for every key the backend touches
    pub const DEFAULT_KEY_PREFIX: &str = "conclave:";

    /// Node hash: node:{path} (fields: data, owner, version, ctime)
    pub const NODE_PREFIX: &str = "node:";

    /// Child name set: children:{path}
    pub const CHILDREN_PREFIX: &str = "children:";

    /// Sequential name counter: seq:{path}
    pub const SEQUENCE_PREFIX: &str = "seq:";

    /// Session liveness key: session:{session_id}
    pub const SESSION_PREFIX: &str = "session:";

    /// Set of all known session ids
    pub const SESSIONS: &str = "sessions";

    /// Ephemeral paths owned by a session: owned:{session_id}
    pub const OWNED_PREFIX: &str = "owned:";

    /// Pub/sub channel carrying change notices
    pub const EVENTS_CHANNEL: &str = "events";
}
