//! # Conclave Common
//!
//! Shared types, errors, and defaults used across Conclave components.
//!
//! ## Modules
//! - `types` - Coordination data model (CreateMode, NodeStat, WatchedEvent, ElectionRole)
//! - `error` - Coordination and cluster error types
//! - `constants` - Default namespaces, timeouts, and backend key layout

pub mod constants;
pub mod error;
pub mod types;

pub use error::{ClusterError, CoordinationError};
pub use types::*;
