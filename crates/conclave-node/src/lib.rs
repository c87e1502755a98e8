//! # Conclave Node
//!
//! Leader election and service discovery for a cluster of identical
//! worker processes, coordinated through a ZooKeeper-style service.
//!
//! ## Architecture
//! ```text
//! LeaderElection ──(callback)──> RegistryElectionAdapter ──> ServiceRegistry
//!        │                                                        │
//!        └───────────────────> Coordinator <──────────────────────┘
//!                          (Redis | in-memory)
//! ```

pub mod cluster;
pub mod config;
pub mod coordination;
pub mod node;
pub mod routes;
pub mod session;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use node::ClusterNode;
pub use state::AppState;
