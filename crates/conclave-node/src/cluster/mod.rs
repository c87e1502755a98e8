//! Cluster coordination modules.
//!
//! Implements:
//! - Leader election over sequential ephemeral candidates
//! - Service registry with a watch-driven address cache
//! - The callback glue that publishes workers and retracts the leader

mod callback;
mod election;
mod registry;

pub use callback::{ElectionCallback, RegistrationPolicy, RegistryElectionAdapter};
pub use election::{ElectionConfig, LeaderElection};
pub use registry::{RegistryConfig, RegistryWatch, ServiceRegistry};
