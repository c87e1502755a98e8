//! Configuration management for Conclave.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use conclave_common::constants::{
    DEFAULT_COORDINATOR_URL, DEFAULT_LISTEN_ADDR, DEFAULT_SESSION_TIMEOUT_MS,
    redis_keys::DEFAULT_KEY_PREFIX,
};

use crate::cluster::{ElectionConfig, RegistrationPolicy, RegistryConfig};
use crate::coordination::RedisBackendConfig;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP listen address for the status surface
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Host advertised to the leader (defaults to the listen host)
    #[serde(default)]
    pub advertise_host: Option<String>,

    /// This node's unique ID (auto-generated if not set)
    #[serde(default = "generate_node_id")]
    pub node_id: String,

    /// Coordination service connection
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Leader election namespace
    #[serde(default)]
    pub election: ElectionConfig,

    /// Service registry namespace
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Worker registration retries
    #[serde(default)]
    pub registration: RegistrationPolicy,
}

/// Which coordination backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared Redis server
    Redis,
    /// In-process ensemble, single node only
    Memory,
}

/// Coordination service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Coordination service URL
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    /// Namespace prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Session expires after this long without a keepalive
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_coordinator_url(),
            key_prefix: default_key_prefix(),
            session_timeout_ms: default_session_timeout(),
        }
    }
}

impl CoordinatorConfig {
    /// Redis backend settings labelled with this node's ID
    pub fn redis_backend(&self, label: &str) -> RedisBackendConfig {
        RedisBackendConfig {
            url: self.url.clone(),
            key_prefix: self.key_prefix.clone(),
            session_timeout: Duration::from_millis(self.session_timeout_ms),
            label: label.to_string(),
        }
    }
}

/// Values supplied on the command line; `None` keeps the loaded value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub coordinator_url: Option<String>,
    pub backend: Option<BackendKind>,
    pub listen: Option<String>,
    pub advertise_host: Option<String>,
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_backend() -> BackendKind { BackendKind::Redis }
fn default_coordinator_url() -> String { DEFAULT_COORDINATOR_URL.to_string() }
fn default_key_prefix() -> String { DEFAULT_KEY_PREFIX.to_string() }
fn default_session_timeout() -> u64 { DEFAULT_SESSION_TIMEOUT_MS }

fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

impl AppConfig {
    /// Load configuration from file and `CONCLAVE__*` environment, with CLI overrides
    pub fn load(config_path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("CONCLAVE").separator("__"))
            .build()
            .context("Failed to load config")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        config.apply(overrides);
        Ok(config)
    }

    /// Apply CLI overrides
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref url) = overrides.coordinator_url {
            self.coordinator.url = url.clone();
        }
        if let Some(backend) = overrides.backend {
            self.coordinator.backend = backend;
        }
        if let Some(ref listen) = overrides.listen {
            self.listen_addr = listen.clone();
        }
        if let Some(ref host) = overrides.advertise_host {
            self.advertise_host = Some(host.clone());
        }
    }

    /// Address published to the service registry when working
    pub fn advertised_address(&self) -> String {
        let (listen_host, port) = self
            .listen_addr
            .rsplit_once(':')
            .unwrap_or((self.listen_addr.as_str(), "80"));
        let host = self.advertise_host.as_deref().unwrap_or(listen_host);
        format!("http://{host}:{port}")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_host: None,
            node_id: generate_node_id(),
            coordinator: CoordinatorConfig::default(),
            election: ElectionConfig::default(),
            registry: RegistryConfig::default(),
            registration: RegistrationPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.coordinator.backend, BackendKind::Redis);
        assert_eq!(config.coordinator.session_timeout_ms, 3000);
        assert_eq!(config.election.namespace, "/election");
        assert_eq!(config.registry.root, "/service_registry");
        assert!(config.node_id.starts_with("node-"));
    }

    #[test]
    fn test_advertised_address() {
        let mut config = AppConfig::default();
        config.listen_addr = "0.0.0.0:8081".to_string();
        assert_eq!(config.advertised_address(), "http://0.0.0.0:8081");

        config.advertise_host = Some("10.0.0.5".to_string());
        assert_eq!(config.advertised_address(), "http://10.0.0.5:8081");
    }

    #[test]
    fn test_overrides() {
        let mut config = AppConfig::default();
        config.apply(&ConfigOverrides {
            coordinator_url: Some("redis://cache:6379".to_string()),
            backend: Some(BackendKind::Memory),
            listen: None,
            advertise_host: Some("worker-3".to_string()),
        });

        assert_eq!(config.coordinator.url, "redis://cache:6379");
        assert_eq!(config.coordinator.backend, BackendKind::Memory);
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.advertised_address(), "http://worker-3:8080");
    }

    #[test]
    fn test_parse_sections() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                listen_addr = "0.0.0.0:9000"

                [coordinator]
                backend = "memory"

                [election]
                namespace = "/apps/election"

                [registration]
                max_attempts = 5
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.coordinator.backend, BackendKind::Memory);
        assert_eq!(config.election.namespace, "/apps/election");
        assert_eq!(config.election.candidate_prefix, "c_");
        assert_eq!(config.registration.max_attempts, 5);
        assert_eq!(config.registration.retry_delay_ms, 500);
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
    }
}
