//! # Conclave Node
//!
//! Joins the cluster, serves the status surface and stays up until the
//! coordination session is lost.
//!
//! ## Startup
//! ```text
//! args → logging → config → bind → coordinator → namespaces → volunteer → reelect → serve
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use conclave_node::config::{AppConfig, BackendKind, ConfigOverrides};
use conclave_node::ClusterNode;

/// Conclave - leader election and service discovery node
#[derive(Parser, Debug)]
#[command(name = "conclave-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/conclave.toml")]
    config: String,

    /// Coordination service URL (overrides config)
    #[arg(long, env = "COORDINATOR_URL")]
    coordinator_url: Option<String>,

    /// Coordination backend (overrides config)
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Host advertised to the leader (overrides config)
    #[arg(long, env = "ADVERTISE_HOST")]
    advertise_host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            coordinator_url: self.coordinator_url.clone(),
            backend: self.backend,
            listen: self.listen.clone(),
            advertise_host: self.advertise_host.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🗳️  Starting Conclave node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!("📋 Configuration loaded from {}", args.config);

    // Bind before joining so the advertised address is already served
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🚀 Conclave listening on {}", config.listen_addr);

    // Join the cluster
    let node = ClusterNode::start(&config).await?;
    info!(
        node_id = %node.node_id(),
        address = %node.address(),
        "✅ Cluster joined"
    );

    // Serve until Ctrl+C or session loss, then leave the cluster
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };
    node.serve(listener, ctrl_c).await?;

    info!("👋 Conclave shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
