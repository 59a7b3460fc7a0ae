//! Fleet Conductor binary
//!
//! Builds the control plane over the in-process adapters (standalone mode)
//! or over whatever drivers the deployment wires in, registers the static
//! node inventory, and runs the control loops until interrupted.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_conductor::adapters::{
    LoopbackBackup, LoopbackDriver, MemoryRepository, StaticProvisioner,
};
use fleet_conductor::adapters::static_provisioner::inventory_node;
use fleet_conductor::domain::types::{cloud_system_reserve_mb, Node, NodeHealth, NodeKind, NodeLifecycle};
use fleet_conductor::{Conductor, ConductorConfig, ConductorPorts};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Fleet Conductor - Control Plane for Stateful Game-Server Fleets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, env = "CONDUCTOR_CONFIG")]
    config: Option<String>,

    /// Number of nodes in the standalone static inventory
    #[arg(long, env = "INVENTORY_NODES", default_value = "4")]
    inventory_nodes: u32,

    /// RAM of each standalone inventory node in MB
    #[arg(long, env = "INVENTORY_NODE_RAM_MB", default_value = "16384")]
    inventory_node_ram_mb: u64,

    /// Number of dedicated nodes registered at startup
    #[arg(long, env = "DEDICATED_NODES", default_value = "1")]
    dedicated_nodes: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting Fleet Conductor");
    info!("  Version: {}", fleet_conductor::VERSION);

    let config = match &args.config {
        Some(path) => ConductorConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => ConductorConfig::default(),
    };

    // Standalone ports: in-memory repository, loopback agents, and a
    // static cloud inventory. Deployments swap these for real drivers.
    let inventory = (0..args.inventory_nodes)
        .map(|i| {
            inventory_node(
                &format!("inv-{:03}", i),
                &format!("10.0.1.{}", i + 10),
                args.inventory_node_ram_mb,
                8,
                0.12,
            )
        })
        .collect();
    let ports = ConductorPorts {
        repository: Arc::new(MemoryRepository::new()),
        driver: Arc::new(LoopbackDriver::new()),
        provisioner: Arc::new(StaticProvisioner::new(inventory)),
        backup: Arc::new(LoopbackBackup::new()),
    };

    let conductor = Conductor::build(config.clone(), ports)
        .await
        .context("building conductor")?;

    register_dedicated_nodes(&conductor, &config, &args)?;

    conductor.start();
    info!("Control loops running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    conductor.shutdown().await;

    info!("Conductor shutdown complete");
    Ok(())
}

/// Register the dedicated nodes the deployment always owns
fn register_dedicated_nodes(
    conductor: &Conductor,
    config: &ConductorConfig,
    args: &Args,
) -> anyhow::Result<()> {
    for i in 0..args.dedicated_nodes {
        let id = format!("dedicated-{:03}", i);
        let total = args.inventory_node_ram_mb * 2;
        let reserve = cloud_system_reserve_mb(
            total,
            config.placement.cloud_reserve_base_mb,
            config.placement.cloud_reserve_percent,
        );
        let mut node = Node::new(
            id,
            NodeKind::Dedicated,
            format!("10.0.0.{}", i + 10),
            total,
            reserve,
            16,
            0.0,
        );
        node.health = NodeHealth::Healthy;
        node.lifecycle = NodeLifecycle::Active;
        // A recovered fleet already has these registered; ignore duplicates.
        if let Err(e) = conductor.register_node(node) {
            tracing::debug!("dedicated node registration skipped: {}", e);
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
