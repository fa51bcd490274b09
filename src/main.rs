use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleet_node_controller::api::{ControlPlane, HttpControlPlane};
use fleet_node_controller::config::Config;
use fleet_node_controller::controller::binder::node_resource_tags;
use fleet_node_controller::controller::tags::{node_tag, relay_tag};
use fleet_node_controller::controller::NodeController;
use fleet_node_controller::engine::MemoryEngine;
use fleet_node_controller::telemetry;
use fleet_node_controller::tls::LocalCertRenewer;
use fleet_node_controller::vitals::ProcVitals;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(
        long,
        short,
        global = true,
        env = "FLEET_CONFIG",
        default_value = "/etc/fleet-controller/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run,
    /// Fetch the node once and print the tags it would use
    Check,
    /// Show version and build information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Fleet Node Controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Check => {
            let config = load_config(&args.config)?;
            run_check(&config).await
        }
        Commands::Run => {
            let config = load_config(&args.config)?;
            run_controller(config).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn run_check(config: &Config) -> anyhow::Result<()> {
    let api = HttpControlPlane::new(&config.api)?;
    let node = api
        .get_node_info()
        .await
        .context("fetching node info")?;
    let tag = node_tag(&node);

    println!("Node {} ({} on port {})", tag, node.node_type, node.port);
    for resource in node_resource_tags(&node, &tag) {
        println!("  resource: {}", resource);
    }
    if node.relay {
        let relay = api
            .get_relay_node_info()
            .await
            .context("fetching relay node info")?;
        println!("  relay: {} via {}:{}", relay_tag(&relay), relay.address, relay.port);
    }
    Ok(())
}

async fn run_controller(config: Config) -> anyhow::Result<()> {
    if let Err(e) = telemetry::init(&config.log) {
        eprintln!("Logging already initialized: {}", e);
    }

    info!(
        "Starting Fleet Node Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let api = Arc::new(HttpControlPlane::new(&config.api)?);
    let identity = api.describe();
    info!(
        "Control plane {} for node {}",
        identity.api_host, identity.node_id
    );

    let controller = Arc::new(NodeController::new(
        &config,
        api,
        Arc::new(MemoryEngine::new()),
        Arc::new(ProcVitals::new()),
        Arc::new(LocalCertRenewer::new(&config.cert)),
    ));
    controller.start().await.context("starting node controller")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    #[cfg(feature = "rest-api")]
    let server = if config.rest_api.enabled {
        let api_controller = controller.clone();
        let listen = config.rest_api.listen;
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.changed().await;
            };
            if let Err(e) =
                fleet_node_controller::rest_api::run_server(api_controller, listen, signal).await
            {
                tracing::error!("REST API server error: {:?}", e);
            }
        }))
    } else {
        None
    };
    #[cfg(not(feature = "rest-api"))]
    let _ = shutdown_rx;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    controller.stop().await;
    let _ = shutdown_tx.send(true);

    #[cfg(feature = "rest-api")]
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!("REST API server exited abnormally: {}", e);
        }
    }

    info!("Fleet Node Controller stopped");
    Ok(())
}
