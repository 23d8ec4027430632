//! Testbed
//!
//! Starts catalog services the same way the integration suites do, prints
//! their connection parameters and keeps them up until Ctrl-C.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::Result;
use test_resources::metrics::ResourceMetrics;
use test_resources::{AssetId, DockerRuntime, ResourceConfig, ServiceKind, ServiceManager};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "testbed")]
#[command(about = "Run shared integration-test services locally")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the services that can be started
    List,

    /// Start a service and keep it running until Ctrl-C
    Up {
        /// Service name as shown by `list`
        service: ServiceKind,

        /// Asset to make present once the service is ready (repeatable)
        #[arg(short, long = "asset")]
        assets: Vec<AssetId>,

        /// Print connection parameters as JSON instead of key=value lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let config = ResourceConfig::from_env()?;

    match cli.command {
        Commands::List => list(&config),
        Commands::Up {
            service,
            assets,
            json,
        } => up(config, service, &assets, json).await?,
    }

    Ok(())
}

fn list(config: &ResourceConfig) {
    println!("{:<24} {:<24} {:<8} IMAGE", "SERVICE", "LABEL", "ASSETS");
    for kind in ServiceKind::all() {
        let descriptor = kind.descriptor(config);
        println!(
            "{:<24} {:<24} {:<8} {}",
            kind.as_ref(),
            kind.label(),
            if kind.supports_assets() { "yes" } else { "no" },
            descriptor.image
        );
    }
}

async fn up(config: ResourceConfig, service: ServiceKind, assets: &[AssetId], json: bool) -> Result<()> {
    ResourceMetrics::describe();
    let manager = ServiceManager::new(Arc::new(DockerRuntime::new()), config);

    info!(%service, assets = assets.len(), "Bringing service up");
    let params = match manager.ensure_kind(service, assets).await {
        Ok(params) => params,
        Err(err) => {
            warn!(%service, error = %err, "Service failed to come up, cleaning up");
            manager.shutdown().await;
            return Err(err.into());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&params)?);
    } else {
        print!("{}", params.to_properties());
    }

    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let stopped = manager.shutdown().await;
    info!(stopped = stopped.len(), "Services stopped");

    Ok(())
}
