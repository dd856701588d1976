//! fortsa - mesh sidecar revision controller

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fortsa::controller::{self, Context};
use fortsa::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    if config.dry_run {
        info!("dry run mode active");
    }
    info!(
        restarts_per_minute = config.restarts_per_minute,
        active_restart_limit = config.active_restart_limit,
        "fortsa starting..."
    );

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let ctx = Arc::new(Context::new(client.clone(), config));

    // Catch drift that predates this process before the watches take over.
    controller::initial_drift_sweep(&ctx).await;

    // Run the controllers until shutdown
    controller::run_controllers(client, ctx).await;

    info!("fortsa shutting down");
    Ok(())
}
