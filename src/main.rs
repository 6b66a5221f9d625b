//! PVC clone controller
//!
//! Main entry point. Loads configuration, sets up the Kubernetes client,
//! and runs the clone controller next to the metrics server.

use clap::Parser;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pvc_clone_controller::{
    config::Config, controllers, metrics, token::CloneTokenValidator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    init_tracing();

    info!(
        image = %config.clone_image,
        pull_policy = %config.pull_policy,
        workers = config.workers,
        "Starting PVC clone controller"
    );

    let validator = CloneTokenValidator::for_clone(config.load_public_key()?);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    // The controller returns once a shutdown signal has drained in-flight work
    let clone_controller =
        controllers::run_clone_controller(client, validator, config.pod_settings(), config.workers);

    tokio::select! {
        _ = clone_controller => {
            info!("Clone controller finished");
        }
        result = metrics_handle => {
            error!(?result, "Metrics server exited unexpectedly");
        }
    }

    info!("PVC clone controller stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
