//! Namespace Subnet Controller
//!
//! Gives every namespace its own IPv4 subnet out of the configured cluster
//! pools and reclaims it when the namespace is deleted.
//!
//! The subnet is recorded on the namespace as an annotation, along with the
//! gateway address node-side networking uses to wire up pods.

mod backoff;
mod binding;
mod config;
mod controller;
mod error;
mod reconciler;
mod store;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting Namespace Subnet Controller");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    for pool in &config.pools {
        info!(
            "  Pool: {} (/{} subnets, {} available)",
            pool.network,
            pool.subnet_prefix_len(),
            pool.capacity()
        );
    }

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
