//! Network Controller
//!
//! Watches `Network` custom resources and converges one managed
//! Deployment per Network: created when absent, resized when the
//! declared replica count diverges, with the observed available
//! replicas reported back onto the Network status.
//!
//! Reconciliation is level-triggered: a work item carries only the
//! Network's identity, and every pass re-reads current state through
//! the shared caches.

mod backoff;
mod cluster;
mod controller;
mod error;
mod queue;
mod reconciler;
#[cfg(test)]
mod test_utils;
mod watcher;

use crate::error::ControllerError;
use controller::Controller;
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting Network controller");

    // Load configuration from environment variables. Cluster
    // connection (in-cluster vs KUBECONFIG) is resolved by the client.
    let namespace = env::var("WATCH_NAMESPACE").ok();
    let workers = match env::var("WORKERS") {
        Ok(raw) => raw.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
            ControllerError::InvalidConfig(format!("WORKERS must be a positive integer, got {raw:?}"))
        })?,
        Err(_) => 2,
    };

    info!("Configuration:");
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {workers}");

    // Initialize and run controller
    let controller = Controller::new(namespace, workers).await?;
    controller.run().await?;

    Ok(())
}
