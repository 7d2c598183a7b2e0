//! Controller wiring.
//!
//! Builds the caches, work queue, reconciler and worker pool, waits
//! for the initial cache sync, and runs until a shutdown signal. On
//! shutdown, intake stops, in-flight reconciles finish, and the queue
//! drains before the process returns.

use crate::backoff::MaxOfRateLimiter;
use crate::cluster::KubeCluster;
use crate::error::ControllerError;
use crate::queue::{ObjectKey, RateLimitingQueue};
use crate::reconciler::Reconciler;
use crate::watcher::{Enqueuer, watch_deployments, watch_networks};
use crds::Network;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Main controller for Network reconciliation.
pub struct Controller {
    queue: Arc<RateLimitingQueue<ObjectKey>>,
    reconciler: Arc<Reconciler>,
    networks: Store<Network>,
    deployments: Store<Deployment>,
    network_watcher: JoinHandle<Result<(), ControllerError>>,
    deployment_watcher: JoinHandle<Result<(), ControllerError>>,
    workers: usize,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(namespace: Option<String>, workers: usize) -> Result<Self, ControllerError> {
        info!("Initializing Network controller");

        let client = Client::try_default().await?;

        let network_api: Api<Network> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let deployment_api: Api<Deployment> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };

        let (networks, network_writer) = reflector::store::<Network>();
        let (deployments, deployment_writer) = reflector::store::<Deployment>();

        let queue = Arc::new(RateLimitingQueue::new(MaxOfRateLimiter::with_defaults()));
        let enqueuer = Arc::new(Enqueuer::new(Arc::clone(&queue), networks.clone()));

        info!("Setting up event handlers");
        let network_watcher = tokio::spawn(watch_networks(
            network_api,
            network_writer,
            Arc::clone(&enqueuer),
        ));
        let deployment_watcher =
            tokio::spawn(watch_deployments(deployment_api, deployment_writer, enqueuer));

        let cluster = Arc::new(KubeCluster::new(client, networks.clone(), deployments.clone()));
        let reconciler = Arc::new(Reconciler::new(cluster));

        Ok(Self {
            queue,
            reconciler,
            networks,
            deployments,
            network_watcher,
            deployment_watcher,
            workers,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Waiting for caches to sync");
        self.wait_for_cache_sync().await?;

        info!(workers = self.workers, "Starting workers");
        let mut worker_handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            worker_handles.push(tokio::spawn(run_worker(worker, queue, reconciler)));
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received; draining work queue");
            }
            result = &mut self.network_watcher => {
                return Err(watch_failure("Network", result));
            }
            result = &mut self.deployment_watcher => {
                return Err(watch_failure("Deployment", result));
            }
        }

        // Stop intake, let in-flight reconciles finish, drain the rest
        self.network_watcher.abort();
        self.deployment_watcher.abort();
        self.queue.shut_down();
        for handle in worker_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed during shutdown");
            }
        }
        info!("Stopping workers");

        Ok(())
    }

    /// Blocks until both caches report their initial listing complete.
    /// Failure to sync within the bound is fatal to the process.
    async fn wait_for_cache_sync(&self) -> Result<(), ControllerError> {
        let sync = async {
            self.networks
                .wait_until_ready()
                .await
                .map_err(|e| ControllerError::CacheSync(e.to_string()))?;
            self.deployments
                .wait_until_ready()
                .await
                .map_err(|e| ControllerError::CacheSync(e.to_string()))?;
            Ok::<(), ControllerError>(())
        };
        tokio::time::timeout(CACHE_SYNC_TIMEOUT, sync)
            .await
            .map_err(|_| {
                ControllerError::CacheSync("timed out waiting for initial cache sync".to_string())
            })?
    }
}

fn watch_failure(
    kind: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> ControllerError {
    match result {
        Ok(Err(e)) => ControllerError::Watch(format!("{kind} watcher error: {e}")),
        Ok(Ok(())) => ControllerError::Watch(format!("{kind} watcher exited unexpectedly")),
        Err(e) => ControllerError::Watch(format!("{kind} watcher panicked: {e}")),
    }
}

/// One worker loop: dequeue, reconcile, report the outcome. Errors
/// stay local to their key; the loop only ends when the queue shuts
/// down.
async fn run_worker(
    worker: usize,
    queue: Arc<RateLimitingQueue<ObjectKey>>,
    reconciler: Arc<Reconciler>,
) {
    while let Some(key) = queue.get().await {
        match reconciler.sync(&key).await {
            Ok(()) => {
                queue.forget(&key);
                info!(worker, %key, "Successfully synced");
            }
            Err(e) => {
                error!(worker, %key, error = %e, "Error syncing; requeuing for later retry");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
}
