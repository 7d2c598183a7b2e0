//! Core convergence algorithm.
//!
//! One `sync` pass re-reads the Network and its managed Deployment
//! and converges the Deployment toward the declared spec: create when
//! absent, update when the replica count diverges, then mirror the
//! observed available replicas back into the Network status. Every
//! pass is idempotent; after convergence a pass performs no writes.

use crate::cluster::ClusterApi;
use crate::error::ControllerError;
use crate::queue::ObjectKey;
use chrono::Utc;
use crds::{Network, NetworkStatus};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use kube_runtime::events::EventType;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Event reason recorded on successful convergence.
pub const REASON_SYNCED: &str = "Synced";
/// Event reason recorded on an ownership conflict.
pub const REASON_RESOURCE_EXISTS: &str = "ErrResourceExists";

const MESSAGE_SYNCED: &str = "Network synced successfully";

/// Converges the Deployment managed by a Network.
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
}

impl Reconciler {
    /// Create a reconciler over the given cluster seam.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// One reconcile pass for the keyed Network.
    ///
    /// Returns `Ok` for benign races (Network deleted after enqueue)
    /// and permanently invalid specs; those must not be retried. Every
    /// other failure is transient and propagates for a rate-limited
    /// requeue.
    pub async fn sync(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let Some(network) = self.cluster.network(&key.namespace, &key.name).await? else {
            debug!(%key, "Network no longer exists; dropping work item");
            return Ok(());
        };

        let deployment_name = network.spec.deployment_name.as_str();
        if deployment_name.is_empty() {
            warn!(%key, "Deployment name must be specified; skipping until the spec is corrected");
            return Ok(());
        }

        let deployment = match self.cluster.deployment(&key.namespace, deployment_name).await? {
            Some(existing) => existing,
            None => Arc::new(
                self.cluster
                    .create_deployment(&build_deployment(&network))
                    .await?,
            ),
        };

        self.guard_ownership(&network, &deployment).await?;

        let desired = network.spec.replicas;
        let current = deployment.spec.as_ref().and_then(|spec| spec.replicas);
        let deployment = if desired.is_some() && desired != current {
            debug!(%key, ?current, ?desired, "Updating Deployment replicas");
            Arc::new(
                self.cluster
                    .update_deployment(&build_deployment(&network))
                    .await?,
            )
        } else {
            deployment
        };

        self.report_status(&network, &deployment).await?;

        self.cluster
            .publish_event(&network, EventType::Normal, REASON_SYNCED, MESSAGE_SYNCED)
            .await;
        Ok(())
    }

    /// Refuses to adopt a Deployment this Network does not own.
    ///
    /// On conflict the Deployment is left untouched, a warning event
    /// names the collision, and the error requeues the key so the
    /// problem stays visible until an operator resolves it.
    async fn guard_ownership(
        &self,
        network: &Network,
        deployment: &Deployment,
    ) -> Result<(), ControllerError> {
        if is_controlled_by(deployment, network) {
            return Ok(());
        }
        let name = deployment.name_any();
        let message = format!("Resource {name:?} already exists and is not managed by Network");
        self.cluster
            .publish_event(network, EventType::Warning, REASON_RESOURCE_EXISTS, &message)
            .await;
        Err(ControllerError::ResourceExists(name))
    }

    /// Writes the observed state onto the Network through the
    /// status-only write path. Skips the write when nothing changed.
    async fn report_status(
        &self,
        network: &Network,
        deployment: &Deployment,
    ) -> Result<(), ControllerError> {
        let available = deployment
            .status
            .as_ref()
            .and_then(|status| status.available_replicas)
            .unwrap_or(0);

        if network
            .status
            .as_ref()
            .is_some_and(|status| status.available_replicas == available)
        {
            debug!(network = %network.name_any(), "Status already up to date");
            return Ok(());
        }

        let mut updated = network.clone();
        updated.status = Some(NetworkStatus {
            available_replicas: available,
            last_reconciled: Some(Utc::now()),
        });
        self.cluster.update_network_status(&updated).await
    }
}

/// The controlling owner reference must name this Network by kind,
/// name and UID; compared by value, never adopted on a partial match.
fn is_controlled_by(deployment: &Deployment, network: &Network) -> bool {
    deployment
        .owner_references()
        .iter()
        .find(|reference| reference.controller == Some(true))
        .is_some_and(|owner| {
            owner.kind == "Network"
                && Some(owner.name.as_str()) == network.metadata.name.as_deref()
                && Some(owner.uid.as_str()) == network.metadata.uid.as_deref()
        })
}

/// Desired Deployment for a Network: derived name, controller owner
/// reference and the declared replica count over a fixed nginx pod
/// template.
pub fn build_deployment(network: &Network) -> Deployment {
    let labels: BTreeMap<String, String> = [
        ("app".to_string(), "network-controller".to_string()),
        ("controller".to_string(), network.name_any()),
    ]
    .into();

    Deployment {
        metadata: ObjectMeta {
            name: Some(network.spec.deployment_name.clone()),
            namespace: network.namespace(),
            labels: Some(labels.clone()),
            owner_references: network.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: network.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx-network-controller".to_string(),
                        image: Some("nginx:latest".to_string()),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}
