//! Typed API seam.
//!
//! The reconciler reads through the shared caches and writes through
//! the typed API clients; this trait is that boundary, so the
//! convergence algorithm can be unit tested against an in-memory
//! cluster. Not-found on reads is `Ok(None)`, distinguishable from
//! real failures.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::Network;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use kube_runtime::reflector::{ObjectRef, Store};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Field-ownership identity asserted on every write, so concurrent
/// writers on disjoint fields do not conflict destructively.
pub const FIELD_MANAGER: &str = "network-controller";

/// Cluster reads and writes needed by one reconcile pass.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Point lookup of a Network through the cache.
    async fn network(&self, namespace: &str, name: &str)
    -> Result<Option<Arc<Network>>, ControllerError>;

    /// Point lookup of a Deployment through the cache.
    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Deployment>>, ControllerError>;

    /// Create a Deployment, returning the persisted object.
    async fn create_deployment(&self, deployment: &Deployment)
    -> Result<Deployment, ControllerError>;

    /// Replace a Deployment's managed fields (last-writer-wins).
    async fn update_deployment(&self, deployment: &Deployment)
    -> Result<Deployment, ControllerError>;

    /// Persist the Network's status through the status-only write
    /// path; must not touch spec.
    async fn update_network_status(&self, network: &Network) -> Result<(), ControllerError>;

    /// Append an event record for the Network. Fire-and-forget:
    /// delivery failure is logged and never fails reconciliation.
    async fn publish_event(
        &self,
        network: &Network,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

/// Live implementation over the reflector caches and typed clients.
pub struct KubeCluster {
    client: Client,
    networks: Store<Network>,
    deployments: Store<Deployment>,
    recorder: Recorder,
}

impl KubeCluster {
    /// Wire the live cluster seam from a client and the shared caches.
    #[must_use]
    pub fn new(client: Client, networks: Store<Network>, deployments: Store<Deployment>) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: None,
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self {
            client,
            networks,
            deployments,
            recorder,
        }
    }

    fn networks_in(&self, namespace: &str) -> Api<Network> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments_in(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Network>>, ControllerError> {
        Ok(self.networks.get(&ObjectRef::new(name).within(namespace)))
    }

    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Deployment>>, ControllerError> {
        Ok(self.deployments.get(&ObjectRef::new(name).within(namespace)))
    }

    async fn create_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        let namespace = deployment.namespace().unwrap_or_default();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PostParams::default()
        };
        Ok(self
            .deployments_in(&namespace)
            .create(&params, deployment)
            .await?)
    }

    async fn update_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        let namespace = deployment.namespace().unwrap_or_default();
        let name = deployment.name_any();
        // Server-side apply: assert only the fields this controller
        // owns, so a concurrent writer on other fields is untouched
        let mut payload = serde_json::to_value(deployment)?;
        payload["apiVersion"] = json!("apps/v1");
        payload["kind"] = json!("Deployment");
        let params = PatchParams::apply(FIELD_MANAGER).force();
        Ok(self
            .deployments_in(&namespace)
            .patch(&name, &params, &Patch::Apply(&payload))
            .await?)
    }

    async fn update_network_status(&self, network: &Network) -> Result<(), ControllerError> {
        let namespace = network.namespace().unwrap_or_default();
        let name = network.name_any();
        let status = network.status.clone().unwrap_or_default();
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        self.networks_in(&namespace)
            .patch_status(&name, &params, &Patch::Merge(&json!({ "status": status })))
            .await?;
        Ok(())
    }

    async fn publish_event(
        &self,
        network: &Network,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &network.object_ref(&())).await {
            warn!(error = %e, "Failed to record event; continuing");
        }
    }
}
