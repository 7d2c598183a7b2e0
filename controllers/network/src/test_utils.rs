//! Test utilities for unit testing the reconciler.
//!
//! Provides fixture builders and an in-memory `ClusterApi`
//! implementation so reconcile passes run without a live API server.

use crate::cluster::ClusterApi;
use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{Network, NetworkSpec, NetworkStatus};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::ErrorResponse;
use kube_runtime::events::EventType;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Helper to create a test Network
pub fn test_network(
    name: &str,
    namespace: &str,
    deployment_name: &str,
    replicas: Option<i32>,
) -> Network {
    Network {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            ..ObjectMeta::default()
        },
        spec: NetworkSpec {
            deployment_name: deployment_name.to_string(),
            replicas,
            cidr: "10.0.0.0/16".to_string(),
            gateway: "10.0.0.1".to_string(),
        },
        status: None,
    }
}

/// Deployment correctly owned by the given Network, with the given
/// declared and observed replica counts.
pub fn owned_deployment(network: &Network, replicas: Option<i32>, available: i32) -> Deployment {
    let mut deployment = crate::reconciler::build_deployment(network);
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = replicas;
    }
    deployment.status = Some(DeploymentStatus {
        available_replicas: Some(available),
        ..DeploymentStatus::default()
    });
    deployment
}

/// Deployment owned by some other controller entirely.
pub fn foreign_deployment(name: &str, namespace: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps.example.com/v1".to_string(),
                kind: "Widget".to_string(),
                name: "somebody-else".to_string(),
                uid: "uid-foreign".to_string(),
                controller: Some(true),
                ..OwnerReference::default()
            }]),
            ..ObjectMeta::default()
        },
        ..Deployment::default()
    }
}

/// An event recorded against the mock cluster.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// In-memory stand-in for the cluster: caches, typed writes and the
/// event sink, with journals for asserting what a pass did.
#[derive(Default)]
pub struct MockCluster {
    networks: Mutex<HashMap<(String, String), Arc<Network>>>,
    deployments: Mutex<HashMap<(String, String), Arc<Deployment>>>,
    creates: Mutex<Vec<Deployment>>,
    updates: Mutex<Vec<Deployment>>,
    status_writes: Mutex<Vec<Network>>,
    events: Mutex<Vec<RecordedEvent>>,
    fail_next_create: Mutex<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn object_id<K: kube::ResourceExt>(object: &K) -> (String, String) {
    (object.namespace().unwrap_or_default(), object.name_any())
}

fn transient_error(message: &str) -> ControllerError {
    ControllerError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the Network cache.
    pub fn add_network(&self, network: Network) {
        lock(&self.networks).insert(object_id(&network), Arc::new(network));
    }

    /// Seed the Deployment cache.
    pub fn add_deployment(&self, deployment: Deployment) {
        lock(&self.deployments).insert(object_id(&deployment), Arc::new(deployment));
    }

    /// Make the next create call fail with a transient API error.
    pub fn fail_next_create(&self) {
        *lock(&self.fail_next_create) = true;
    }

    pub fn stored_deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        lock(&self.deployments)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn stored_network(&self, namespace: &str, name: &str) -> Option<Arc<Network>> {
        lock(&self.networks)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn creates(&self) -> Vec<Deployment> {
        lock(&self.creates).clone()
    }

    pub fn updates(&self) -> Vec<Deployment> {
        lock(&self.updates).clone()
    }

    pub fn status_writes(&self) -> Vec<Network> {
        lock(&self.status_writes).clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    /// True when the pass performed no create, update or status write.
    pub fn no_writes(&self) -> bool {
        lock(&self.creates).is_empty()
            && lock(&self.updates).is_empty()
            && lock(&self.status_writes).is_empty()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Network>>, ControllerError> {
        Ok(lock(&self.networks)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Deployment>>, ControllerError> {
        Ok(lock(&self.deployments)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        if std::mem::take(&mut *lock(&self.fail_next_create)) {
            return Err(transient_error("injected create failure"));
        }
        lock(&self.creates).push(deployment.clone());
        lock(&self.deployments).insert(object_id(deployment), Arc::new(deployment.clone()));
        Ok(deployment.clone())
    }

    async fn update_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, ControllerError> {
        lock(&self.updates).push(deployment.clone());
        // Replace managed fields but keep the observed status, the way
        // a spec write leaves status untouched on the server
        let id = object_id(deployment);
        let mut stored = deployment.clone();
        if let Some(previous) = lock(&self.deployments).get(&id) {
            stored.status = previous.status.clone();
        }
        lock(&self.deployments).insert(id, Arc::new(stored.clone()));
        Ok(stored)
    }

    async fn update_network_status(&self, network: &Network) -> Result<(), ControllerError> {
        lock(&self.status_writes).push(network.clone());
        let id = object_id(network);
        let mut networks = lock(&self.networks);
        if let Some(previous) = networks.get(&id) {
            // Status-only path: spec stays whatever the cache holds
            let mut stored = (**previous).clone();
            stored.status = network.status.clone();
            networks.insert(id, Arc::new(stored));
        }
        Ok(())
    }

    async fn publish_event(
        &self,
        _network: &Network,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        lock(&self.events).push(RecordedEvent {
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
