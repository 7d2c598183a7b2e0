//! Change feed consumption and enqueue logic.
//!
//! Watch events for Networks and their managed Deployments are
//! adapted into a closed set of notifications, each mapped to an
//! explicit enqueue rule:
//!
//! - Network add/update enqueues its own key unconditionally (the
//!   reconciler is level-triggered and tolerates redundant passes);
//! - Deployment add/update/delete is resolved to the owning Network
//!   through the cache; orphans are dropped, not retried;
//! - Deployment updates that did not change the resource version are
//!   discarded before they reach the queue;
//! - Deployments that vanished while the watch was desynced are
//!   surfaced as deletions when the relist completes, so the owning
//!   Network still gets a pass.

use crate::error::ControllerError;
use crate::queue::{ObjectKey, RateLimitingQueue};
use crds::Network;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::{self, Store};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

/// A change feed notification after classification.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A Network appeared (including on the initial listing)
    NetworkAdded(Arc<Network>),
    /// A Network changed
    NetworkUpdated(Arc<Network>),
    /// A Deployment appeared
    DeploymentAdded(Arc<Deployment>),
    /// A Deployment changed (resource version verified to differ)
    DeploymentUpdated(Arc<Deployment>),
    /// A Deployment disappeared
    DeploymentDeleted(Arc<Deployment>),
}

/// Last-seen resource versions, used to split applies into add versus
/// update and to drop no-change redeliveries.
#[derive(Debug, Default)]
struct SeenVersions {
    versions: HashMap<ObjectKey, String>,
}

enum Observation {
    Added,
    Updated,
    Unchanged,
}

impl SeenVersions {
    fn observe(&mut self, key: ObjectKey, version: String) -> Observation {
        match self.versions.insert(key, version.clone()) {
            None => Observation::Added,
            Some(previous) if previous == version => Observation::Unchanged,
            Some(_) => Observation::Updated,
        }
    }

    fn forget(&mut self, key: &ObjectKey) {
        self.versions.remove(key);
    }
}

fn object_key<K: ResourceExt>(object: &K) -> ObjectKey {
    ObjectKey::new(object.namespace().unwrap_or_default(), object.name_any())
}

fn classify_network(seen: &mut SeenVersions, event: watcher::Event<Network>) -> Option<Notification> {
    match event {
        watcher::Event::Apply(network) | watcher::Event::InitApply(network) => {
            let key = object_key(&network);
            let version = network.resource_version().unwrap_or_default();
            let network = Arc::new(network);
            match seen.observe(key, version) {
                Observation::Added => Some(Notification::NetworkAdded(network)),
                // Unchanged Networks still enqueue: redundant reconciles
                // are harmless and re-lists double as a full resync
                Observation::Updated | Observation::Unchanged => {
                    Some(Notification::NetworkUpdated(network))
                }
            }
        }
        watcher::Event::Delete(network) => {
            seen.forget(&object_key(&network));
            None
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Last-seen Deployments. Beyond the add/update split and the
/// no-change discard, the retained objects let a relist surface
/// deletions that happened while the watch was desynced: anything
/// known before the relist but absent from it is gone.
#[derive(Debug, Default)]
struct DeploymentTracker {
    seen: HashMap<ObjectKey, Arc<Deployment>>,
    relisted: Option<HashSet<ObjectKey>>,
}

impl DeploymentTracker {
    fn observe(&mut self, deployment: Deployment) -> Option<Notification> {
        let key = object_key(&deployment);
        let version = deployment.resource_version().unwrap_or_default();
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.insert(key.clone());
        }
        let deployment = Arc::new(deployment);
        match self.seen.insert(key, Arc::clone(&deployment)) {
            None => Some(Notification::DeploymentAdded(deployment)),
            Some(previous) if previous.resource_version().unwrap_or_default() == version => {
                debug!(
                    deployment = %deployment.name_any(),
                    "Discarding no-change Deployment notification"
                );
                None
            }
            Some(_) => Some(Notification::DeploymentUpdated(deployment)),
        }
    }

    fn delete(&mut self, deployment: Deployment) -> Notification {
        self.seen.remove(&object_key(&deployment));
        Notification::DeploymentDeleted(Arc::new(deployment))
    }

    fn begin_relist(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    /// Deployments the relist never mentioned were deleted while the
    /// watch was desynced; their last-seen state stands in for the
    /// final object.
    fn finish_relist(&mut self) -> Vec<Notification> {
        let Some(relisted) = self.relisted.take() else {
            return Vec::new();
        };
        let vanished: Vec<ObjectKey> = self
            .seen
            .keys()
            .filter(|key| !relisted.contains(key))
            .cloned()
            .collect();
        vanished
            .into_iter()
            .filter_map(|key| self.seen.remove(&key))
            .map(Notification::DeploymentDeleted)
            .collect()
    }
}

fn classify_deployment(
    tracker: &mut DeploymentTracker,
    event: watcher::Event<Deployment>,
) -> Vec<Notification> {
    match event {
        watcher::Event::Apply(deployment) | watcher::Event::InitApply(deployment) => {
            tracker.observe(deployment).into_iter().collect()
        }
        watcher::Event::Delete(deployment) => vec![tracker.delete(deployment)],
        watcher::Event::Init => {
            tracker.begin_relist();
            Vec::new()
        }
        watcher::Event::InitDone => tracker.finish_relist(),
    }
}

/// Translates notifications into work queue insertions.
pub struct Enqueuer {
    queue: Arc<RateLimitingQueue<ObjectKey>>,
    networks: Store<Network>,
}

impl Enqueuer {
    /// Create an enqueuer resolving owners through the Network cache.
    #[must_use]
    pub fn new(queue: Arc<RateLimitingQueue<ObjectKey>>, networks: Store<Network>) -> Self {
        Self { queue, networks }
    }

    /// Apply the enqueue rule for one notification.
    pub fn handle(&self, notification: Notification) {
        match notification {
            Notification::NetworkAdded(network) | Notification::NetworkUpdated(network) => {
                self.enqueue_network(&network);
            }
            Notification::DeploymentAdded(deployment)
            | Notification::DeploymentUpdated(deployment)
            | Notification::DeploymentDeleted(deployment) => {
                self.enqueue_owner(&deployment);
            }
        }
    }

    fn enqueue_network(&self, network: &Network) {
        let key = object_key(network);
        debug!(%key, "Enqueueing Network");
        self.queue.add(key);
    }

    /// Resolves a Deployment change to its owning Network, dropping
    /// orphans whose owner no longer exists.
    fn enqueue_owner(&self, deployment: &Deployment) {
        let Some(owner) = deployment
            .owner_references()
            .iter()
            .find(|reference| reference.controller == Some(true))
        else {
            return;
        };
        if owner.kind != "Network" {
            return;
        }

        let namespace = deployment.namespace().unwrap_or_default();
        let lookup = reflector::ObjectRef::new(&owner.name).within(&namespace);
        if self.networks.get(&lookup).is_none() {
            debug!(
                deployment = %deployment.name_any(),
                network = %owner.name,
                "Ignoring orphaned Deployment; owning Network no longer exists"
            );
            return;
        }

        let key = ObjectKey::new(namespace, owner.name.clone());
        debug!(%key, deployment = %deployment.name_any(), "Enqueueing owning Network");
        self.queue.add(key);
    }
}

/// Watches Networks, feeding the cache and the work queue.
pub async fn watch_networks(
    api: Api<Network>,
    writer: reflector::store::Writer<Network>,
    enqueuer: Arc<Enqueuer>,
) -> Result<(), ControllerError> {
    let mut seen = SeenVersions::default();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
    let mut stream = std::pin::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let Some(notification) = classify_network(&mut seen, event) {
                    enqueuer.handle(notification);
                }
            }
            Err(e) => error!(error = %e, "Network watch error"),
        }
    }
    Err(ControllerError::Watch("Network watch stream ended".to_string()))
}

/// Watches Deployments, feeding the cache and the work queue via the
/// ownership back-reference.
pub async fn watch_deployments(
    api: Api<Deployment>,
    writer: reflector::store::Writer<Deployment>,
    enqueuer: Arc<Enqueuer>,
) -> Result<(), ControllerError> {
    let mut tracker = DeploymentTracker::default();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
    let mut stream = std::pin::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                for notification in classify_deployment(&mut tracker, event) {
                    enqueuer.handle(notification);
                }
            }
            Err(e) => error!(error = %e, "Deployment watch error"),
        }
    }
    Err(ControllerError::Watch("Deployment watch stream ended".to_string()))
}
