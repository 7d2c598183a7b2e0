//! Controller-specific error types.
//!
//! Reconcile-level errors are local to one work item and drive the
//! requeue policy; only startup failures (configuration, cache sync)
//! are fatal to the process.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Network controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error (transient; requeued with backoff)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// A Deployment with the derived name exists but is owned by
    /// someone else (requeued; the collision needs operator action)
    #[error("resource {0:?} already exists and is not managed by Network")]
    ResourceExists(String),

    /// Initial cache population did not complete (fatal at startup)
    #[error("cache sync failed: {0}")]
    CacheSync(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization failure while building an API payload
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
