//! Network CRD
//!
//! Declares a replicated workload managed on the user's behalf. The
//! controller keeps a Deployment named by `deploymentName` in sync with
//! this spec and mirrors the observed replica count back into status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "samplecrd.k8s.io",
    version = "v1",
    kind = "Network",
    namespaced,
    status = "NetworkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Name of the Deployment this Network manages.
    ///
    /// The Deployment is created in the Network's namespace under this
    /// exact name. An empty value is a permanent spec error and the
    /// resource is skipped until the field is filled in.
    pub deployment_name: String,

    /// Desired replica count for the managed Deployment.
    ///
    /// When absent the controller leaves the Deployment's replica
    /// count untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Network CIDR (opaque to the reconcile algorithm)
    #[serde(default)]
    pub cidr: String,

    /// Gateway address (opaque to the reconcile algorithm)
    #[serde(default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Replicas of the managed Deployment observed as available
    pub available_replicas: i32,

    /// Last successful reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_spec_round_trips_camel_case() {
        let raw = r#"{"deploymentName":"net1","replicas":3,"cidr":"10.0.0.0/16","gateway":"10.0.0.1"}"#;
        let spec: NetworkSpec = serde_json::from_str(raw).expect("valid spec json");
        assert_eq!(spec.deployment_name, "net1");
        assert_eq!(spec.replicas, Some(3));

        let out = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(out["deploymentName"], "net1");
        assert_eq!(out["replicas"], 3);
    }

    #[test]
    fn replicas_absent_means_unmanaged() {
        let raw = r#"{"deploymentName":"net1"}"#;
        let spec: NetworkSpec = serde_json::from_str(raw).expect("valid spec json");
        assert_eq!(spec.replicas, None);

        let out = serde_json::to_value(&spec).expect("serialize");
        assert!(out.get("replicas").is_none(), "absent replicas must not serialize");
    }
}
