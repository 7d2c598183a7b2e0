//! Network CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Network controller.

pub mod network;

pub use network::*;
