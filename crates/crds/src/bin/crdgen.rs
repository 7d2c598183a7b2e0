//! Prints the Network CRD manifest as YAML.
//!
//! Usage: `cargo run --bin crdgen > deploy/crds/network.yaml`

use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&crds::Network::crd())?);
    Ok(())
}
