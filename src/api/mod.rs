//! Canonical cluster model
//!
//! The internal, canonical representation of a cluster and its instance
//! groups. User documents are loaded into these types before normalization;
//! the completed spec written back to the config store uses the same types.
//!
//! Versioned external schemas are out of scope here: loaders up-convert to
//! this model before anything else runs.

mod channel;
mod cluster;
mod instance_group;

pub use channel::{Channel, ChannelImageSpec};
pub use cluster::{
    Cluster, ClusterSpec, DockerConfig, EtcdClusterSpec, EtcdMemberSpec, KubeApiServerConfig,
    KubeControllerManagerConfig, KubeDnsConfig, NetworkingSpec, SubnetSpec, SubnetType, Topology,
    TopologyMode,
};
pub use instance_group::{InstanceGroup, InstanceGroupRole, InstanceGroupSpec};

use crate::{Error, Result};

/// Parse a kubernetes version string into a semantic version
///
/// Accepts an optional leading `v` (the normalizer strips it, but raw user
/// input may still carry one).
pub fn parse_kubernetes_version(version: &str) -> Result<semver::Version> {
    let trimmed = version.trim().trim_start_matches('v');
    semver::Version::parse(trimmed)
        .map_err(|e| Error::validation("spec.kubernetesVersion", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kubernetes_version() {
        let v = parse_kubernetes_version("1.4.8").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 4, 8));

        let v = parse_kubernetes_version("v1.5.1").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 5, 1));

        assert!(parse_kubernetes_version("not-a-version").is_err());
    }
}
