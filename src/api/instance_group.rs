//! Instance group types
//!
//! An instance group is a set of identically-configured instances: the
//! masters in one zone, the fleet of nodes, or a bastion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A named group of instances with a common configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    /// Instance group name, unique within the cluster
    pub name: String,

    /// The instance group specification
    pub spec: InstanceGroupSpec,
}

/// The role instances in a group fulfil
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum InstanceGroupRole {
    /// Control-plane instances
    Master,
    /// Worker instances
    #[default]
    Node,
    /// Bastion host fronting private subnets
    Bastion,
}

impl InstanceGroupRole {
    /// All roles, for validation messages
    pub const ALL: [InstanceGroupRole; 3] = [
        InstanceGroupRole::Master,
        InstanceGroupRole::Node,
        InstanceGroupRole::Bastion,
    ];
}

/// Specification for an instance group
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupSpec {
    /// Role of the instances in this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<InstanceGroupRole>,

    /// Machine image; defaulted from the channel when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Minimum group size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<i32>,

    /// Maximum group size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i32>,

    /// Cloud machine type; defaulted from the role and zone when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,

    /// Root volume size in GB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume_size: Option<i32>,

    /// Root volume type (e.g. `gp2`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume_type: Option<String>,

    /// Names of the cluster subnets this group spans; all cluster subnets
    /// when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,

    /// Spot max price; on-demand instances when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<String>,

    /// Whether instances receive a public IP
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "associatePublicIp")]
    pub associate_public_ip: Option<bool>,

    /// Cloud-level labels (tags) for instances in this group
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cloud_labels: BTreeMap<String, String>,

    /// Kubernetes node labels for instances in this group
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
}

impl InstanceGroup {
    /// The group's role; `Node` when unset
    pub fn role(&self) -> InstanceGroupRole {
        self.spec.role.unwrap_or_default()
    }

    /// True for master groups
    pub fn is_master(&self) -> bool {
        self.role() == InstanceGroupRole::Master
    }

    /// True for bastion groups
    pub fn is_bastion(&self) -> bool {
        self.role() == InstanceGroupRole::Bastion
    }

    /// Validate the instance group in isolation
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::required_field("Name"));
        }
        if self.spec.role.is_none() {
            return Err(Error::required_field(format!(
                "Role (one of {:?}) on instance group {}",
                InstanceGroupRole::ALL,
                self.name
            )));
        }
        if let (Some(min), Some(max)) = (self.spec.min_size, self.spec.max_size) {
            if min > max {
                return Err(Error::validation(
                    format!("instanceGroup[{}].minSize", self.name),
                    format!("minSize {min} exceeds maxSize {max}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_group() -> InstanceGroup {
        InstanceGroup {
            name: "nodes".to_string(),
            spec: InstanceGroupSpec {
                role: Some(InstanceGroupRole::Node),
                subnets: vec!["us-test-1a".to_string()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_validate_requires_name() {
        let mut group = node_group();
        group.name = String::new();
        let err = group.validate().unwrap_err();
        assert!(err.to_string().contains("Name"));
    }

    #[test]
    fn test_validate_requires_role() {
        let mut group = node_group();
        group.spec.role = None;
        let err = group.validate().unwrap_err();
        assert!(err.to_string().contains("Role"));
    }

    #[test]
    fn test_validate_rejects_inverted_sizes() {
        let mut group = node_group();
        group.spec.min_size = Some(5);
        group.spec.max_size = Some(2);
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_role_helpers() {
        let mut group = node_group();
        assert!(!group.is_master());
        group.spec.role = Some(InstanceGroupRole::Master);
        assert!(group.is_master());
        group.spec.role = Some(InstanceGroupRole::Bastion);
        assert!(group.is_bastion());
    }
}
