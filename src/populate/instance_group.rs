//! Instance-group normalization
//!
//! Validates an instance group against the (already normalized) cluster and
//! fills role- and zone-derived defaults.

use tracing::debug;

use crate::api::{parse_kubernetes_version, Channel, Cluster, InstanceGroup, InstanceGroupRole};
use crate::{Error, Result};

/// Complete an instance group against its cluster and channel
///
/// The input group is not modified; the completed copy is returned.
pub fn populate_instance_group_spec(
    cluster: &Cluster,
    group: &InstanceGroup,
    channel: &Channel,
) -> Result<InstanceGroup> {
    group.validate()?;

    let mut full = group.clone();

    // Subnet references must name cluster subnets; a group with none spans
    // all of them.
    if full.spec.subnets.is_empty() {
        full.spec.subnets = cluster.spec.subnets.iter().map(|s| s.name.clone()).collect();
    }
    for subnet_name in &full.spec.subnets {
        if cluster.subnet(subnet_name).is_none() {
            return Err(Error::validation(
                format!("instanceGroup[{}].subnets", full.name),
                format!("subnet {subnet_name:?} is not defined in the cluster"),
            ));
        }
    }

    let role = full.role();

    if full.spec.machine_type.is_none() {
        let machine_type = default_machine_type(cluster, &full, role);
        debug!(group = %full.name, machine_type, "defaulted machine type");
        full.spec.machine_type = Some(machine_type.to_string());
    }

    if full.spec.min_size.is_none() {
        full.spec.min_size = Some(default_size(role));
    }
    if full.spec.max_size.is_none() {
        full.spec.max_size = Some(default_size(role));
    }

    if full.spec.root_volume_size.is_none() {
        full.spec.root_volume_size = match role {
            InstanceGroupRole::Master => channel.master_root_volume_size,
            InstanceGroupRole::Node | InstanceGroupRole::Bastion => channel.node_root_volume_size,
        };
    }
    if full.spec.root_volume_type.is_none() {
        full.spec.root_volume_type = channel.root_volume_type.clone();
    }

    if full.spec.image.is_none() {
        let version_str = cluster
            .spec
            .kubernetes_version
            .as_deref()
            .ok_or_else(|| Error::required_field("spec.kubernetesVersion"))?;
        if let Ok(version) = parse_kubernetes_version(version_str) {
            let image = channel.find_image("aws", &version)?;
            full.spec.image = Some(image.name.clone());
        }
    }

    Ok(full)
}

/// Default machine type for a role, keyed on the group's zone
///
/// The older generations are not available in every region; zones in
/// regions without them get the closest current-generation type.
fn default_machine_type(cluster: &Cluster, group: &InstanceGroup, role: InstanceGroupRole) -> &'static str {
    match role {
        InstanceGroupRole::Master => {
            let zone = group
                .spec
                .subnets
                .first()
                .and_then(|name| cluster.subnet(name))
                .map(|s| s.zone.as_str())
                .or_else(|| cluster.spec.subnets.first().map(|s| s.zone.as_str()))
                .unwrap_or("");
            if zone.starts_with("us-east-2") {
                "c4.large"
            } else {
                "m3.medium"
            }
        }
        InstanceGroupRole::Node => "t2.medium",
        InstanceGroupRole::Bastion => "t2.micro",
    }
}

fn default_size(role: InstanceGroupRole) -> i32 {
    match role {
        InstanceGroupRole::Master | InstanceGroupRole::Bastion => 1,
        InstanceGroupRole::Node => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterSpec, InstanceGroupSpec, SubnetSpec, SubnetType};

    fn cluster_in_zone(zone: &str) -> Cluster {
        Cluster {
            name: "test.example.com".to_string(),
            spec: ClusterSpec {
                kubernetes_version: Some("1.4.8".to_string()),
                subnets: vec![SubnetSpec {
                    name: zone.to_string(),
                    zone: zone.to_string(),
                    cidr: Some("172.20.32.0/19".to_string()),
                    subnet_type: SubnetType::Public,
                }],
                ..Default::default()
            },
        }
    }

    fn group(name: &str, role: InstanceGroupRole, subnets: &[&str]) -> InstanceGroup {
        InstanceGroup {
            name: name.to_string(),
            spec: InstanceGroupSpec {
                role: Some(role),
                subnets: subnets.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_name_required() {
        let cluster = cluster_in_zone("us-test-1a");
        let mut g = group("nodes", InstanceGroupRole::Node, &[]);
        g.name = String::new();

        let err = populate_instance_group_spec(&cluster, &g, &Channel::stable()).unwrap_err();
        assert!(err.to_string().contains("Name"));
    }

    #[test]
    fn test_role_required() {
        let cluster = cluster_in_zone("us-test-1a");
        let mut g = group("nodes", InstanceGroupRole::Node, &[]);
        g.spec.role = None;

        let err = populate_instance_group_spec(&cluster, &g, &Channel::stable()).unwrap_err();
        assert!(err.to_string().contains("Role"));
    }

    #[test]
    fn test_unknown_subnet_rejected() {
        let cluster = cluster_in_zone("us-test-1a");
        let g = group("nodes", InstanceGroupRole::Node, &["nope"]);

        let err = populate_instance_group_spec(&cluster, &g, &Channel::stable()).unwrap_err();
        assert!(err.to_string().contains("not defined in the cluster"));
    }

    #[test]
    fn test_empty_subnets_default_to_all() {
        let cluster = cluster_in_zone("us-test-1a");
        let g = group("nodes", InstanceGroupRole::Node, &[]);

        let full = populate_instance_group_spec(&cluster, &g, &Channel::stable()).unwrap();
        assert_eq!(full.spec.subnets, vec!["us-test-1a".to_string()]);
    }

    #[test]
    fn test_default_master_machine_type_by_zone() {
        let tests = [
            ("us-east-1b", "m3.medium"),
            ("us-east-2b", "c4.large"),
            ("eu-west-1b", "m3.medium"),
        ];
        for (zone, expected) in tests {
            let cluster = cluster_in_zone(zone);
            let g = group("master", InstanceGroupRole::Master, &[zone]);
            let full = populate_instance_group_spec(&cluster, &g, &Channel::stable()).unwrap();
            assert_eq!(
                full.spec.machine_type.as_deref(),
                Some(expected),
                "zone {zone}"
            );
        }
    }

    #[test]
    fn test_sizes_default_by_role() {
        let cluster = cluster_in_zone("us-test-1a");

        let master = populate_instance_group_spec(
            &cluster,
            &group("master", InstanceGroupRole::Master, &[]),
            &Channel::stable(),
        )
        .unwrap();
        assert_eq!(master.spec.min_size, Some(1));
        assert_eq!(master.spec.max_size, Some(1));

        let nodes = populate_instance_group_spec(
            &cluster,
            &group("nodes", InstanceGroupRole::Node, &[]),
            &Channel::stable(),
        )
        .unwrap();
        assert_eq!(nodes.spec.min_size, Some(2));
        assert_eq!(nodes.spec.max_size, Some(2));
    }

    #[test]
    fn test_image_and_volume_defaults_come_from_channel() {
        let cluster = cluster_in_zone("us-test-1a");
        let full = populate_instance_group_spec(
            &cluster,
            &group("nodes", InstanceGroupRole::Node, &[]),
            &Channel::stable(),
        )
        .unwrap();
        assert_eq!(
            full.spec.image.as_deref(),
            Some("k8s-1.4-debian-jessie-amd64-hvm-ebs-2016-10-21")
        );
        assert_eq!(full.spec.root_volume_size, Some(20));
        assert_eq!(full.spec.root_volume_type.as_deref(), Some("gp2"));
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let cluster = cluster_in_zone("us-test-1a");
        let mut g = group("nodes", InstanceGroupRole::Node, &[]);
        g.spec.machine_type = Some("m4.xlarge".to_string());
        g.spec.min_size = Some(3);

        let full = populate_instance_group_spec(&cluster, &g, &Channel::stable()).unwrap();
        assert_eq!(full.spec.machine_type.as_deref(), Some("m4.xlarge"));
        assert_eq!(full.spec.min_size, Some(3));
    }
}
