//! Instance fleet tasks: key pair, launch configurations, scaling groups
//!
//! One launch configuration and auto-scaling group per instance group.
//! Masters and nodes boot with generated user data; bastions are plain
//! SSH relays and boot with none.

use std::collections::BTreeMap;

use crate::api::{InstanceGroup, InstanceGroupRole};
use crate::cloud::TAG_CLUSTER;
use crate::options::cloud_tags_for_instance_group;
use crate::task::{AutoscalingGroup, KeyPair, LaunchConfiguration, Task, TaskGraph};
use crate::Result;

use super::ModelContext;

pub fn build(model: &ModelContext<'_>, graph: &mut TaskGraph) -> Result<()> {
    let key_name = KeyPair::name_for(&model.cluster.name, model.ssh_public_key);
    graph.insert(Task::KeyPair(KeyPair {
        name: key_name.clone(),
        public_key: Some(model.ssh_public_key.to_string()),
        fingerprint: None,
    }))?;

    for group in model.instance_groups {
        let role = group.role();
        let resource_name = model.group_resource_name(group);

        graph.insert(Task::LaunchConfiguration(LaunchConfiguration {
            name: resource_name.clone(),
            image: group.spec.image.clone(),
            image_id: None,
            instance_type: group.spec.machine_type.clone(),
            ssh_key: Some(key_name.clone()),
            iam_instance_profile: Some(model.iam_role_name(role)),
            security_groups: vec![model.security_group_name(role)],
            associate_public_ip: Some(associate_public_ip(model, group)),
            user_data: user_data(model, group),
            root_volume_size: group.spec.root_volume_size.map(i64::from),
            root_volume_type: group.spec.root_volume_type.clone(),
            spot_price: group.spec.max_price.clone(),
        }))?;

        graph.insert(Task::AutoscalingGroup(AutoscalingGroup {
            name: resource_name.clone(),
            launch_configuration: resource_name.clone(),
            min_size: group.spec.min_size.map(i64::from),
            max_size: group.spec.max_size.map(i64::from),
            subnets: group.spec.subnets.clone(),
            tags: instance_tags(model, group),
        }))?;
    }

    Ok(())
}

fn associate_public_ip(model: &ModelContext<'_>, group: &InstanceGroup) -> bool {
    if let Some(explicit) = group.spec.associate_public_ip {
        return explicit;
    }
    // Instances on private subnets never get a public address; everything
    // else does by default.
    match group.role() {
        InstanceGroupRole::Bastion => true,
        InstanceGroupRole::Master => {
            model.cluster.spec.topology.masters == crate::api::TopologyMode::Public
        }
        InstanceGroupRole::Node => {
            model.cluster.spec.topology.nodes == crate::api::TopologyMode::Public
        }
    }
}

/// The boot script for an instance group
///
/// Bastions run stock images and get no user data at all. Masters and
/// nodes get the bootstrap script that fetches the completed cluster spec
/// from the config store and hands off to the node provisioner.
fn user_data(model: &ModelContext<'_>, group: &InstanceGroup) -> Option<String> {
    if group.is_bastion() {
        return None;
    }
    let config_store = model.cluster.spec.config_store.as_deref().unwrap_or_default();
    let role = match group.role() {
        InstanceGroupRole::Master => "master",
        InstanceGroupRole::Node => "node",
        InstanceGroupRole::Bastion => unreachable!("bastions have no user data"),
    };
    let mut script = String::from("#!/bin/bash\nset -o errexit -o nounset -o pipefail\n\n");
    script.push_str(&format!("CLUSTER_NAME={}\n", model.cluster.name));
    script.push_str(&format!("CONFIG_STORE={config_store}\n"));
    script.push_str(&format!("INSTANCE_GROUP={}\n", group.name));
    script.push_str(&format!("NODE_ROLE={role}\n\n"));
    script.push_str(
        "exec /opt/kubernetes/bootstrap --cluster=\"${CLUSTER_NAME}\" --config-store=\"${CONFIG_STORE}\" --instance-group=\"${INSTANCE_GROUP}\" --role=\"${NODE_ROLE}\"\n",
    );
    Some(script)
}

fn instance_tags(model: &ModelContext<'_>, group: &InstanceGroup) -> BTreeMap<String, String> {
    let mut tags = cloud_tags_for_instance_group(model.cluster, group);
    tags.insert(
        "Name".to_string(),
        model.group_resource_name(group),
    );
    tags.insert(TAG_CLUSTER.to_string(), model.cluster.name.clone());
    tags.insert(
        format!(
            "k8s.io/role/{}",
            match group.role() {
                InstanceGroupRole::Master => "master",
                InstanceGroupRole::Node => "node",
                InstanceGroupRole::Bastion => "bastion",
            }
        ),
        "1".to_string(),
    );
    tags
}

#[cfg(test)]
mod tests {
    use super::super::tests::{private_cluster, public_cluster, TEST_SSH_KEY};
    use super::*;
    use crate::task::{TaskKind, TaskPayload};

    fn build_graph(cluster: &crate::api::Cluster, groups: &[InstanceGroup]) -> TaskGraph {
        let model = ModelContext {
            cluster,
            instance_groups: groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        build(&model, &mut graph).unwrap();
        graph
    }

    #[test]
    fn test_master_and_node_get_user_data() {
        let (cluster, groups) = public_cluster();
        let graph = build_graph(&cluster, &groups);

        let lc = graph
            .get(
                TaskKind::LaunchConfiguration,
                "master-us-test-1a.masters.minimal.example.com",
            )
            .unwrap();
        match lc {
            Task::LaunchConfiguration(lc) => {
                let user_data = lc.user_data.as_deref().unwrap();
                assert!(user_data.contains("CLUSTER_NAME=minimal.example.com"));
                assert!(user_data.contains("NODE_ROLE=master"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_bastion_has_no_user_data() {
        let (cluster, groups) = private_cluster();
        let graph = build_graph(&cluster, &groups);

        match graph
            .get(TaskKind::LaunchConfiguration, "bastions.privateweave.example.com")
            .unwrap()
        {
            Task::LaunchConfiguration(lc) => assert!(lc.user_data.is_none()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_private_nodes_get_no_public_ip() {
        let (cluster, groups) = private_cluster();
        let graph = build_graph(&cluster, &groups);

        match graph
            .get(TaskKind::LaunchConfiguration, "nodes.privateweave.example.com")
            .unwrap()
        {
            Task::LaunchConfiguration(lc) => assert_eq!(lc.associate_public_ip, Some(false)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_asg_carries_role_tags() {
        let (cluster, groups) = public_cluster();
        let graph = build_graph(&cluster, &groups);

        match graph
            .get(TaskKind::AutoscalingGroup, "nodes.minimal.example.com")
            .unwrap()
        {
            Task::AutoscalingGroup(asg) => {
                assert_eq!(asg.tags.get("k8s.io/role/node").map(String::as_str), Some("1"));
                assert_eq!(
                    asg.tags.get("KubernetesCluster").map(String::as_str),
                    Some("minimal.example.com")
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_key_pair_dependency_is_declared() {
        let (cluster, groups) = public_cluster();
        let graph = build_graph(&cluster, &groups);
        let key_name = KeyPair::name_for("minimal.example.com", TEST_SSH_KEY);

        match graph
            .get(TaskKind::LaunchConfiguration, "nodes.minimal.example.com")
            .unwrap()
        {
            Task::LaunchConfiguration(lc) => {
                assert!(lc
                    .dependencies()
                    .iter()
                    .any(|d| d.kind == TaskKind::KeyPair && d.name == key_name));
            }
            _ => unreachable!(),
        }
    }
}
