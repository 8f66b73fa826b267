//! Task graph construction
//!
//! Translates a completed cluster spec and its instance groups into the
//! task graph the reconciler drives. Each builder covers one concern and
//! only reads the normalized spec; nothing here talks to the cloud.

mod api_access;
mod autoscaling;
mod firewall;
mod iam;
mod network;

use crate::api::{Cluster, InstanceGroup, InstanceGroupRole};
use crate::task::TaskGraph;
use crate::Result;

/// Inputs shared by every task builder
pub struct ModelContext<'a> {
    /// The completed cluster
    pub cluster: &'a Cluster,
    /// The completed instance groups
    pub instance_groups: &'a [InstanceGroup],
    /// The admin SSH public key to import
    pub ssh_public_key: &'a str,
}

impl<'a> ModelContext<'a> {
    /// Build the full task graph for the cluster
    pub fn build_task_graph(&self) -> Result<TaskGraph> {
        let mut graph = TaskGraph::new();
        network::build(self, &mut graph)?;
        firewall::build(self, &mut graph)?;
        iam::build(self, &mut graph)?;
        autoscaling::build(self, &mut graph)?;
        api_access::build(self, &mut graph)?;
        Ok(graph)
    }

    /// True when any bastion instance group exists
    pub fn has_bastion(&self) -> bool {
        self.instance_groups.iter().any(|g| g.is_bastion())
    }

    /// Whether the API sits behind a load balancer (private masters)
    pub fn api_uses_load_balancer(&self) -> bool {
        self.cluster.spec.topology.masters == crate::api::TopologyMode::Private
    }

    /// The security group name for a role
    pub fn security_group_name(&self, role: InstanceGroupRole) -> String {
        match role {
            InstanceGroupRole::Master => format!("masters.{}", self.cluster.name),
            InstanceGroupRole::Node => format!("nodes.{}", self.cluster.name),
            InstanceGroupRole::Bastion => format!("bastion.{}", self.cluster.name),
        }
    }

    /// The IAM role name for a role
    pub fn iam_role_name(&self, role: InstanceGroupRole) -> String {
        match role {
            InstanceGroupRole::Master => format!("masters.{}", self.cluster.name),
            InstanceGroupRole::Node => format!("nodes.{}", self.cluster.name),
            InstanceGroupRole::Bastion => format!("bastions.{}", self.cluster.name),
        }
    }

    /// The launch configuration / autoscaling group name for an instance
    /// group
    pub fn group_resource_name(&self, group: &InstanceGroup) -> String {
        match group.role() {
            InstanceGroupRole::Master => {
                format!("{}.masters.{}", group.name, self.cluster.name)
            }
            InstanceGroupRole::Bastion => format!("bastions.{}", self.cluster.name),
            InstanceGroupRole::Node => format!("{}.{}", group.name, self.cluster.name),
        }
    }

    /// The CIDRs allowed to reach SSH, defaulting to everywhere
    pub fn ssh_access(&self) -> Vec<String> {
        if self.cluster.spec.ssh_access.is_empty() {
            vec!["0.0.0.0/0".to_string()]
        } else {
            self.cluster.spec.ssh_access.clone()
        }
    }

    /// The CIDRs allowed to reach the API, defaulting to everywhere
    pub fn api_access(&self) -> Vec<String> {
        if self.cluster.spec.api_access.is_empty() {
            vec!["0.0.0.0/0".to_string()]
        } else {
            self.cluster.spec.api_access.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ClusterSpec, InstanceGroupSpec, SubnetSpec, SubnetType, Topology, TopologyMode,
    };
    use crate::task::TaskKind;

    pub(crate) const TEST_SSH_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQCtWu40XQo8dczLsCq0OWV+hxm9uV3WxeH9Kgh4sMzQxNtoU1pvW0Xdjpk test@example.com";

    fn subnet(name: &str, zone: &str, cidr: &str, subnet_type: SubnetType) -> SubnetSpec {
        SubnetSpec {
            name: name.to_string(),
            zone: zone.to_string(),
            cidr: Some(cidr.to_string()),
            subnet_type,
        }
    }

    fn group(name: &str, role: InstanceGroupRole, subnets: &[&str]) -> InstanceGroup {
        InstanceGroup {
            name: name.to_string(),
            spec: InstanceGroupSpec {
                role: Some(role),
                machine_type: Some("m3.medium".to_string()),
                min_size: Some(1),
                max_size: Some(1),
                image: Some("k8s-1.4-debian-jessie-amd64-hvm-ebs-2016-10-21".to_string()),
                subnets: subnets.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    pub(crate) fn public_cluster() -> (Cluster, Vec<InstanceGroup>) {
        let cluster = Cluster {
            name: "minimal.example.com".to_string(),
            spec: ClusterSpec {
                cloud_provider: Some("aws".to_string()),
                kubernetes_version: Some("1.4.8".to_string()),
                network_cidr: Some("172.20.0.0/16".to_string()),
                config_base: Some("memfs://tests/minimal.example.com".to_string()),
                config_store: Some("memfs://tests/minimal.example.com".to_string()),
                master_public_name: Some("api.minimal.example.com".to_string()),
                dns_zone: Some("example.com".to_string()),
                subnets: vec![subnet(
                    "us-test-1a",
                    "us-test-1a",
                    "172.20.32.0/19",
                    SubnetType::Public,
                )],
                ..Default::default()
            },
        };
        let groups = vec![
            group("master-us-test-1a", InstanceGroupRole::Master, &["us-test-1a"]),
            group("nodes", InstanceGroupRole::Node, &["us-test-1a"]),
        ];
        (cluster, groups)
    }

    pub(crate) fn private_cluster() -> (Cluster, Vec<InstanceGroup>) {
        let (mut cluster, mut groups) = public_cluster();
        cluster.name = "privateweave.example.com".to_string();
        cluster.spec.master_public_name = Some("api.privateweave.example.com".to_string());
        cluster.spec.topology = Topology {
            masters: TopologyMode::Private,
            nodes: TopologyMode::Private,
        };
        cluster.spec.subnets = vec![
            subnet("us-test-1a", "us-test-1a", "172.20.32.0/19", SubnetType::Private),
            subnet(
                "utility-us-test-1a",
                "us-test-1a",
                "172.20.4.0/22",
                SubnetType::Utility,
            ),
        ];
        groups.push(group(
            "bastion",
            InstanceGroupRole::Bastion,
            &["utility-us-test-1a"],
        ));
        (cluster, groups)
    }

    #[test]
    fn test_public_cluster_has_no_load_balancer() {
        let (cluster, groups) = public_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let graph = model.build_task_graph().unwrap();

        assert!(graph.get(TaskKind::Vpc, "minimal.example.com").is_some());
        assert!(graph.get(TaskKind::Subnet, "us-test-1a").is_some());
        assert!(!graph.iter().any(|t| t.kind() == TaskKind::LoadBalancer));
        assert!(!graph.iter().any(|t| t.kind() == TaskKind::DnsRecord));
    }

    #[test]
    fn test_private_cluster_gets_elb_bastion_and_record() {
        let (cluster, groups) = private_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let graph = model.build_task_graph().unwrap();

        assert!(graph
            .get(TaskKind::LoadBalancer, "api.privateweave.example.com")
            .is_some());
        assert!(graph
            .get(TaskKind::DnsRecord, "api.privateweave.example.com")
            .is_some());
        assert!(graph
            .get(TaskKind::SecurityGroup, "bastion.privateweave.example.com")
            .is_some());
        assert!(graph
            .get(TaskKind::IamRole, "bastions.privateweave.example.com")
            .is_some());
    }

    #[test]
    fn test_graph_is_topologically_orderable() {
        for (cluster, groups) in [public_cluster(), private_cluster()] {
            let model = ModelContext {
                cluster: &cluster,
                instance_groups: &groups,
                ssh_public_key: TEST_SSH_KEY,
            };
            let graph = model.build_task_graph().unwrap();
            // Every reference resolves and the graph is acyclic.
            let order = graph.topological_order().unwrap();
            assert_eq!(order.len(), graph.len());
        }
    }

    #[test]
    fn test_group_resource_names() {
        let (cluster, groups) = private_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        assert_eq!(
            model.group_resource_name(&groups[0]),
            "master-us-test-1a.masters.privateweave.example.com"
        );
        assert_eq!(
            model.group_resource_name(&groups[1]),
            "nodes.privateweave.example.com"
        );
        assert_eq!(
            model.group_resource_name(&groups[2]),
            "bastions.privateweave.example.com"
        );
    }
}
