//! Security groups and rules
//!
//! One group per instance role plus one for the API load balancer when the
//! masters are private. Intra-cluster traffic is open between masters and
//! nodes; external SSH lands on the bastion instead when the topology is
//! private.

use crate::api::InstanceGroupRole;
use crate::cloud::RuleDirection;
use crate::task::{SecurityGroup, SecurityGroupRule, Task, TaskGraph};
use crate::Result;

use super::ModelContext;

/// The security group name fronting the API load balancer
pub fn api_elb_security_group_name(cluster_name: &str) -> String {
    format!("api-elb.{cluster_name}")
}

pub fn build(model: &ModelContext<'_>, graph: &mut TaskGraph) -> Result<()> {
    let cluster = model.cluster;
    let masters = model.security_group_name(InstanceGroupRole::Master);
    let nodes = model.security_group_name(InstanceGroupRole::Node);

    for (name, description) in [
        (&masters, format!("Security group for masters in {}", cluster.name)),
        (&nodes, format!("Security group for nodes in {}", cluster.name)),
    ] {
        graph.insert(Task::SecurityGroup(SecurityGroup {
            name: name.clone(),
            vpc: cluster.name.clone(),
            description: Some(description),
            ..Default::default()
        }))?;
    }

    // Egress is unrestricted for every role.
    for (rule_name, group) in [("master-egress", &masters), ("node-egress", &nodes)] {
        graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
            name: rule_name.to_string(),
            security_group: group.clone(),
            direction: RuleDirection::Egress,
            cidr: Some("0.0.0.0/0".to_string()),
            ..Default::default()
        }))?;
    }

    // Full mesh between the cluster's own roles.
    for (rule_name, from, to) in [
        ("all-master-to-master", &masters, &masters),
        ("all-master-to-node", &masters, &nodes),
        ("all-node-to-node", &nodes, &nodes),
        ("all-node-to-master", &nodes, &masters),
    ] {
        graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
            name: rule_name.to_string(),
            security_group: to.clone(),
            direction: RuleDirection::Ingress,
            source_group: Some(from.clone()),
            ..Default::default()
        }))?;
    }

    let private = model.has_bastion();
    if private {
        let bastion = model.security_group_name(InstanceGroupRole::Bastion);
        graph.insert(Task::SecurityGroup(SecurityGroup {
            name: bastion.clone(),
            vpc: cluster.name.clone(),
            description: Some(format!("Security group for bastion in {}", cluster.name)),
            ..Default::default()
        }))?;
        graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
            name: "bastion-egress".to_string(),
            security_group: bastion.clone(),
            direction: RuleDirection::Egress,
            cidr: Some("0.0.0.0/0".to_string()),
            ..Default::default()
        }))?;

        for cidr in model.ssh_access() {
            graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
                name: format!("ssh-external-to-bastion-{cidr}"),
                security_group: bastion.clone(),
                direction: RuleDirection::Ingress,
                protocol: Some("tcp".to_string()),
                from_port: Some(22),
                to_port: Some(22),
                cidr: Some(cidr),
                ..Default::default()
            }))?;
        }
        for (rule_name, to) in [
            ("bastion-to-master-ssh", &masters),
            ("bastion-to-node-ssh", &nodes),
        ] {
            graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
                name: rule_name.to_string(),
                security_group: to.clone(),
                direction: RuleDirection::Ingress,
                protocol: Some("tcp".to_string()),
                from_port: Some(22),
                to_port: Some(22),
                source_group: Some(bastion.clone()),
                ..Default::default()
            }))?;
        }
    } else {
        for cidr in model.ssh_access() {
            for (role, group) in [("master", &masters), ("node", &nodes)] {
                graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
                    name: format!("ssh-external-to-{role}-{cidr}"),
                    security_group: group.clone(),
                    direction: RuleDirection::Ingress,
                    protocol: Some("tcp".to_string()),
                    from_port: Some(22),
                    to_port: Some(22),
                    cidr: Some(cidr.clone()),
                    ..Default::default()
                }))?;
            }
        }
    }

    if model.api_uses_load_balancer() {
        let api_elb = api_elb_security_group_name(&cluster.name);
        graph.insert(Task::SecurityGroup(SecurityGroup {
            name: api_elb.clone(),
            vpc: cluster.name.clone(),
            description: Some(format!("Security group for api ELB in {}", cluster.name)),
            ..Default::default()
        }))?;
        graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
            name: "api-elb-egress".to_string(),
            security_group: api_elb.clone(),
            direction: RuleDirection::Egress,
            cidr: Some("0.0.0.0/0".to_string()),
            ..Default::default()
        }))?;
        for cidr in model.api_access() {
            graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
                name: format!("https-external-to-api-{cidr}"),
                security_group: api_elb.clone(),
                direction: RuleDirection::Ingress,
                protocol: Some("tcp".to_string()),
                from_port: Some(443),
                to_port: Some(443),
                cidr: Some(cidr),
                ..Default::default()
            }))?;
        }
        graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
            name: "https-api-elb-to-master".to_string(),
            security_group: masters.clone(),
            direction: RuleDirection::Ingress,
            protocol: Some("tcp".to_string()),
            from_port: Some(443),
            to_port: Some(443),
            source_group: Some(api_elb),
            ..Default::default()
        }))?;
    } else {
        // Public masters take API traffic directly.
        for cidr in model.api_access() {
            graph.insert(Task::SecurityGroupRule(SecurityGroupRule {
                name: format!("https-external-to-master-{cidr}"),
                security_group: masters.clone(),
                direction: RuleDirection::Ingress,
                protocol: Some("tcp".to_string()),
                from_port: Some(443),
                to_port: Some(443),
                cidr: Some(cidr),
                ..Default::default()
            }))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{private_cluster, public_cluster, TEST_SSH_KEY};
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn test_public_topology_exposes_ssh_on_roles() {
        let (cluster, groups) = public_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        super::super::network::build(&model, &mut graph).unwrap();
        build(&model, &mut graph).unwrap();

        assert!(graph
            .get(TaskKind::SecurityGroupRule, "ssh-external-to-master-0.0.0.0/0")
            .is_some());
        assert!(graph
            .get(TaskKind::SecurityGroupRule, "https-external-to-master-0.0.0.0/0")
            .is_some());
        assert!(graph.get(TaskKind::SecurityGroup, "bastion.minimal.example.com").is_none());
    }

    #[test]
    fn test_private_topology_routes_ssh_through_bastion() {
        let (cluster, groups) = private_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        super::super::network::build(&model, &mut graph).unwrap();
        build(&model, &mut graph).unwrap();

        assert!(graph
            .get(TaskKind::SecurityGroupRule, "ssh-external-to-bastion-0.0.0.0/0")
            .is_some());
        assert!(graph
            .get(TaskKind::SecurityGroupRule, "bastion-to-master-ssh")
            .is_some());
        // No direct external SSH to masters.
        assert!(graph
            .get(TaskKind::SecurityGroupRule, "ssh-external-to-master-0.0.0.0/0")
            .is_none());
        // API traffic flows through the ELB group.
        assert!(graph
            .get(TaskKind::SecurityGroupRule, "https-api-elb-to-master")
            .is_some());
    }

    #[test]
    fn test_custom_ssh_access_cidrs() {
        let (mut cluster, groups) = public_cluster();
        cluster.spec.ssh_access = vec!["10.1.0.0/16".to_string(), "10.2.0.0/16".to_string()];
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        super::super::network::build(&model, &mut graph).unwrap();
        build(&model, &mut graph).unwrap();

        assert!(graph
            .get(TaskKind::SecurityGroupRule, "ssh-external-to-master-10.1.0.0/16")
            .is_some());
        assert!(graph
            .get(TaskKind::SecurityGroupRule, "ssh-external-to-node-10.2.0.0/16")
            .is_some());
        assert!(graph
            .get(TaskKind::SecurityGroupRule, "ssh-external-to-master-0.0.0.0/0")
            .is_none());
    }
}
