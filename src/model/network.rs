//! Network tasks: the VPC and its subnets

use crate::task::{SubnetTask, Task, TaskGraph, Vpc};
use crate::Result;

use super::ModelContext;

/// Build the VPC and subnet tasks
pub fn build(model: &ModelContext<'_>, graph: &mut TaskGraph) -> Result<()> {
    let cluster = model.cluster;
    let shared = cluster.shared_vpc();

    // A shared VPC is read-only: no expectations beyond existence, so the
    // observed state can never produce a diff.
    graph.insert(Task::Vpc(Vpc {
        name: cluster.name.clone(),
        id: cluster.spec.network_id.clone(),
        cidr: (!shared).then(|| cluster.spec.network_cidr.clone()).flatten(),
        enable_dns_support: (!shared).then_some(true),
        enable_dns_hostnames: (!shared).then_some(true),
        shared,
    }))?;

    for subnet in &cluster.spec.subnets {
        graph.insert(Task::Subnet(SubnetTask {
            name: subnet.name.clone(),
            id: None,
            vpc: cluster.name.clone(),
            vpc_id: None,
            zone: Some(subnet.zone.clone()),
            cidr: subnet.cidr.clone(),
            shared: false,
        }))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{public_cluster, TEST_SSH_KEY};
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn test_shared_vpc_task_carries_id_and_no_cidr() {
        let (mut cluster, groups) = public_cluster();
        cluster.spec.network_id = Some("vpc-12345678".to_string());
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };

        let mut graph = TaskGraph::new();
        build(&model, &mut graph).unwrap();

        let task = graph.get(TaskKind::Vpc, "minimal.example.com").unwrap();
        assert!(task.is_shared());
        assert_eq!(task.cloud_id(), Some("vpc-12345678"));
        match task {
            Task::Vpc(vpc) => assert!(vpc.cidr.is_none()),
            _ => unreachable!(),
        }
    }
}
