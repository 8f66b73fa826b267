//! API endpoint tasks
//!
//! With public masters the API DNS name is managed at runtime by the
//! in-cluster DNS controller, so nothing is built here. With private
//! masters the API sits behind a load balancer on the utility subnets, and
//! the endpoint name aliases to it.

use std::collections::BTreeMap;

use crate::api::SubnetType;
use crate::options::elb_name32;
use crate::task::{DnsRecord, LbHealthCheck, LbListener, LoadBalancer, Task, TaskGraph};
use crate::{Error, Result};

use super::firewall::api_elb_security_group_name;
use super::ModelContext;

pub fn build(model: &ModelContext<'_>, graph: &mut TaskGraph) -> Result<()> {
    if !model.api_uses_load_balancer() {
        return Ok(());
    }

    let cluster = model.cluster;
    let api_name = cluster
        .spec
        .master_public_name
        .clone()
        .ok_or_else(|| Error::required_field("spec.masterPublicName"))?;

    let utility_subnets: Vec<String> = cluster
        .spec
        .subnets
        .iter()
        .filter(|s| s.subnet_type == SubnetType::Utility)
        .map(|s| s.name.clone())
        .collect();
    if utility_subnets.is_empty() {
        return Err(Error::validation(
            "spec.subnets",
            "private masters need utility subnets for the API load balancer",
        ));
    }

    let mut listeners = BTreeMap::new();
    listeners.insert("443".to_string(), LbListener { instance_port: 443 });

    graph.insert(Task::LoadBalancer(LoadBalancer {
        name: api_name.clone(),
        id: Some(elb_name32("api", &cluster.name)),
        scheme: Some("internet-facing".to_string()),
        subnets: utility_subnets,
        security_groups: vec![api_elb_security_group_name(&cluster.name)],
        listeners,
        health_check: Some(LbHealthCheck {
            target: Some("TCP:443".to_string()),
            healthy_threshold: Some(2),
            unhealthy_threshold: Some(2),
            interval: Some(10),
            timeout: Some(5),
        }),
        ..Default::default()
    }))?;

    graph.insert(Task::DnsRecord(DnsRecord {
        name: api_name.clone(),
        zone: cluster.spec.dns_zone.clone(),
        zone_id: None,
        target_load_balancer: api_name,
        alias: None,
    }))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{private_cluster, TEST_SSH_KEY};
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn test_elb_spans_utility_subnets() {
        let (cluster, groups) = private_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        build(&model, &mut graph).unwrap();

        match graph
            .get(TaskKind::LoadBalancer, "api.privateweave.example.com")
            .unwrap()
        {
            Task::LoadBalancer(lb) => {
                assert_eq!(lb.subnets, vec!["utility-us-test-1a".to_string()]);
                assert_eq!(lb.id.as_deref(), Some("api-privateweave-example-com"));
                assert!(lb.listeners.contains_key("443"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_missing_utility_subnets_is_an_error() {
        let (mut cluster, groups) = private_cluster();
        cluster.spec.subnets.retain(|s| s.subnet_type != SubnetType::Utility);
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        let err = build(&model, &mut graph).unwrap_err();
        assert!(err.to_string().contains("utility subnets"));
    }
}
