//! IAM roles and inline policies
//!
//! One role per instance role in use. Policy documents are rendered
//! deterministically (sorted keys, fixed indentation) so the emitter's
//! golden files stay stable.

use serde_json::json;

use crate::api::InstanceGroupRole;
use crate::task::{IamRole, IamRolePolicy, Task, TaskGraph};
use crate::{Error, Result};

use super::ModelContext;

/// The trust policy every instance role uses
fn assume_role_policy() -> Result<String> {
    render_document(&json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": { "Service": "ec2.amazonaws.com" },
                "Action": "sts:AssumeRole"
            }
        ]
    }))
}

fn master_policy(model: &ModelContext<'_>) -> Result<String> {
    let config_store = config_store_arn(model)?;
    render_document(&json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["ec2:*"],
                "Resource": ["*"]
            },
            {
                "Effect": "Allow",
                "Action": ["elasticloadbalancing:*"],
                "Resource": ["*"]
            },
            {
                "Effect": "Allow",
                "Action": ["route53:*"],
                "Resource": ["*"]
            },
            {
                "Effect": "Allow",
                "Action": ["s3:*"],
                "Resource": [config_store, format!("{config_store}/*")]
            }
        ]
    }))
}

fn node_policy(model: &ModelContext<'_>) -> Result<String> {
    let config_store = config_store_arn(model)?;
    render_document(&json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["ec2:Describe*"],
                "Resource": ["*"]
            },
            {
                "Effect": "Allow",
                "Action": ["route53:*"],
                "Resource": ["*"]
            },
            {
                "Effect": "Allow",
                "Action": ["s3:GetObject", "s3:ListBucket"],
                "Resource": [config_store, format!("{config_store}/*")]
            }
        ]
    }))
}

fn bastion_policy() -> Result<String> {
    render_document(&json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["ec2:DescribeRegions"],
                "Resource": ["*"]
            }
        ]
    }))
}

/// The config store expressed as a resource identifier policies can name
fn config_store_arn(model: &ModelContext<'_>) -> Result<String> {
    let store = model
        .cluster
        .spec
        .config_store
        .as_deref()
        .ok_or_else(|| Error::required_field("spec.configStore"))?;
    Ok(match store.strip_prefix("s3://") {
        Some(rest) => format!("arn:aws:s3:::{rest}"),
        None => store.to_string(),
    })
}

fn render_document(value: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn build(model: &ModelContext<'_>, graph: &mut TaskGraph) -> Result<()> {
    let mut roles = vec![
        (InstanceGroupRole::Master, master_policy(model)?),
        (InstanceGroupRole::Node, node_policy(model)?),
    ];
    if model.has_bastion() {
        roles.push((InstanceGroupRole::Bastion, bastion_policy()?));
    }

    for (role, policy) in roles {
        let name = model.iam_role_name(role);
        graph.insert(Task::IamRole(IamRole {
            name: name.clone(),
            role_policy_document: Some(assume_role_policy()?),
        }))?;
        graph.insert(Task::IamRolePolicy(IamRolePolicy {
            name: name.clone(),
            role: name,
            policy_document: Some(policy),
        }))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{private_cluster, public_cluster, TEST_SSH_KEY};
    use super::*;
    use crate::task::TaskKind;

    #[test]
    fn test_roles_per_topology() {
        let (cluster, groups) = public_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        build(&model, &mut graph).unwrap();

        assert!(graph.get(TaskKind::IamRole, "masters.minimal.example.com").is_some());
        assert!(graph.get(TaskKind::IamRole, "nodes.minimal.example.com").is_some());
        assert!(graph.get(TaskKind::IamRole, "bastions.minimal.example.com").is_none());

        let (cluster, groups) = private_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        let mut graph = TaskGraph::new();
        build(&model, &mut graph).unwrap();
        assert!(graph
            .get(TaskKind::IamRole, "bastions.privateweave.example.com")
            .is_some());
    }

    #[test]
    fn test_policy_documents_are_deterministic() {
        let (cluster, groups) = public_cluster();
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        assert_eq!(master_policy(&model).unwrap(), master_policy(&model).unwrap());
        assert!(master_policy(&model).unwrap().contains("ec2:*"));
        assert!(node_policy(&model).unwrap().contains("s3:GetObject"));
    }

    #[test]
    fn test_s3_config_store_becomes_arn() {
        let (mut cluster, groups) = public_cluster();
        cluster.spec.config_store = Some("s3://state-store/minimal.example.com".to_string());
        let model = ModelContext {
            cluster: &cluster,
            instance_groups: &groups,
            ssh_public_key: TEST_SSH_KEY,
        };
        assert_eq!(
            config_store_arn(&model).unwrap(),
            "arn:aws:s3:::state-store/minimal.example.com"
        );
    }
}
