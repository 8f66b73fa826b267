//! Security group and rule tasks

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::cloud::{build_tags, CloudSecurityGroupRule, Filter, RuleDirection};
use crate::target::EmitterTarget;
use crate::{Error, Result};

use super::{field_change, TaskContext, TaskKind, TaskPayload, TaskRef};

/// A security group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecurityGroup {
    /// Logical name; also the group name in the cloud
    pub name: String,
    /// Cloud id, discovered or minted
    pub id: Option<String>,
    /// Name of the VPC task the group lives in
    pub vpc: String,
    /// Observed VPC id; output-only
    pub vpc_id: Option<String>,
    /// Group description; fixed at creation
    pub description: Option<String>,
}

#[async_trait]
impl TaskPayload for SecurityGroup {
    const KIND: TaskKind = TaskKind::SecurityGroup;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        vec![TaskRef::new(TaskKind::Vpc, &self.vpc)]
    }

    fn cloud_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let filter = match &self.id {
            Some(id) => Filter::by_id(id),
            None => Filter::by_tags(ctx.cluster_name, &self.name),
        };
        let mut found = ctx.cloud.describe_security_groups(&filter).await?;
        if found.len() > 1 {
            return Err(Error::cloud_api(
                "DescribeSecurityGroups",
                format!("found multiple security groups matching {}", self.name),
            ));
        }
        let Some(group) = found.pop() else {
            return Ok(None);
        };

        debug!(id = %group.id, "found matching security group");
        self.id = Some(group.id.clone());

        Ok(Some(Self {
            name: self.name.clone(),
            id: Some(group.id),
            vpc: self.vpc.clone(),
            vpc_id: Some(group.vpc_id),
            description: Some(group.description),
        }))
    }

    fn changes(actual: &Self, expected: &Self, ctx: &TaskContext<'_>) -> Self {
        let expected_vpc_id = ctx
            .graph
            .cloud_id(TaskKind::Vpc, &expected.vpc)
            .ok()
            .or_else(|| expected.vpc_id.clone());

        Self {
            name: expected.name.clone(),
            id: None,
            vpc: expected.vpc.clone(),
            vpc_id: field_change(&actual.vpc_id, &expected_vpc_id),
            description: field_change(&actual.description, &expected.description),
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.vpc_id.is_some() || changes.description.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.vpc.is_empty() {
                return Err(Error::required_field("VPC"));
            }
            if expected.description.is_none() {
                return Err(Error::required_field("Description"));
            }
        }
        if actual.is_some() {
            if changes.vpc_id.is_some() {
                return Err(Error::cannot_change("VPC"));
            }
            if changes.description.is_some() {
                return Err(Error::cannot_change("Description"));
            }
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        _changes: &Self,
    ) -> Result<()> {
        if actual.is_none() {
            let vpc_id = ctx.graph.cloud_id(TaskKind::Vpc, &self.vpc)?;
            let description = self
                .description
                .as_deref()
                .ok_or_else(|| Error::required_field("Description"))?;
            debug!(name = %self.name, "creating security group");
            let created = ctx
                .cloud
                .create_security_group(&vpc_id, &self.name, description)
                .await?;
            self.id = Some(created.id);
            self.vpc_id = Some(created.vpc_id);
        }

        let id = self.id.as_deref().ok_or_else(|| Error::required_field("ID"))?;
        ctx.cloud
            .add_tags(id, &build_tags(ctx.cluster_name, &self.name))
            .await
    }

    fn render_emitter(&self, ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        target.render_resource(
            Self::KIND.emitter_type(),
            &self.name,
            json!({
                "name": self.name,
                "vpc_id": ctx.graph.emitter_link(TaskKind::Vpc, &self.vpc)?,
                "description": self.description,
                "tags": build_tags(ctx.cluster_name, &self.name),
            }),
        )
    }
}

/// A single security group rule
///
/// Rules have no cloud-side identity of their own: one either exists with
/// exactly these fields or it does not, so reconciliation is
/// create-if-missing and the delta is always empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecurityGroupRule {
    /// Logical name
    pub name: String,
    /// Name of the security group task the rule attaches to
    pub security_group: String,
    /// Rule direction
    pub direction: RuleDirection,
    /// Protocol (`tcp`, `udp`); empty means all traffic
    pub protocol: Option<String>,
    /// Start of the port range
    pub from_port: Option<i64>,
    /// End of the port range
    pub to_port: Option<i64>,
    /// Peer CIDR
    pub cidr: Option<String>,
    /// Peer security group task name
    pub source_group: Option<String>,
}

impl SecurityGroupRule {
    fn to_cloud(&self, group_id: String, source_group_id: Option<String>) -> CloudSecurityGroupRule {
        CloudSecurityGroupRule {
            security_group_id: group_id,
            direction: self.direction,
            protocol: self.protocol.clone().unwrap_or_default(),
            from_port: self.from_port,
            to_port: self.to_port,
            cidr: self.cidr.clone(),
            source_group_id,
        }
    }
}

#[async_trait]
impl TaskPayload for SecurityGroupRule {
    const KIND: TaskKind = TaskKind::SecurityGroupRule;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        let mut deps = vec![TaskRef::new(TaskKind::SecurityGroup, &self.security_group)];
        if let Some(source) = &self.source_group {
            deps.push(TaskRef::new(TaskKind::SecurityGroup, source));
        }
        deps
    }

    fn cloud_id(&self) -> Option<&str> {
        None
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        // Without the owning group's id there is nothing to query yet.
        let Ok(group_id) = ctx.graph.cloud_id(TaskKind::SecurityGroup, &self.security_group) else {
            return Ok(None);
        };
        let source_group_id = match &self.source_group {
            Some(source) => Some(ctx.graph.cloud_id(TaskKind::SecurityGroup, source)?),
            None => None,
        };

        let want = self.to_cloud(group_id.clone(), source_group_id);
        let rules = ctx.cloud.describe_security_group_rules(&group_id).await?;
        if rules.iter().any(|r| *r == want) {
            debug!(rule = %self.name, "found matching rule");
            Ok(Some(self.clone()))
        } else {
            Ok(None)
        }
    }

    fn changes(_actual: &Self, expected: &Self, _ctx: &TaskContext<'_>) -> Self {
        Self {
            name: expected.name.clone(),
            security_group: expected.security_group.clone(),
            direction: expected.direction,
            ..Default::default()
        }
    }

    fn has_changes(_changes: &Self) -> bool {
        false
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, _changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.security_group.is_empty() {
                return Err(Error::required_field("SecurityGroup"));
            }
            if expected.cidr.is_none() && expected.source_group.is_none() {
                return Err(Error::required_field("CIDR or SourceGroup"));
            }
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        _changes: &Self,
    ) -> Result<()> {
        if actual.is_some() {
            return Ok(());
        }
        let group_id = ctx
            .graph
            .cloud_id(TaskKind::SecurityGroup, &self.security_group)?;
        let source_group_id = match &self.source_group {
            Some(source) => Some(ctx.graph.cloud_id(TaskKind::SecurityGroup, source)?),
            None => None,
        };
        debug!(rule = %self.name, "authorizing security group rule");
        ctx.cloud
            .authorize_security_group_rule(&self.to_cloud(group_id, source_group_id))
            .await
    }

    fn render_emitter(&self, ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let direction = match self.direction {
            RuleDirection::Ingress => "ingress",
            RuleDirection::Egress => "egress",
        };
        let mut body = json!({
            "type": direction,
            "security_group_id": ctx.graph.emitter_link(TaskKind::SecurityGroup, &self.security_group)?,
            "from_port": self.from_port.unwrap_or(0),
            "to_port": self.to_port.unwrap_or(0),
            "protocol": self.protocol.clone().unwrap_or_else(|| "-1".to_string()),
        });
        if let Some(cidr) = &self.cidr {
            body["cidr_blocks"] = json!([cidr]);
        }
        if let Some(source) = &self.source_group {
            body["source_security_group_id"] =
                json!(ctx.graph.emitter_link(TaskKind::SecurityGroup, source)?);
        }
        target.render_resource(Self::KIND.emitter_type(), &self.name, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloud;
    use crate::task::{SubnetTask, Task, TaskGraph, Vpc};

    fn graph_with_sg(cloud: &MockCloud) -> TaskGraph {
        let vpc_id = cloud.seed_vpc("172.20.0.0/16");
        let mut graph = TaskGraph::new();
        graph
            .insert(Task::Vpc(Vpc {
                name: "minimal.example.com".to_string(),
                id: Some(vpc_id),
                ..Default::default()
            }))
            .unwrap();
        graph
    }

    fn context<'a>(cloud: &'a MockCloud, graph: &'a TaskGraph) -> TaskContext<'a> {
        TaskContext {
            cloud,
            cluster_name: "minimal.example.com",
            graph,
        }
    }

    #[tokio::test]
    async fn test_security_group_create_and_refind() {
        let cloud = MockCloud::new("us-test-1");
        let graph = graph_with_sg(&cloud);
        let ctx = context(&cloud, &graph);

        let mut sg = SecurityGroup {
            name: "masters.minimal.example.com".to_string(),
            vpc: "minimal.example.com".to_string(),
            description: Some("Security group for masters".to_string()),
            ..Default::default()
        };
        let changes = sg.clone();
        sg.render_direct(&ctx, None, &changes).await.unwrap();
        assert!(sg.id.is_some());

        let mut again = SecurityGroup {
            name: "masters.minimal.example.com".to_string(),
            vpc: "minimal.example.com".to_string(),
            description: Some("Security group for masters".to_string()),
            ..Default::default()
        };
        let actual = again.find(&ctx).await.unwrap().unwrap();
        let delta = SecurityGroup::changes(&actual, &again, &ctx);
        assert!(!SecurityGroup::has_changes(&delta));
    }

    #[tokio::test]
    async fn test_security_group_description_is_immutable() {
        let cloud = MockCloud::new("us-test-1");
        let graph = graph_with_sg(&cloud);
        let ctx = context(&cloud, &graph);

        let mut sg = SecurityGroup {
            name: "nodes.minimal.example.com".to_string(),
            vpc: "minimal.example.com".to_string(),
            description: Some("original".to_string()),
            ..Default::default()
        };
        let changes = sg.clone();
        sg.render_direct(&ctx, None, &changes).await.unwrap();

        let mut modified = sg.clone();
        modified.id = None;
        modified.description = Some("rewritten".to_string());
        let actual = modified.find(&ctx).await.unwrap().unwrap();
        let delta = SecurityGroup::changes(&actual, &modified, &ctx);
        let err = SecurityGroup::check_changes(Some(&actual), &modified, &delta).unwrap_err();
        assert!(matches!(err, Error::CannotChange(f) if f == "Description"));
    }

    #[tokio::test]
    async fn test_rule_is_created_once() {
        let cloud = MockCloud::new("us-test-1");
        let mut graph = graph_with_sg(&cloud);

        // Create the group through its own task first.
        let mut sg = SecurityGroup {
            name: "masters.minimal.example.com".to_string(),
            vpc: "minimal.example.com".to_string(),
            description: Some("masters".to_string()),
            ..Default::default()
        };
        {
            let ctx = context(&cloud, &graph);
            let changes = sg.clone();
            sg.render_direct(&ctx, None, &changes).await.unwrap();
        }
        graph.insert(Task::SecurityGroup(sg)).unwrap();
        let ctx = context(&cloud, &graph);

        let mut rule = SecurityGroupRule {
            name: "ssh-external-to-master".to_string(),
            security_group: "masters.minimal.example.com".to_string(),
            direction: RuleDirection::Ingress,
            protocol: Some("tcp".to_string()),
            from_port: Some(22),
            to_port: Some(22),
            cidr: Some("0.0.0.0/0".to_string()),
            ..Default::default()
        };

        assert!(rule.find(&ctx).await.unwrap().is_none());
        let changes = rule.clone();
        rule.render_direct(&ctx, None, &changes).await.unwrap();

        // Second pass finds the rule and does nothing.
        let actual = rule.find(&ctx).await.unwrap();
        assert!(actual.is_some());
    }

    #[tokio::test]
    async fn test_rule_requires_a_peer() {
        let rule = SecurityGroupRule {
            name: "broken".to_string(),
            security_group: "sg".to_string(),
            ..Default::default()
        };
        let err = SecurityGroupRule::check_changes(None, &rule, &rule.clone()).unwrap_err();
        assert!(err.to_string().contains("CIDR or SourceGroup"));
    }

    #[tokio::test]
    async fn test_rule_emitter_with_source_group() {
        let cloud = MockCloud::new("us-test-1");
        let mut graph = graph_with_sg(&cloud);
        for name in ["masters.minimal.example.com", "nodes.minimal.example.com"] {
            graph
                .insert(Task::SecurityGroup(SecurityGroup {
                    name: name.to_string(),
                    vpc: "minimal.example.com".to_string(),
                    description: Some(name.to_string()),
                    ..Default::default()
                }))
                .unwrap();
        }
        let ctx = context(&cloud, &graph);

        let rule = SecurityGroupRule {
            name: "node-to-master".to_string(),
            security_group: "masters.minimal.example.com".to_string(),
            direction: RuleDirection::Ingress,
            protocol: Some("tcp".to_string()),
            from_port: Some(443),
            to_port: Some(443),
            source_group: Some("nodes.minimal.example.com".to_string()),
            ..Default::default()
        };
        let mut target = EmitterTarget::new("minimal.example.com", "us-test-1");
        rule.render_emitter(&ctx, &mut target).unwrap();

        let text = target.main_file().unwrap();
        assert!(text.contains("${aws_security_group.nodes.minimal.example.com.id}"));
        assert!(text.contains("\"type\": \"ingress\""));
    }

    // A subnet task in the same graph must not satisfy a security-group
    // lookup: arena keys are namespaced by kind.
    #[test]
    fn test_kind_namespacing_in_graph() {
        let mut graph = TaskGraph::new();
        graph
            .insert(Task::Subnet(SubnetTask {
                name: "shared-name".to_string(),
                vpc: "v".to_string(),
                ..Default::default()
            }))
            .unwrap();
        assert!(graph.get(TaskKind::SecurityGroup, "shared-name").is_none());
        assert!(graph.get(TaskKind::Subnet, "shared-name").is_some());
    }
}
