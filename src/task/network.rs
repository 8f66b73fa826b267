//! VPC and subnet tasks

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::cloud::{build_tags, Filter};
use crate::target::EmitterTarget;
use crate::{Error, Result};

use super::{field_change, TaskContext, TaskKind, TaskPayload, TaskRef};

/// The cluster's cloud network
///
/// When `shared` is set the VPC pre-exists the cluster: it must be found,
/// and nothing about it may change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Vpc {
    /// Logical name
    pub name: String,
    /// Cloud id; set on input for shared VPCs, discovered or minted
    /// otherwise
    pub id: Option<String>,
    /// Network CIDR
    pub cidr: Option<String>,
    /// Whether DNS resolution is enabled
    pub enable_dns_support: Option<bool>,
    /// Whether instances get DNS hostnames
    pub enable_dns_hostnames: Option<bool>,
    /// The cluster uses but does not own this VPC
    pub shared: bool,
}

#[async_trait]
impl TaskPayload for Vpc {
    const KIND: TaskKind = TaskKind::Vpc;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        Vec::new()
    }

    fn is_shared(&self) -> bool {
        self.shared
    }

    fn cloud_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let filter = match &self.id {
            Some(id) => Filter::by_id(id),
            None => Filter::by_tags(ctx.cluster_name, &self.name),
        };
        let mut found = ctx.cloud.describe_vpcs(&filter).await?;
        if found.len() > 1 {
            return Err(Error::cloud_api(
                "DescribeVpcs",
                format!("found multiple VPCs matching {}", self.name),
            ));
        }
        let Some(vpc) = found.pop() else {
            return Ok(None);
        };

        debug!(id = %vpc.id, "found matching VPC");
        self.id = Some(vpc.id.clone());

        Ok(Some(Self {
            name: self.name.clone(),
            id: Some(vpc.id),
            cidr: Some(vpc.cidr),
            enable_dns_support: Some(vpc.enable_dns_support),
            enable_dns_hostnames: Some(vpc.enable_dns_hostnames),
            shared: self.shared,
        }))
    }

    fn changes(actual: &Self, expected: &Self, _ctx: &TaskContext<'_>) -> Self {
        Self {
            name: expected.name.clone(),
            id: None,
            cidr: field_change(&actual.cidr, &expected.cidr),
            enable_dns_support: field_change(&actual.enable_dns_support, &expected.enable_dns_support),
            enable_dns_hostnames: field_change(
                &actual.enable_dns_hostnames,
                &expected.enable_dns_hostnames,
            ),
            shared: expected.shared,
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.cidr.is_some()
            || changes.enable_dns_support.is_some()
            || changes.enable_dns_hostnames.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, changes: &Self) -> Result<()> {
        if actual.is_none() && expected.cidr.is_none() {
            return Err(Error::required_field("CIDR"));
        }
        if actual.is_some() && changes.cidr.is_some() {
            return Err(Error::cannot_change("CIDR"));
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        changes: &Self,
    ) -> Result<()> {
        if actual.is_none() {
            let cidr = self.cidr.as_deref().ok_or_else(|| Error::required_field("CIDR"))?;
            debug!(cidr = %cidr, "creating VPC");
            let created = ctx
                .cloud
                .create_vpc(
                    cidr,
                    self.enable_dns_support.unwrap_or(true),
                    self.enable_dns_hostnames.unwrap_or(true),
                )
                .await?;
            self.id = Some(created.id);
        } else if changes.enable_dns_support.is_some() || changes.enable_dns_hostnames.is_some() {
            let id = self.id.as_deref().ok_or_else(|| Error::required_field("ID"))?;
            ctx.cloud
                .modify_vpc_attributes(
                    id,
                    self.enable_dns_support.unwrap_or(true),
                    self.enable_dns_hostnames.unwrap_or(true),
                )
                .await?;
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
                "cidr_block": self.cidr,
                "enable_dns_hostnames": self.enable_dns_hostnames.unwrap_or(true),
                "enable_dns_support": self.enable_dns_support.unwrap_or(true),
                "tags": build_tags(ctx.cluster_name, &self.name),
            }),
        )
    }
}

/// A VPC subnet
///
/// The VPC, availability zone and CIDR are fixed at creation; the
/// reconciler refuses any change to them rather than recreating the subnet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubnetTask {
    /// Logical name
    pub name: String,
    /// Cloud id, discovered or minted
    pub id: Option<String>,
    /// Name of the VPC task this subnet lives in
    pub vpc: String,
    /// Observed VPC id; output-only
    pub vpc_id: Option<String>,
    /// Availability zone
    pub zone: Option<String>,
    /// Subnet CIDR
    pub cidr: Option<String>,
    /// The cluster uses but does not own this subnet
    pub shared: bool,
}

#[async_trait]
impl TaskPayload for SubnetTask {
    const KIND: TaskKind = TaskKind::Subnet;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        vec![TaskRef::new(TaskKind::Vpc, &self.vpc)]
    }

    fn is_shared(&self) -> bool {
        self.shared
    }

    fn cloud_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let filter = match &self.id {
            Some(id) => Filter::by_id(id),
            None => Filter::by_tags(ctx.cluster_name, &self.name),
        };
        let mut found = ctx.cloud.describe_subnets(&filter).await?;
        if found.len() > 1 {
            return Err(Error::cloud_api(
                "DescribeSubnets",
                format!("found multiple subnets matching {}", self.name),
            ));
        }
        let Some(subnet) = found.pop() else {
            return Ok(None);
        };

        debug!(id = %subnet.id, "found matching subnet");
        self.id = Some(subnet.id.clone());

        Ok(Some(Self {
            name: self.name.clone(),
            id: Some(subnet.id),
            vpc: self.vpc.clone(),
            vpc_id: Some(subnet.vpc_id),
            zone: Some(subnet.zone),
            cidr: Some(subnet.cidr),
            shared: self.shared,
        }))
    }

    fn changes(actual: &Self, expected: &Self, ctx: &TaskContext<'_>) -> Self {
        // The expected VPC id is whatever the referenced task resolved to;
        // comparison is only possible once that id is known.
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
            zone: field_change(&actual.zone, &expected.zone),
            cidr: field_change(&actual.cidr, &expected.cidr),
            shared: expected.shared,
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.vpc_id.is_some() || changes.zone.is_some() || changes.cidr.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.vpc.is_empty() {
                return Err(Error::required_field("VPC"));
            }
            if expected.cidr.is_none() {
                return Err(Error::required_field("CIDR"));
            }
        }
        if actual.is_some() {
            if changes.vpc_id.is_some() {
                return Err(Error::cannot_change("VPC"));
            }
            if changes.zone.is_some() {
                return Err(Error::cannot_change("AvailabilityZone"));
            }
            if changes.cidr.is_some() {
                return Err(Error::cannot_change("CIDR"));
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
            let zone = self.zone.as_deref().ok_or_else(|| Error::required_field("AvailabilityZone"))?;
            let cidr = self.cidr.as_deref().ok_or_else(|| Error::required_field("CIDR"))?;
            debug!(cidr = %cidr, zone = %zone, "creating subnet");
            let created = ctx.cloud.create_subnet(&vpc_id, zone, cidr).await?;
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
                "vpc_id": ctx.graph.emitter_link(TaskKind::Vpc, &self.vpc)?,
                "cidr_block": self.cidr,
                "availability_zone": self.zone,
                "tags": build_tags(ctx.cluster_name, &self.name),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Cloud, MockCloud};
    use crate::task::{Task, TaskGraph};

    fn context<'a>(cloud: &'a MockCloud, graph: &'a TaskGraph) -> TaskContext<'a> {
        TaskContext {
            cloud,
            cluster_name: "minimal.example.com",
            graph,
        }
    }

    fn subnet(vpc: &str) -> SubnetTask {
        SubnetTask {
            name: "us-test-1a".to_string(),
            vpc: vpc.to_string(),
            zone: Some("us-test-1a".to_string()),
            cidr: Some("172.20.32.0/19".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_vpc_find_returns_none_when_absent() {
        let cloud = MockCloud::new("us-test-1");
        let graph = TaskGraph::new();
        let mut vpc = Vpc {
            name: "minimal.example.com".to_string(),
            cidr: Some("172.20.0.0/16".to_string()),
            ..Default::default()
        };
        let actual = vpc.find(&context(&cloud, &graph)).await.unwrap();
        assert!(actual.is_none());
    }

    #[tokio::test]
    async fn test_vpc_create_backfills_id_and_tags() {
        let cloud = MockCloud::new("us-test-1");
        let graph = TaskGraph::new();
        let mut vpc = Vpc {
            name: "minimal.example.com".to_string(),
            cidr: Some("172.20.0.0/16".to_string()),
            ..Default::default()
        };
        let changes = vpc.clone();
        vpc.render_direct(&context(&cloud, &graph), None, &changes)
            .await
            .unwrap();

        assert_eq!(vpc.id.as_deref(), Some("vpc-0001"));
        // A re-find locates it through the cluster tags.
        let mut again = Vpc {
            name: "minimal.example.com".to_string(),
            ..Default::default()
        };
        let actual = again.find(&context(&cloud, &graph)).await.unwrap().unwrap();
        assert_eq!(actual.id.as_deref(), Some("vpc-0001"));
        assert_eq!(actual.cidr.as_deref(), Some("172.20.0.0/16"));
    }

    #[tokio::test]
    async fn test_subnet_cidr_is_immutable() {
        let cloud = MockCloud::new("us-test-1");
        let vpc_id = cloud.seed_vpc("172.20.0.0/16");

        let mut graph = TaskGraph::new();
        graph
            .insert(Task::Vpc(Vpc {
                name: "minimal.example.com".to_string(),
                id: Some(vpc_id.clone()),
                ..Default::default()
            }))
            .unwrap();

        // First run creates the subnet.
        let mut task = subnet("minimal.example.com");
        let ctx = context(&cloud, &graph);
        let changes = task.clone();
        task.render_direct(&ctx, None, &changes).await.unwrap();

        // Second run with a different CIDR: the diff flags it and the check
        // refuses.
        let mut modified = subnet("minimal.example.com");
        modified.cidr = Some("172.20.64.0/19".to_string());
        let actual = modified.find(&ctx).await.unwrap().unwrap();
        let changes = SubnetTask::changes(&actual, &modified, &ctx);
        assert_eq!(changes.cidr.as_deref(), Some("172.20.64.0/19"));

        let err = SubnetTask::check_changes(Some(&actual), &modified, &changes).unwrap_err();
        assert!(matches!(err, Error::CannotChange(field) if field == "CIDR"));

        // The cloud still holds the original CIDR.
        assert_eq!(cloud.subnets()[0].cidr, "172.20.32.0/19");
    }

    #[tokio::test]
    async fn test_subnet_requires_cidr_on_create() {
        let mut task = subnet("minimal.example.com");
        task.cidr = None;
        let err = SubnetTask::check_changes(None, &task, &task.clone()).unwrap_err();
        assert!(matches!(err, Error::RequiredField(field) if field == "CIDR"));
    }

    #[tokio::test]
    async fn test_subnet_emitter_references_vpc() {
        let cloud = MockCloud::new("us-test-1");
        let mut graph = TaskGraph::new();
        graph
            .insert(Task::Vpc(Vpc {
                name: "minimal.example.com".to_string(),
                cidr: Some("172.20.0.0/16".to_string()),
                ..Default::default()
            }))
            .unwrap();

        let task = subnet("minimal.example.com");
        let mut target = EmitterTarget::new("minimal.example.com", "us-test-1");
        task.render_emitter(&context(&cloud, &graph), &mut target)
            .unwrap();

        let text = target.main_file().unwrap();
        assert!(text.contains("${aws_vpc.minimal.example.com.id}"));
        assert!(text.contains("172.20.32.0/19"));
    }

    #[tokio::test]
    async fn test_vpc_dns_attribute_update() {
        let cloud = MockCloud::new("us-test-1");
        let graph = TaskGraph::new();
        let ctx = context(&cloud, &graph);

        let mut vpc = Vpc {
            name: "minimal.example.com".to_string(),
            cidr: Some("172.20.0.0/16".to_string()),
            enable_dns_support: Some(true),
            enable_dns_hostnames: Some(false),
            ..Default::default()
        };
        let changes = vpc.clone();
        vpc.render_direct(&ctx, None, &changes).await.unwrap();

        // Flip a mutable attribute; the diff carries it and render applies
        // it in place.
        let mut updated = vpc.clone();
        updated.enable_dns_hostnames = Some(true);
        let actual = updated.find(&ctx).await.unwrap().unwrap();
        let changes = Vpc::changes(&actual, &updated, &ctx);
        assert!(Vpc::has_changes(&changes));
        Vpc::check_changes(Some(&actual), &updated, &changes).unwrap();
        updated
            .render_direct(&ctx, Some(&actual), &changes)
            .await
            .unwrap();

        assert!(cloud.vpcs()[0].enable_dns_hostnames);
    }
}
