//! Route53 alias record task
//!
//! Publishes the API endpoint name as an alias pointing at the API load
//! balancer. The record is matched by `(hosted zone, name, type)`; the
//! alias itself is matched against the balancer's DNS name and canonical
//! hosted zone id, tolerating the `dualstack.` prefix the cloud sometimes
//! reports.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::cloud::{alias_matches, AliasTarget, CloudDnsRecord};
use crate::target::EmitterTarget;
use crate::{Error, Result};

use super::{TaskContext, TaskKind, TaskPayload, TaskRef};

/// An alias record for the API endpoint
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DnsRecord {
    /// Fully-qualified record name (e.g. `api.minimal.example.com`)
    pub name: String,
    /// Hosted zone name the record lives in
    pub zone: Option<String>,
    /// Resolved hosted zone id; output-only
    pub zone_id: Option<String>,
    /// Name of the load balancer task the alias points at
    pub target_load_balancer: String,
    /// Observed alias target; output-only
    pub alias: Option<AliasTarget>,
}

impl DnsRecord {
    const RECORD_TYPE: &'static str = "A";

    async fn resolve_zone_id(&mut self, ctx: &TaskContext<'_>) -> Result<String> {
        if let Some(id) = &self.zone_id {
            return Ok(id.clone());
        }
        let zone_name = self
            .zone
            .as_deref()
            .ok_or_else(|| Error::required_field("Zone"))?;
        let zones = ctx.cloud.list_hosted_zones().await?;
        let zone = zones
            .iter()
            .find(|z| z.name.trim_end_matches('.') == zone_name.trim_end_matches('.'))
            .ok_or_else(|| Error::DnsZoneNotFound(zone_name.to_string()))?;
        self.zone_id = Some(zone.id.clone());
        Ok(zone.id.clone())
    }

    /// The (dns name, hosted zone id) the alias should point at, once the
    /// load balancer has reconciled
    fn target_endpoint(&self, ctx: &TaskContext<'_>) -> Option<(String, String)> {
        let lb = ctx.graph.load_balancer(&self.target_load_balancer)?;
        Some((lb.dns_name.clone()?, lb.hosted_zone_id.clone()?))
    }
}

#[async_trait]
impl TaskPayload for DnsRecord {
    const KIND: TaskKind = TaskKind::DnsRecord;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        vec![TaskRef::new(TaskKind::LoadBalancer, &self.target_load_balancer)]
    }

    fn cloud_id(&self) -> Option<&str> {
        self.zone_id.as_deref()
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let zone_id = self.resolve_zone_id(ctx).await?;
        let Some(record) = ctx
            .cloud
            .find_dns_record(&zone_id, &self.name, Self::RECORD_TYPE)
            .await?
        else {
            return Ok(None);
        };

        debug!(record = %self.name, zone = %zone_id, "found matching DNS record");
        Ok(Some(Self {
            name: self.name.clone(),
            zone: self.zone.clone(),
            zone_id: Some(zone_id),
            target_load_balancer: self.target_load_balancer.clone(),
            alias: record.alias,
        }))
    }

    fn changes(actual: &Self, expected: &Self, ctx: &TaskContext<'_>) -> Self {
        let alias = match (expected.target_endpoint(ctx), &actual.alias) {
            (Some((dns_name, zone_id)), Some(observed))
                if alias_matches(observed, &dns_name, &zone_id) =>
            {
                None
            }
            (Some((dns_name, zone_id)), _) => Some(AliasTarget {
                dns_name,
                hosted_zone_id: zone_id,
            }),
            // The balancer's endpoint is unknown; nothing to compare yet.
            (None, _) => None,
        };

        Self {
            name: expected.name.clone(),
            zone: None,
            zone_id: None,
            target_load_balancer: expected.target_load_balancer.clone(),
            alias,
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.alias.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, _changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.target_load_balancer.is_empty() {
                return Err(Error::required_field("TargetLoadBalancer"));
            }
            if expected.zone.is_none() && expected.zone_id.is_none() {
                return Err(Error::required_field("Zone"));
            }
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        _actual: Option<&Self>,
        _changes: &Self,
    ) -> Result<()> {
        let zone_id = self.resolve_zone_id(ctx).await?;
        let (dns_name, lb_zone_id) = self.target_endpoint(ctx).ok_or_else(|| {
            Error::validation(
                self.name.clone(),
                format!(
                    "load balancer {:?} has no DNS endpoint yet",
                    self.target_load_balancer
                ),
            )
        })?;

        debug!(record = %self.name, target = %dns_name, "upserting alias record");
        ctx.cloud
            .upsert_dns_record(&CloudDnsRecord {
                zone_id,
                name: self.name.clone(),
                record_type: Self::RECORD_TYPE.to_string(),
                alias: Some(AliasTarget {
                    dns_name,
                    hosted_zone_id: lb_zone_id,
                }),
            })
            .await
    }

    fn render_emitter(&self, ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let zone_id = self
            .zone_id
            .as_deref()
            .ok_or_else(|| Error::required_field("ZoneId"))?;
        let lb = &self.target_load_balancer;
        target.render_resource(
            Self::KIND.emitter_type(),
            &self.name,
            json!({
                "name": self.name,
                "type": Self::RECORD_TYPE,
                "zone_id": zone_id,
                "alias": {
                    "name": format!("${{aws_elb.{lb}.dns_name}}"),
                    "zone_id": format!("${{aws_elb.{lb}.zone_id}}"),
                    "evaluate_target_health": false,
                },
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Cloud, MockCloud};
    use crate::task::{LoadBalancer, Task, TaskGraph};

    fn graph_with_lb(dns_name: Option<&str>, zone_id: Option<&str>) -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph
            .insert(Task::LoadBalancer(LoadBalancer {
                name: "api.minimal.example.com".to_string(),
                id: Some("api-minimal-example-com".to_string()),
                dns_name: dns_name.map(str::to_string),
                hosted_zone_id: zone_id.map(str::to_string),
                ..Default::default()
            }))
            .unwrap();
        graph
    }

    fn record() -> DnsRecord {
        DnsRecord {
            name: "api.minimal.example.com".to_string(),
            zone: Some("example.com".to_string()),
            target_load_balancer: "api.minimal.example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_find_resolves_zone_id() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1AFAKE1ZON3YO", "example.com.");
        let graph = graph_with_lb(None, None);
        let ctx = TaskContext {
            cloud: &cloud,
            cluster_name: "minimal.example.com",
            graph: &graph,
        };

        let mut task = record();
        let actual = task.find(&ctx).await.unwrap();
        assert!(actual.is_none());
        assert_eq!(task.zone_id.as_deref(), Some("/hostedzone/Z1AFAKE1ZON3YO"));
    }

    #[tokio::test]
    async fn test_find_fails_on_unknown_zone() {
        let cloud = MockCloud::new("us-test-1");
        let graph = graph_with_lb(None, None);
        let ctx = TaskContext {
            cloud: &cloud,
            cluster_name: "minimal.example.com",
            graph: &graph,
        };

        let err = record().find(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::DnsZoneNotFound(_)));
    }

    #[tokio::test]
    async fn test_upsert_points_alias_at_load_balancer() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1AFAKE1ZON3YO", "example.com.");
        let graph = graph_with_lb(
            Some("api-minimal-example-com.us-test-1.elb.amazonaws.com"),
            Some("Z35SXDOTRQ7X7K"),
        );
        let ctx = TaskContext {
            cloud: &cloud,
            cluster_name: "minimal.example.com",
            graph: &graph,
        };

        let mut task = record();
        let changes = task.clone();
        task.render_direct(&ctx, None, &changes).await.unwrap();

        let stored = cloud
            .find_dns_record("/hostedzone/Z1AFAKE1ZON3YO", "api.minimal.example.com", "A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.alias.unwrap().dns_name,
            "api-minimal-example-com.us-test-1.elb.amazonaws.com"
        );
    }

    #[tokio::test]
    async fn test_dualstack_alias_is_not_a_change() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1AFAKE1ZON3YO", "example.com.");
        let graph = graph_with_lb(
            Some("api-minimal-example-com.us-test-1.elb.amazonaws.com"),
            Some("Z35SXDOTRQ7X7K"),
        );
        let ctx = TaskContext {
            cloud: &cloud,
            cluster_name: "minimal.example.com",
            graph: &graph,
        };

        // A pre-existing record written with the dualstack prefix.
        cloud
            .upsert_dns_record(&CloudDnsRecord {
                zone_id: "/hostedzone/Z1AFAKE1ZON3YO".to_string(),
                name: "api.minimal.example.com".to_string(),
                record_type: "A".to_string(),
                alias: Some(AliasTarget {
                    dns_name: "dualstack.api-minimal-example-com.us-test-1.elb.amazonaws.com."
                        .to_string(),
                    hosted_zone_id: "Z35SXDOTRQ7X7K".to_string(),
                }),
            })
            .await
            .unwrap();

        let mut task = record();
        let actual = task.find(&ctx).await.unwrap().unwrap();
        let delta = DnsRecord::changes(&actual, &task, &ctx);
        assert!(!DnsRecord::has_changes(&delta));
    }

    #[tokio::test]
    async fn test_emitter_references_load_balancer_outputs() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1AFAKE1ZON3YO", "example.com.");
        let graph = graph_with_lb(None, None);
        let ctx = TaskContext {
            cloud: &cloud,
            cluster_name: "minimal.example.com",
            graph: &graph,
        };

        let mut task = record();
        task.find(&ctx).await.unwrap();
        let mut target = EmitterTarget::new("minimal.example.com", "us-test-1");
        task.render_emitter(&ctx, &mut target).unwrap();

        let text = target.main_file().unwrap();
        assert!(text.contains("${aws_elb.api.minimal.example.com.dns_name}"));
        assert!(text.contains("/hostedzone/Z1AFAKE1ZON3YO"));
    }
}
