//! Classic load balancer task
//!
//! The load balancer fronts the API servers. Its cloud identity is the ELB
//! name, which is length-restricted, so it usually differs from the logical
//! name. Listeners are keyed by the stringified front-end port; protocol is
//! TCP passthrough on both sides. The DNS name and canonical hosted zone id
//! are cloud-assigned outputs captured by a single post-create re-find.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::cloud::{
    build_tags, CloudHealthCheck, CloudLbAttributes, CloudListener, CloudLoadBalancer,
};
use crate::target::EmitterTarget;
use crate::{Error, Result};

use super::{field_change, TaskContext, TaskKind, TaskPayload, TaskRef};

/// A TCP listener; keyed externally by the front-end port
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbListener {
    /// Back-end instance port
    pub instance_port: i64,
}

/// Health check configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbHealthCheck {
    /// Check target (e.g. `TCP:443`)
    pub target: Option<String>,
    /// Consecutive successes before healthy
    pub healthy_threshold: Option<i64>,
    /// Consecutive failures before unhealthy
    pub unhealthy_threshold: Option<i64>,
    /// Seconds between checks
    pub interval: Option<i64>,
    /// Per-check timeout in seconds
    pub timeout: Option<i64>,
}

/// Access log configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbAccessLog {
    /// Whether access logs are emitted
    pub enabled: Option<bool>,
    /// Emit interval in minutes
    pub emit_interval: Option<i64>,
    /// Destination bucket
    pub s3_bucket_name: Option<String>,
    /// Destination key prefix
    pub s3_bucket_prefix: Option<String>,
}

/// Connection draining configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbConnectionDraining {
    /// Whether draining is enabled
    pub enabled: Option<bool>,
    /// Draining timeout in seconds
    pub timeout: Option<i64>,
}

/// Idle connection configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbConnectionSettings {
    /// Idle timeout in seconds
    pub idle_timeout: Option<i64>,
}

/// Cross-zone load balancing configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LbCrossZoneLoadBalancing {
    /// Whether requests cross zones
    pub enabled: Option<bool>,
}

/// The load balancer task
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancer {
    /// Logical name
    pub name: String,
    /// ELB name; the cloud identity, restricted in length and charset
    pub id: Option<String>,
    /// Cloud-assigned DNS name; output-only
    pub dns_name: Option<String>,
    /// Cloud-assigned canonical hosted zone id; output-only
    pub hosted_zone_id: Option<String>,
    /// `internet-facing` or `internal`
    pub scheme: Option<String>,
    /// Names of the subnet tasks the balancer spans; immutable once created
    pub subnets: Vec<String>,
    /// Names of the attached security group tasks
    pub security_groups: Vec<String>,
    /// Listeners keyed by stringified front-end port
    pub listeners: BTreeMap<String, LbListener>,
    /// Health check; only configured when present and changed
    pub health_check: Option<LbHealthCheck>,
    /// Access log attributes
    pub access_log: Option<LbAccessLog>,
    /// Connection draining attributes
    pub connection_draining: Option<LbConnectionDraining>,
    /// Connection settings attributes
    pub connection_settings: Option<LbConnectionSettings>,
    /// Cross-zone attributes
    pub cross_zone_load_balancing: Option<LbCrossZoneLoadBalancing>,
}

impl LoadBalancer {
    /// The ELB name used against the cloud
    fn elb_name(&self) -> Result<&str> {
        self.id
            .as_deref()
            .ok_or_else(|| Error::required_field("ID"))
    }

    fn from_cloud(&self, lb: &CloudLoadBalancer) -> Self {
        let mut listeners = BTreeMap::new();
        for listener in &lb.listeners {
            listeners.insert(
                listener.lb_port.to_string(),
                LbListener {
                    instance_port: listener.instance_port,
                },
            );
        }

        let attrs = &lb.attributes;
        Self {
            name: self.name.clone(),
            id: Some(lb.name.clone()),
            dns_name: Some(lb.dns_name.clone()),
            hosted_zone_id: Some(lb.hosted_zone_id.clone()),
            scheme: Some(lb.scheme.clone()),
            // Observed state carries cloud subnet/security-group ids; the
            // diff resolves the expected references before comparing.
            subnets: lb.subnet_ids.clone(),
            security_groups: lb.security_group_ids.clone(),
            listeners,
            health_check: lb.health_check.as_ref().map(|hc| LbHealthCheck {
                target: Some(hc.target.clone()),
                healthy_threshold: Some(hc.healthy_threshold),
                unhealthy_threshold: Some(hc.unhealthy_threshold),
                interval: Some(hc.interval),
                timeout: Some(hc.timeout),
            }),
            access_log: Some(LbAccessLog {
                enabled: attrs.access_log_enabled,
                emit_interval: attrs.access_log_emit_interval,
                s3_bucket_name: attrs.access_log_s3_bucket_name.clone(),
                s3_bucket_prefix: attrs.access_log_s3_bucket_prefix.clone(),
            }),
            connection_draining: Some(LbConnectionDraining {
                enabled: attrs.connection_draining_enabled,
                timeout: attrs.connection_draining_timeout,
            }),
            connection_settings: Some(LbConnectionSettings {
                idle_timeout: attrs.idle_timeout,
            }),
            cross_zone_load_balancing: Some(LbCrossZoneLoadBalancing {
                enabled: attrs.cross_zone_load_balancing,
            }),
        }
    }

    fn cloud_listeners(listeners: &BTreeMap<String, LbListener>) -> Result<Vec<CloudListener>> {
        listeners
            .iter()
            .map(|(port, listener)| {
                let lb_port: i64 = port.parse().map_err(|_| {
                    Error::validation(
                        format!("listener port {port:?}"),
                        "front-end port is not a number",
                    )
                })?;
                Ok(CloudListener {
                    lb_port,
                    instance_port: listener.instance_port,
                })
            })
            .collect()
    }

    /// Resolve the expected subnet references to cloud ids, if possible
    fn expected_subnet_ids(&self, ctx: &TaskContext<'_>) -> Option<Vec<String>> {
        self.subnets
            .iter()
            .map(|name| ctx.graph.cloud_id(TaskKind::Subnet, name).ok())
            .collect()
    }

    fn expected_security_group_ids(&self, ctx: &TaskContext<'_>) -> Result<Vec<String>> {
        self.security_groups
            .iter()
            .map(|name| ctx.graph.cloud_id(TaskKind::SecurityGroup, name))
            .collect()
    }

    fn attributes(&self) -> CloudLbAttributes {
        CloudLbAttributes {
            access_log_enabled: self.access_log.as_ref().and_then(|a| a.enabled),
            access_log_emit_interval: self.access_log.as_ref().and_then(|a| a.emit_interval),
            access_log_s3_bucket_name: self
                .access_log
                .as_ref()
                .and_then(|a| a.s3_bucket_name.clone()),
            access_log_s3_bucket_prefix: self
                .access_log
                .as_ref()
                .and_then(|a| a.s3_bucket_prefix.clone()),
            connection_draining_enabled: self.connection_draining.as_ref().and_then(|c| c.enabled),
            connection_draining_timeout: self.connection_draining.as_ref().and_then(|c| c.timeout),
            idle_timeout: self.connection_settings.as_ref().and_then(|c| c.idle_timeout),
            cross_zone_load_balancing: self
                .cross_zone_load_balancing
                .as_ref()
                .and_then(|c| c.enabled),
        }
    }

    fn has_attribute_changes(changes: &Self) -> bool {
        changes.access_log.is_some()
            || changes.connection_draining.is_some()
            || changes.connection_settings.is_some()
            || changes.cross_zone_load_balancing.is_some()
    }
}

#[async_trait]
impl TaskPayload for LoadBalancer {
    const KIND: TaskKind = TaskKind::LoadBalancer;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        let mut deps: Vec<TaskRef> = self
            .subnets
            .iter()
            .map(|s| TaskRef::new(TaskKind::Subnet, s))
            .collect();
        deps.extend(
            self.security_groups
                .iter()
                .map(|s| TaskRef::new(TaskKind::SecurityGroup, s)),
        );
        deps
    }

    fn cloud_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let elb_name = self.elb_name()?.to_string();
        let all = ctx.cloud.describe_load_balancers().await?;
        let matching: Vec<&CloudLoadBalancer> =
            all.iter().filter(|lb| lb.name == elb_name).collect();
        if matching.len() > 1 {
            return Err(Error::cloud_api(
                "DescribeLoadBalancers",
                format!("found multiple load balancers named {elb_name}"),
            ));
        }
        let Some(lb) = matching.first() else {
            return Ok(None);
        };

        debug!(elb = %elb_name, dns = %lb.dns_name, "found matching load balancer");
        let actual = self.from_cloud(lb);

        // Cloud-assigned outputs flow onto the expected task so dependents
        // and the diff both see them.
        if self.dns_name.is_none() {
            self.dns_name = actual.dns_name.clone();
        }
        if self.hosted_zone_id.is_none() {
            self.hosted_zone_id = actual.hosted_zone_id.clone();
        }

        Ok(Some(actual))
    }

    fn changes(actual: &Self, expected: &Self, ctx: &TaskContext<'_>) -> Self {
        // Subnet order coming back from the cloud is arbitrary: an equal
        // multiset of ids is not a change.
        let subnets = match expected.expected_subnet_ids(ctx) {
            Some(expected_ids) => {
                let actual_set: BTreeSet<&String> = actual.subnets.iter().collect();
                let expected_set: BTreeSet<&String> = expected_ids.iter().collect();
                if actual_set == expected_set {
                    Vec::new()
                } else {
                    expected.subnets.clone()
                }
            }
            None => expected.subnets.clone(),
        };

        let security_groups = match expected.expected_security_group_ids(ctx) {
            Ok(expected_ids) => {
                let actual_set: BTreeSet<&String> = actual.security_groups.iter().collect();
                let expected_set: BTreeSet<&String> = expected_ids.iter().collect();
                if actual_set == expected_set {
                    Vec::new()
                } else {
                    expected.security_groups.clone()
                }
            }
            Err(_) => expected.security_groups.clone(),
        };

        let listeners: BTreeMap<String, LbListener> = expected
            .listeners
            .iter()
            .filter(|(port, listener)| actual.listeners.get(*port) != Some(listener))
            .map(|(port, listener)| (port.clone(), listener.clone()))
            .collect();

        let health_check = match (&actual.health_check, &expected.health_check) {
            (_, None) => None,
            (Some(a), Some(e)) if a == e => None,
            (_, Some(e)) => Some(e.clone()),
        };

        Self {
            name: expected.name.clone(),
            id: None,
            dns_name: None,
            hosted_zone_id: None,
            scheme: field_change(&actual.scheme, &expected.scheme),
            subnets,
            security_groups,
            listeners,
            health_check,
            access_log: changed_block(&actual.access_log, &expected.access_log),
            connection_draining: changed_block(&actual.connection_draining, &expected.connection_draining),
            connection_settings: changed_block(&actual.connection_settings, &expected.connection_settings),
            cross_zone_load_balancing: changed_block(
                &actual.cross_zone_load_balancing,
                &expected.cross_zone_load_balancing,
            ),
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.scheme.is_some()
            || !changes.subnets.is_empty()
            || !changes.security_groups.is_empty()
            || !changes.listeners.is_empty()
            || changes.health_check.is_some()
            || Self::has_attribute_changes(changes)
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.id.is_none() {
                return Err(Error::required_field("ID"));
            }
            if expected.security_groups.is_empty() {
                return Err(Error::required_field("SecurityGroups"));
            }
            if expected.subnets.is_empty() {
                return Err(Error::required_field("Subnets"));
            }
            if let Some(access_log) = &expected.access_log {
                if access_log.enabled.is_none() {
                    return Err(Error::required_field("AccessLog.Enabled"));
                }
                if access_log.enabled == Some(true) && access_log.s3_bucket_name.is_none() {
                    return Err(Error::required_field("AccessLog.S3BucketName"));
                }
            }
            if let Some(draining) = &expected.connection_draining {
                if draining.enabled.is_none() {
                    return Err(Error::required_field("ConnectionDraining.Enabled"));
                }
            }
            if let Some(cross_zone) = &expected.cross_zone_load_balancing {
                if cross_zone.enabled.is_none() {
                    return Err(Error::required_field("CrossZoneLoadBalancing.Enabled"));
                }
            }
        }
        if actual.is_some() && !changes.subnets.is_empty() {
            return Err(Error::cannot_change("Subnets"));
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        changes: &Self,
    ) -> Result<()> {
        let elb_name = self.elb_name()?.to_string();

        if actual.is_none() {
            let subnet_ids = self.expected_subnet_ids(ctx).ok_or_else(|| {
                Error::validation(self.name.clone(), "load balancer subnets are not resolved")
            })?;
            let security_group_ids = self.expected_security_group_ids(ctx)?;
            let listeners = Self::cloud_listeners(&self.listeners)?;

            debug!(elb = %elb_name, "creating load balancer");
            ctx.cloud
                .create_load_balancer(
                    &elb_name,
                    self.scheme.as_deref().unwrap_or("internet-facing"),
                    &subnet_ids,
                    &security_group_ids,
                    &listeners,
                )
                .await?;

            // One post-create re-find captures the cloud-assigned DNS name
            // and hosted zone id; further retries are the caller's problem.
            let found = ctx
                .cloud
                .describe_load_balancers()
                .await?
                .into_iter()
                .find(|lb| lb.name == elb_name)
                .ok_or_else(|| {
                    Error::cloud_api("DescribeLoadBalancers", "newly created ELB not found")
                })?;
            self.dns_name = Some(found.dns_name);
            self.hosted_zone_id = Some(found.hosted_zone_id);
        } else if !changes.listeners.is_empty() {
            let listeners = Self::cloud_listeners(&changes.listeners)?;
            debug!(elb = %elb_name, count = listeners.len(), "creating listeners");
            ctx.cloud
                .create_load_balancer_listeners(&elb_name, &listeners)
                .await?;
        }

        // Health checks are only pushed when configured and actually
        // different.
        if let (Some(expected_check), Some(_)) = (&self.health_check, &changes.health_check) {
            let check = CloudHealthCheck {
                target: expected_check.target.clone().unwrap_or_default(),
                healthy_threshold: expected_check.healthy_threshold.unwrap_or(2),
                unhealthy_threshold: expected_check.unhealthy_threshold.unwrap_or(2),
                interval: expected_check.interval.unwrap_or(10),
                timeout: expected_check.timeout.unwrap_or(5),
            };
            debug!(elb = %elb_name, "configuring health check");
            ctx.cloud.configure_health_check(&elb_name, &check).await?;
        }

        if actual.is_none() || Self::has_attribute_changes(changes) {
            ctx.cloud
                .modify_load_balancer_attributes(&elb_name, &self.attributes())
                .await?;
        }

        ctx.cloud
            .add_load_balancer_tags(&elb_name, &build_tags(ctx.cluster_name, &self.name))
            .await
    }

    fn render_emitter(&self, ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let mut listeners = Vec::new();
        for (port, listener) in &self.listeners {
            let lb_port: i64 = port.parse().map_err(|_| {
                Error::validation(
                    format!("listener port {port:?}"),
                    "front-end port is not a number",
                )
            })?;
            listeners.push(json!({
                "instance_port": listener.instance_port,
                "instance_protocol": "TCP",
                "lb_port": lb_port,
                "lb_protocol": "TCP",
            }));
        }

        let subnets: Vec<String> = self
            .subnets
            .iter()
            .map(|s| ctx.graph.emitter_link(TaskKind::Subnet, s))
            .collect::<Result<_>>()?;
        let security_groups: Vec<String> = self
            .security_groups
            .iter()
            .map(|s| ctx.graph.emitter_link(TaskKind::SecurityGroup, s))
            .collect::<Result<_>>()?;

        let mut body = json!({
            "name": self.id,
            "listener": listeners,
            "security_groups": security_groups,
            "subnets": subnets,
        });
        if self.scheme.as_deref() == Some("internal") {
            body["internal"] = json!(true);
        }
        if let Some(check) = &self.health_check {
            body["health_check"] = json!({
                "target": check.target,
                "healthy_threshold": check.healthy_threshold,
                "unhealthy_threshold": check.unhealthy_threshold,
                "interval": check.interval,
                "timeout": check.timeout,
            });
        }
        if let Some(access_log) = &self.access_log {
            body["access_logs"] = json!({
                "enabled": access_log.enabled,
                "interval": access_log.emit_interval,
                "bucket": access_log.s3_bucket_name,
                "bucket_prefix": access_log.s3_bucket_prefix,
            });
        }
        if let Some(draining) = &self.connection_draining {
            body["connection_draining"] = json!(draining.enabled);
            if let Some(timeout) = draining.timeout {
                body["connection_draining_timeout"] = json!(timeout);
            }
        }
        if let Some(settings) = &self.connection_settings {
            if let Some(idle) = settings.idle_timeout {
                body["idle_timeout"] = json!(idle);
            }
        }
        if let Some(cross_zone) = &self.cross_zone_load_balancing {
            body["cross_zone_load_balancing"] = json!(cross_zone.enabled);
        }

        target.render_resource(Self::KIND.emitter_type(), &self.name, body)
    }
}

/// A nested attribute block counts as changed when the expected block is
/// present and differs from the observed one
fn changed_block<T: Clone + PartialEq>(actual: &Option<T>, expected: &Option<T>) -> Option<T> {
    match (actual, expected) {
        (_, None) => None,
        (Some(a), Some(e)) if a == e => None,
        (_, Some(e)) => Some(e.clone()),
    }
}
