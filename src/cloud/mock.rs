//! In-memory cloud for deterministic tests
//!
//! `MockCloud` implements the full [`Cloud`] surface against process-local
//! state: listings and mutations never leave memory, ids are minted from
//! counters in creation order, and hosted zones and images are pre-seeded
//! by the test harness. Two runs over the same inputs observe identical
//! cloud behavior, which is what the emitter's golden-file tests rely on.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    Cloud, CloudAutoscalingGroup, CloudDnsRecord, CloudHealthCheck, CloudIamRole,
    CloudIamRolePolicy, CloudImage, CloudKeyPair, CloudLaunchConfiguration, CloudLbAttributes,
    CloudListener, CloudLoadBalancer, CloudSecurityGroup, CloudSecurityGroupRule, CloudSubnet,
    CloudVpc, Filter, HostedZone,
};
use crate::{Error, Result};

/// The canonical hosted zone id every mock load balancer reports
const MOCK_ELB_ZONE_ID: &str = "Z35SXDOTRQ7X7K";

#[derive(Default)]
struct MockState {
    zones: Vec<HostedZone>,
    images: Vec<CloudImage>,
    vpcs: Vec<CloudVpc>,
    subnets: Vec<CloudSubnet>,
    security_groups: Vec<CloudSecurityGroup>,
    security_group_rules: Vec<CloudSecurityGroupRule>,
    load_balancers: Vec<CloudLoadBalancer>,
    iam_roles: Vec<CloudIamRole>,
    iam_role_policies: Vec<CloudIamRolePolicy>,
    key_pairs: Vec<CloudKeyPair>,
    launch_configurations: Vec<CloudLaunchConfiguration>,
    autoscaling_groups: Vec<CloudAutoscalingGroup>,
    dns_records: Vec<CloudDnsRecord>,
    next_id: u32,
}

impl MockState {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

/// An in-memory cloud account
pub struct MockCloud {
    region: String,
    state: Mutex<MockState>,
}

impl MockCloud {
    /// Create an empty mock account in the given region
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Seed a hosted zone
    pub fn seed_hosted_zone(&self, id: &str, name: &str) {
        let mut state = self.lock();
        state.zones.push(HostedZone {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// Seed a machine image
    pub fn seed_image(&self, id: &str, name: &str) {
        let mut state = self.lock();
        state.images.push(CloudImage {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// Seed an existing VPC, returning its minted id
    ///
    /// Used by shared-VPC tests, where the network pre-exists the cluster.
    pub fn seed_vpc(&self, cidr: &str) -> String {
        let mut state = self.lock();
        let id = state.mint("vpc");
        state.vpcs.push(CloudVpc {
            id: id.clone(),
            cidr: cidr.to_string(),
            enable_dns_support: true,
            enable_dns_hostnames: true,
            tags: BTreeMap::new(),
        });
        id
    }

    /// Snapshot of all subnets, for assertions
    pub fn subnets(&self) -> Vec<CloudSubnet> {
        self.lock().subnets.clone()
    }

    /// Snapshot of all VPCs, for assertions
    pub fn vpcs(&self) -> Vec<CloudVpc> {
        self.lock().vpcs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock cloud lock poisoned")
    }
}

#[async_trait]
impl Cloud for MockCloud {
    fn region(&self) -> &str {
        &self.region
    }

    async fn list_hosted_zones(&self) -> Result<Vec<HostedZone>> {
        Ok(self.lock().zones.clone())
    }

    async fn find_image(&self, name: &str) -> Result<Option<CloudImage>> {
        Ok(self.lock().images.iter().find(|i| i.name == name).cloned())
    }

    async fn describe_vpcs(&self, filter: &Filter) -> Result<Vec<CloudVpc>> {
        let state = self.lock();
        Ok(state
            .vpcs
            .iter()
            .filter(|v| filter.matches(&v.id, &v.tags))
            .cloned()
            .collect())
    }

    async fn create_vpc(&self, cidr: &str, dns_support: bool, dns_hostnames: bool) -> Result<CloudVpc> {
        let mut state = self.lock();
        let id = state.mint("vpc");
        let vpc = CloudVpc {
            id,
            cidr: cidr.to_string(),
            enable_dns_support: dns_support,
            enable_dns_hostnames: dns_hostnames,
            tags: BTreeMap::new(),
        };
        state.vpcs.push(vpc.clone());
        Ok(vpc)
    }

    async fn modify_vpc_attributes(&self, id: &str, dns_support: bool, dns_hostnames: bool) -> Result<()> {
        let mut state = self.lock();
        let vpc = state.vpcs.iter_mut().find(|v| v.id == id).ok_or_else(|| {
            Error::cloud_api("ModifyVpcAttribute", format!("vpc {id} not found"))
        })?;
        vpc.enable_dns_support = dns_support;
        vpc.enable_dns_hostnames = dns_hostnames;
        Ok(())
    }

    async fn describe_subnets(&self, filter: &Filter) -> Result<Vec<CloudSubnet>> {
        let state = self.lock();
        Ok(state
            .subnets
            .iter()
            .filter(|s| filter.matches(&s.id, &s.tags))
            .cloned()
            .collect())
    }

    async fn create_subnet(&self, vpc_id: &str, zone: &str, cidr: &str) -> Result<CloudSubnet> {
        let mut state = self.lock();
        if !state.vpcs.iter().any(|v| v.id == vpc_id) {
            return Err(Error::cloud_api(
                "CreateSubnet",
                format!("vpc {vpc_id} not found"),
            ));
        }
        let id = state.mint("subnet");
        let subnet = CloudSubnet {
            id,
            vpc_id: vpc_id.to_string(),
            cidr: cidr.to_string(),
            zone: zone.to_string(),
            tags: BTreeMap::new(),
        };
        state.subnets.push(subnet.clone());
        Ok(subnet)
    }

    async fn describe_security_groups(&self, filter: &Filter) -> Result<Vec<CloudSecurityGroup>> {
        let state = self.lock();
        Ok(state
            .security_groups
            .iter()
            .filter(|g| filter.matches(&g.id, &g.tags))
            .cloned()
            .collect())
    }

    async fn create_security_group(&self, vpc_id: &str, name: &str, description: &str) -> Result<CloudSecurityGroup> {
        let mut state = self.lock();
        let id = state.mint("sg");
        let group = CloudSecurityGroup {
            id,
            name: name.to_string(),
            description: description.to_string(),
            vpc_id: vpc_id.to_string(),
            tags: BTreeMap::new(),
        };
        state.security_groups.push(group.clone());
        Ok(group)
    }

    async fn describe_security_group_rules(&self, group_id: &str) -> Result<Vec<CloudSecurityGroupRule>> {
        let state = self.lock();
        Ok(state
            .security_group_rules
            .iter()
            .filter(|r| r.security_group_id == group_id)
            .cloned()
            .collect())
    }

    async fn authorize_security_group_rule(&self, rule: &CloudSecurityGroupRule) -> Result<()> {
        let mut state = self.lock();
        if state.security_group_rules.contains(rule) {
            return Err(Error::cloud_api(
                "AuthorizeSecurityGroupIngress",
                "rule already exists",
            ));
        }
        state.security_group_rules.push(rule.clone());
        Ok(())
    }

    async fn add_tags(&self, resource_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.lock();
        let target: Option<&mut BTreeMap<String, String>> =
            if let Some(v) = state.vpcs.iter_mut().find(|v| v.id == resource_id) {
                Some(&mut v.tags)
            } else if let Some(s) = state.subnets.iter_mut().find(|s| s.id == resource_id) {
                Some(&mut s.tags)
            } else if let Some(g) = state.security_groups.iter_mut().find(|g| g.id == resource_id) {
                Some(&mut g.tags)
            } else {
                None
            };
        match target {
            Some(existing) => {
                existing.extend(tags.clone());
                Ok(())
            }
            None => Err(Error::cloud_api(
                "CreateTags",
                format!("resource {resource_id} not found"),
            )),
        }
    }

    async fn describe_load_balancers(&self) -> Result<Vec<CloudLoadBalancer>> {
        Ok(self.lock().load_balancers.clone())
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        scheme: &str,
        subnet_ids: &[String],
        security_group_ids: &[String],
        listeners: &[CloudListener],
    ) -> Result<()> {
        let mut state = self.lock();
        if state.load_balancers.iter().any(|lb| lb.name == name) {
            return Err(Error::cloud_api(
                "CreateLoadBalancer",
                format!("load balancer {name} already exists"),
            ));
        }
        let lb = CloudLoadBalancer {
            name: name.to_string(),
            dns_name: format!("{name}.{}.elb.amazonaws.com", self.region),
            hosted_zone_id: MOCK_ELB_ZONE_ID.to_string(),
            scheme: scheme.to_string(),
            subnet_ids: subnet_ids.to_vec(),
            security_group_ids: security_group_ids.to_vec(),
            listeners: listeners.to_vec(),
            health_check: None,
            attributes: CloudLbAttributes::default(),
            tags: BTreeMap::new(),
        };
        state.load_balancers.push(lb);
        Ok(())
    }

    async fn create_load_balancer_listeners(&self, name: &str, listeners: &[CloudListener]) -> Result<()> {
        let mut state = self.lock();
        let lb = state
            .load_balancers
            .iter_mut()
            .find(|lb| lb.name == name)
            .ok_or_else(|| {
                Error::cloud_api(
                    "CreateLoadBalancerListeners",
                    format!("load balancer {name} not found"),
                )
            })?;
        lb.listeners.extend(listeners.iter().cloned());
        Ok(())
    }

    async fn configure_health_check(&self, name: &str, check: &CloudHealthCheck) -> Result<()> {
        let mut state = self.lock();
        let lb = state
            .load_balancers
            .iter_mut()
            .find(|lb| lb.name == name)
            .ok_or_else(|| {
                Error::cloud_api(
                    "ConfigureHealthCheck",
                    format!("load balancer {name} not found"),
                )
            })?;
        lb.health_check = Some(check.clone());
        Ok(())
    }

    async fn modify_load_balancer_attributes(&self, name: &str, attributes: &CloudLbAttributes) -> Result<()> {
        let mut state = self.lock();
        let lb = state
            .load_balancers
            .iter_mut()
            .find(|lb| lb.name == name)
            .ok_or_else(|| {
                Error::cloud_api(
                    "ModifyLoadBalancerAttributes",
                    format!("load balancer {name} not found"),
                )
            })?;
        lb.attributes = attributes.clone();
        Ok(())
    }

    async fn add_load_balancer_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.lock();
        let lb = state
            .load_balancers
            .iter_mut()
            .find(|lb| lb.name == name)
            .ok_or_else(|| {
                Error::cloud_api("AddTags", format!("load balancer {name} not found"))
            })?;
        lb.tags.extend(tags.clone());
        Ok(())
    }

    async fn get_iam_role(&self, name: &str) -> Result<Option<CloudIamRole>> {
        Ok(self
            .lock()
            .iam_roles
            .iter()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn create_iam_role(&self, role: &CloudIamRole) -> Result<()> {
        let mut state = self.lock();
        if state.iam_roles.iter().any(|r| r.name == role.name) {
            return Err(Error::cloud_api(
                "CreateRole",
                format!("role {} already exists", role.name),
            ));
        }
        state.iam_roles.push(role.clone());
        Ok(())
    }

    async fn update_iam_role(&self, role: &CloudIamRole) -> Result<()> {
        let mut state = self.lock();
        let existing = state
            .iam_roles
            .iter_mut()
            .find(|r| r.name == role.name)
            .ok_or_else(|| {
                Error::cloud_api("UpdateAssumeRolePolicy", format!("role {} not found", role.name))
            })?;
        existing.assume_role_policy_document = role.assume_role_policy_document.clone();
        Ok(())
    }

    async fn get_iam_role_policy(&self, role_name: &str, policy_name: &str) -> Result<Option<CloudIamRolePolicy>> {
        Ok(self
            .lock()
            .iam_role_policies
            .iter()
            .find(|p| p.role_name == role_name && p.policy_name == policy_name)
            .cloned())
    }

    async fn put_iam_role_policy(&self, policy: &CloudIamRolePolicy) -> Result<()> {
        let mut state = self.lock();
        state
            .iam_role_policies
            .retain(|p| !(p.role_name == policy.role_name && p.policy_name == policy.policy_name));
        state.iam_role_policies.push(policy.clone());
        Ok(())
    }

    async fn describe_key_pair(&self, name: &str) -> Result<Option<CloudKeyPair>> {
        Ok(self
            .lock()
            .key_pairs
            .iter()
            .find(|k| k.name == name)
            .cloned())
    }

    async fn import_key_pair(&self, name: &str, public_key: &str) -> Result<CloudKeyPair> {
        let mut state = self.lock();
        let key = CloudKeyPair {
            name: name.to_string(),
            fingerprint: crate::task::public_key_fingerprint(public_key),
        };
        state.key_pairs.push(key.clone());
        Ok(key)
    }

    async fn describe_launch_configuration(&self, name: &str) -> Result<Option<CloudLaunchConfiguration>> {
        Ok(self
            .lock()
            .launch_configurations
            .iter()
            .find(|lc| lc.name == name)
            .cloned())
    }

    async fn create_launch_configuration(&self, lc: &CloudLaunchConfiguration) -> Result<()> {
        let mut state = self.lock();
        if state
            .launch_configurations
            .iter()
            .any(|existing| existing.name == lc.name)
        {
            return Err(Error::cloud_api(
                "CreateLaunchConfiguration",
                format!("launch configuration {} already exists", lc.name),
            ));
        }
        state.launch_configurations.push(lc.clone());
        Ok(())
    }

    async fn describe_autoscaling_group(&self, name: &str) -> Result<Option<CloudAutoscalingGroup>> {
        Ok(self
            .lock()
            .autoscaling_groups
            .iter()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn create_autoscaling_group(&self, group: &CloudAutoscalingGroup) -> Result<()> {
        let mut state = self.lock();
        if state.autoscaling_groups.iter().any(|g| g.name == group.name) {
            return Err(Error::cloud_api(
                "CreateAutoScalingGroup",
                format!("group {} already exists", group.name),
            ));
        }
        state.autoscaling_groups.push(group.clone());
        Ok(())
    }

    async fn update_autoscaling_group(&self, group: &CloudAutoscalingGroup) -> Result<()> {
        let mut state = self.lock();
        let existing = state
            .autoscaling_groups
            .iter_mut()
            .find(|g| g.name == group.name)
            .ok_or_else(|| {
                Error::cloud_api(
                    "UpdateAutoScalingGroup",
                    format!("group {} not found", group.name),
                )
            })?;
        *existing = group.clone();
        Ok(())
    }

    async fn find_dns_record(&self, zone_id: &str, name: &str, record_type: &str) -> Result<Option<CloudDnsRecord>> {
        Ok(self
            .lock()
            .dns_records
            .iter()
            .find(|r| r.zone_id == zone_id && r.name == name && r.record_type == record_type)
            .cloned())
    }

    async fn upsert_dns_record(&self, record: &CloudDnsRecord) -> Result<()> {
        let mut state = self.lock();
        state.dns_records.retain(|r| {
            !(r.zone_id == record.zone_id
                && r.name == record.name
                && r.record_type == record.record_type)
        });
        state.dns_records.push(record.clone());
        Ok(())
    }
}
