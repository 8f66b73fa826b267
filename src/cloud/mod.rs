//! Cloud provider abstraction
//!
//! The [`Cloud`] trait is the seam between the task model and a real cloud
//! account. Tasks only ever talk to this trait; the live account and the
//! in-memory mock both implement it, which is what makes reconciliation
//! deterministic under test.
//!
//! The surface is deliberately task-shaped rather than SDK-shaped: each
//! method corresponds to exactly one operation some task's `find` or
//! `render` performs.

mod mock;

pub use mock::MockCloud;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{Error, Result};

/// The tag every managed resource carries, valued with the cluster name
pub const TAG_CLUSTER: &str = "KubernetesCluster";

/// The conventional name tag
pub const TAG_NAME: &str = "Name";

/// Build the standard tag set for a named resource of a cluster
pub fn build_tags(cluster: &str, name: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_CLUSTER.to_string(), cluster.to_string());
    tags.insert(TAG_NAME.to_string(), name.to_string());
    tags
}

/// Identity filter for describe operations: by id when known, otherwise by
/// the cluster tag plus name tag
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// Match this cloud id exactly
    pub id: Option<String>,
    /// Match the `Name` tag
    pub name_tag: Option<String>,
    /// Match the `KubernetesCluster` tag
    pub cluster_tag: Option<String>,
}

impl Filter {
    /// Filter by cloud id
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    /// Filter by cluster and name tags
    pub fn by_tags(cluster: &str, name: &str) -> Self {
        Self {
            id: None,
            name_tag: Some(name.to_string()),
            cluster_tag: Some(cluster.to_string()),
        }
    }

    /// True iff a resource with the given id and tags passes this filter
    pub fn matches(&self, id: &str, tags: &BTreeMap<String, String>) -> bool {
        if let Some(want) = &self.id {
            return want == id;
        }
        if let Some(want) = &self.name_tag {
            if tags.get(TAG_NAME) != Some(want) {
                return false;
            }
        }
        if let Some(want) = &self.cluster_tag {
            if tags.get(TAG_CLUSTER) != Some(want) {
                return false;
            }
        }
        true
    }
}

/// A DNS hosted zone
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedZone {
    /// Zone id (e.g. `/hostedzone/Z1AFAKE1ZON3YO`)
    pub id: String,
    /// Zone name, with trailing dot (e.g. `example.com.`)
    pub name: String,
}

/// A machine image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudImage {
    /// Image id (e.g. `ami-12345678`)
    pub id: String,
    /// Image name
    pub name: String,
}

/// Observed state of a VPC
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudVpc {
    /// VPC id
    pub id: String,
    /// VPC CIDR block
    pub cidr: String,
    /// Whether DNS resolution is enabled
    pub enable_dns_support: bool,
    /// Whether DNS hostnames are assigned
    pub enable_dns_hostnames: bool,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
}

/// Observed state of a subnet
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudSubnet {
    /// Subnet id
    pub id: String,
    /// Owning VPC id
    pub vpc_id: String,
    /// Subnet CIDR block
    pub cidr: String,
    /// Availability zone
    pub zone: String,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
}

/// Observed state of a security group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudSecurityGroup {
    /// Security group id
    pub id: String,
    /// Group name
    pub name: String,
    /// Description (immutable in the cloud)
    pub description: String,
    /// Owning VPC id
    pub vpc_id: String,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
}

/// Direction of a security group rule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuleDirection {
    /// Inbound rule
    #[default]
    Ingress,
    /// Outbound rule
    Egress,
}

/// A security group rule, ingress or egress
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudSecurityGroupRule {
    /// Group the rule is attached to
    pub security_group_id: String,
    /// Rule direction
    pub direction: RuleDirection,
    /// Protocol (`tcp`, `udp`, or empty for all)
    pub protocol: String,
    /// Start of the port range
    pub from_port: Option<i64>,
    /// End of the port range
    pub to_port: Option<i64>,
    /// CIDR the rule applies to
    pub cidr: Option<String>,
    /// Peer security group the rule applies to
    pub source_group_id: Option<String>,
}

/// A load balancer listener: TCP passthrough on both sides
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudListener {
    /// Front-end port
    pub lb_port: i64,
    /// Back-end instance port
    pub instance_port: i64,
}

/// Load balancer health check configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudHealthCheck {
    /// Check target (e.g. `TCP:443`)
    pub target: String,
    /// Consecutive successes before healthy
    pub healthy_threshold: i64,
    /// Consecutive failures before unhealthy
    pub unhealthy_threshold: i64,
    /// Seconds between checks
    pub interval: i64,
    /// Per-check timeout in seconds
    pub timeout: i64,
}

/// Mutable load balancer attributes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudLbAttributes {
    /// Access log enablement
    pub access_log_enabled: Option<bool>,
    /// Access log emit interval in minutes
    pub access_log_emit_interval: Option<i64>,
    /// Access log bucket
    pub access_log_s3_bucket_name: Option<String>,
    /// Access log bucket prefix
    pub access_log_s3_bucket_prefix: Option<String>,
    /// Connection draining enablement
    pub connection_draining_enabled: Option<bool>,
    /// Connection draining timeout in seconds
    pub connection_draining_timeout: Option<i64>,
    /// Idle connection timeout in seconds
    pub idle_timeout: Option<i64>,
    /// Cross-zone load balancing enablement
    pub cross_zone_load_balancing: Option<bool>,
}

/// Observed state of a load balancer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudLoadBalancer {
    /// Load balancer name (its cloud identity)
    pub name: String,
    /// Cloud-assigned DNS name
    pub dns_name: String,
    /// Cloud-assigned canonical hosted zone id
    pub hosted_zone_id: String,
    /// `internet-facing` or `internal`
    pub scheme: String,
    /// Attached subnet ids
    pub subnet_ids: Vec<String>,
    /// Attached security group ids
    pub security_group_ids: Vec<String>,
    /// Listeners
    pub listeners: Vec<CloudListener>,
    /// Health check, when configured
    pub health_check: Option<CloudHealthCheck>,
    /// Mutable attributes
    pub attributes: CloudLbAttributes,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
}

/// Observed state of an IAM role
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudIamRole {
    /// Role name
    pub name: String,
    /// Assume-role policy document (JSON)
    pub assume_role_policy_document: String,
}

/// Observed state of an inline IAM role policy
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudIamRolePolicy {
    /// Owning role name
    pub role_name: String,
    /// Policy name
    pub policy_name: String,
    /// Policy document (JSON)
    pub policy_document: String,
}

/// Observed state of an imported SSH key pair
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudKeyPair {
    /// Key pair name
    pub name: String,
    /// Public key fingerprint
    pub fingerprint: String,
}

/// Observed state of a launch configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudLaunchConfiguration {
    /// Launch configuration name
    pub name: String,
    /// Machine image id
    pub image_id: String,
    /// Machine type
    pub instance_type: String,
    /// SSH key pair name
    pub key_name: Option<String>,
    /// IAM instance profile name
    pub iam_instance_profile: Option<String>,
    /// Attached security group ids
    pub security_group_ids: Vec<String>,
    /// Whether instances receive a public IP
    pub associate_public_ip: bool,
    /// Instance user data
    pub user_data: Option<String>,
    /// Root volume size in GB
    pub root_volume_size: Option<i64>,
    /// Root volume type
    pub root_volume_type: Option<String>,
    /// Spot price bid, when spot
    pub spot_price: Option<String>,
}

/// Observed state of an auto-scaling group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudAutoscalingGroup {
    /// Group name
    pub name: String,
    /// Launch configuration name
    pub launch_configuration: String,
    /// Minimum size
    pub min_size: i64,
    /// Maximum size
    pub max_size: i64,
    /// Subnet ids the group spans
    pub subnet_ids: Vec<String>,
    /// Tags propagated to instances
    pub tags: BTreeMap<String, String>,
}

/// An alias target pointing a DNS record at a load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasTarget {
    /// Target DNS name; may carry a `dualstack.` prefix
    pub dns_name: String,
    /// Target hosted zone id
    pub hosted_zone_id: String,
}

/// A DNS record in a hosted zone
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloudDnsRecord {
    /// Hosted zone the record lives in
    pub zone_id: String,
    /// Fully-qualified record name
    pub name: String,
    /// Record type (only `A` in this tree)
    pub record_type: String,
    /// Alias target
    pub alias: Option<AliasTarget>,
}

/// The cloud provider seam
///
/// Every method is a single remote call; failures come back as
/// [`Error::CloudApi`] wrapping the operation name. Implementations must be
/// safe to call from a single-threaded reconciliation loop.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// The region this handle is bound to
    fn region(&self) -> &str;

    /// List all hosted zones visible to the account
    async fn list_hosted_zones(&self) -> Result<Vec<HostedZone>>;

    /// Resolve an image by name
    async fn find_image(&self, name: &str) -> Result<Option<CloudImage>>;

    /// List VPCs passing the filter
    async fn describe_vpcs(&self, filter: &Filter) -> Result<Vec<CloudVpc>>;

    /// Create a VPC, returning its observed state
    async fn create_vpc(&self, cidr: &str, dns_support: bool, dns_hostnames: bool) -> Result<CloudVpc>;

    /// Change the DNS attributes of a VPC
    async fn modify_vpc_attributes(&self, id: &str, dns_support: bool, dns_hostnames: bool) -> Result<()>;

    /// List subnets passing the filter
    async fn describe_subnets(&self, filter: &Filter) -> Result<Vec<CloudSubnet>>;

    /// Create a subnet, returning its observed state
    async fn create_subnet(&self, vpc_id: &str, zone: &str, cidr: &str) -> Result<CloudSubnet>;

    /// List security groups passing the filter
    async fn describe_security_groups(&self, filter: &Filter) -> Result<Vec<CloudSecurityGroup>>;

    /// Create a security group, returning its observed state
    async fn create_security_group(&self, vpc_id: &str, name: &str, description: &str) -> Result<CloudSecurityGroup>;

    /// List the rules attached to a security group
    async fn describe_security_group_rules(&self, group_id: &str) -> Result<Vec<CloudSecurityGroupRule>>;

    /// Authorize a security group rule
    async fn authorize_security_group_rule(&self, rule: &CloudSecurityGroupRule) -> Result<()>;

    /// Apply tags to an EC2-side resource
    async fn add_tags(&self, resource_id: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    /// List every load balancer in the account
    async fn describe_load_balancers(&self) -> Result<Vec<CloudLoadBalancer>>;

    /// Create a load balancer; attributes and health check are configured
    /// separately
    async fn create_load_balancer(
        &self,
        name: &str,
        scheme: &str,
        subnet_ids: &[String],
        security_group_ids: &[String],
        listeners: &[CloudListener],
    ) -> Result<()>;

    /// Add listeners to an existing load balancer
    async fn create_load_balancer_listeners(&self, name: &str, listeners: &[CloudListener]) -> Result<()>;

    /// Configure the health check on a load balancer
    async fn configure_health_check(&self, name: &str, check: &CloudHealthCheck) -> Result<()>;

    /// Modify mutable load balancer attributes
    async fn modify_load_balancer_attributes(&self, name: &str, attributes: &CloudLbAttributes) -> Result<()>;

    /// Apply tags to a load balancer
    async fn add_load_balancer_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    /// Fetch an IAM role by name
    async fn get_iam_role(&self, name: &str) -> Result<Option<CloudIamRole>>;

    /// Create an IAM role
    async fn create_iam_role(&self, role: &CloudIamRole) -> Result<()>;

    /// Replace the assume-role policy document of an existing role
    async fn update_iam_role(&self, role: &CloudIamRole) -> Result<()>;

    /// Fetch an inline role policy
    async fn get_iam_role_policy(&self, role_name: &str, policy_name: &str) -> Result<Option<CloudIamRolePolicy>>;

    /// Create or replace an inline role policy
    async fn put_iam_role_policy(&self, policy: &CloudIamRolePolicy) -> Result<()>;

    /// Fetch an imported key pair by name
    async fn describe_key_pair(&self, name: &str) -> Result<Option<CloudKeyPair>>;

    /// Import a public key, returning the observed state
    async fn import_key_pair(&self, name: &str, public_key: &str) -> Result<CloudKeyPair>;

    /// Fetch a launch configuration by name
    async fn describe_launch_configuration(&self, name: &str) -> Result<Option<CloudLaunchConfiguration>>;

    /// Create a launch configuration
    async fn create_launch_configuration(&self, lc: &CloudLaunchConfiguration) -> Result<()>;

    /// Fetch an auto-scaling group by name
    async fn describe_autoscaling_group(&self, name: &str) -> Result<Option<CloudAutoscalingGroup>>;

    /// Create an auto-scaling group
    async fn create_autoscaling_group(&self, group: &CloudAutoscalingGroup) -> Result<()>;

    /// Update a mutable subset of an auto-scaling group
    async fn update_autoscaling_group(&self, group: &CloudAutoscalingGroup) -> Result<()>;

    /// Find a DNS record by zone, name and type
    async fn find_dns_record(&self, zone_id: &str, name: &str, record_type: &str) -> Result<Option<CloudDnsRecord>>;

    /// Create or replace a DNS record
    async fn upsert_dns_record(&self, record: &CloudDnsRecord) -> Result<()>;
}

/// True iff an alias target points at the load balancer with the given DNS
/// name and canonical hosted zone id
///
/// The alias DNS name may carry a `dualstack.` prefix; trailing dots are
/// ignored on both sides.
pub fn alias_matches(alias: &AliasTarget, dns_name: &str, hosted_zone_id: &str) -> bool {
    if alias.hosted_zone_id != hosted_zone_id {
        return false;
    }
    let alias_name = alias.dns_name.trim_end_matches('.');
    let lb_name = dns_name.trim_end_matches('.');
    alias_name == lb_name || alias_name == format!("dualstack.{lb_name}")
}

/// Discover the hosted zone for a cluster name by longest-suffix match
///
/// `minimal.example.com` matches the zone `example.com.`; when several zones
/// are suffixes of the name the longest wins, and a tie at the longest
/// length is ambiguous.
pub async fn find_dns_hosted_zone(cloud: &dyn Cloud, cluster_name: &str) -> Result<String> {
    let zones = cloud.list_hosted_zones().await?;
    let name = cluster_name.trim_end_matches('.');

    let mut best: Vec<&HostedZone> = Vec::new();
    let mut best_len = 0;
    for zone in &zones {
        let zone_name = zone.name.trim_end_matches('.');
        let matches = name == zone_name || name.ends_with(&format!(".{zone_name}"));
        if !matches {
            continue;
        }
        match zone_name.len().cmp(&best_len) {
            std::cmp::Ordering::Greater => {
                best_len = zone_name.len();
                best = vec![zone];
            }
            std::cmp::Ordering::Equal => best.push(zone),
            std::cmp::Ordering::Less => {}
        }
    }

    match best.len() {
        0 => Err(Error::DnsZoneNotFound(cluster_name.to_string())),
        1 => Ok(best[0].name.trim_end_matches('.').to_string()),
        _ => Err(Error::DnsZoneAmbiguous(cluster_name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_dns_hosted_zone_suffix_match() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1AFAKE1ZON3YO", "example.com.");

        let zone = find_dns_hosted_zone(&cloud, "minimal.example.com")
            .await
            .unwrap();
        assert_eq!(zone, "example.com");
    }

    #[tokio::test]
    async fn test_find_dns_hosted_zone_prefers_longest() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1", "example.com.");
        cloud.seed_hosted_zone("/hostedzone/Z2", "dev.example.com.");

        let zone = find_dns_hosted_zone(&cloud, "cluster.dev.example.com")
            .await
            .unwrap();
        assert_eq!(zone, "dev.example.com");
    }

    #[tokio::test]
    async fn test_find_dns_hosted_zone_not_found() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1", "other.org.");

        let err = find_dns_hosted_zone(&cloud, "minimal.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DnsZoneNotFound(_)));
    }

    #[tokio::test]
    async fn test_find_dns_hosted_zone_ambiguous() {
        let cloud = MockCloud::new("us-test-1");
        cloud.seed_hosted_zone("/hostedzone/Z1", "example.com.");
        cloud.seed_hosted_zone("/hostedzone/Z2", "example.com.");

        let err = find_dns_hosted_zone(&cloud, "minimal.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DnsZoneAmbiguous(_)));
    }

    #[test]
    fn test_filter_by_id_ignores_tags() {
        let filter = Filter::by_id("vpc-0001");
        assert!(filter.matches("vpc-0001", &BTreeMap::new()));
        assert!(!filter.matches("vpc-0002", &build_tags("c", "n")));
    }

    #[test]
    fn test_filter_by_tags() {
        let filter = Filter::by_tags("minimal.example.com", "main");
        let tags = build_tags("minimal.example.com", "main");
        assert!(filter.matches("anything", &tags));

        let wrong_cluster = build_tags("other.example.com", "main");
        assert!(!filter.matches("anything", &wrong_cluster));
    }
}
