//! Cluster specification types
//!
//! A [`Cluster`] is the canonical entity the whole engine revolves around.
//! The user supplies a sparse spec; [`populate_cluster_spec`] fills in every
//! field downstream provisioning needs and returns the completed, immutable
//! form.
//!
//! [`populate_cluster_spec`]: crate::populate::populate_cluster_spec

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::net::Cidr;
use crate::{Error, Result};

/// A cluster: DNS-valid name plus specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Cluster name; must be a valid DNS name, and is also the DNS suffix
    /// under which cluster records are published
    pub name: String,

    /// The cluster specification
    pub spec: ClusterSpec,
}

/// Specification for a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Channel to pull defaults (images, component versions) from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Base URI for cluster configuration storage (cluster-readable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_base: Option<String>,

    /// Cloud provider identifier (only `aws` in this tree)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,

    /// Kubernetes version to run; normalized with any leading `v` stripped.
    /// May also be a base URL for CI builds, in which case component image
    /// tags are fetched from under it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// The IPv4 CIDR used by the cloud network (VPC)
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "networkCIDR")]
    pub network_cidr: Option<String>,

    /// Existing cloud network (VPC) id when joining a shared network
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "networkID")]
    pub network_id: Option<String>,

    /// The aggregate IP space pod and service ranges are carved from;
    /// the kubelet does not SNAT traffic within it
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "nonMasqueradeCIDR")]
    pub non_masquerade_cidr: Option<String>,

    /// Cluster subnets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,

    /// Network topology for masters and nodes
    #[serde(default)]
    pub topology: Topology,

    /// Etcd clusters (typically `main` and `events`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_clusters: Vec<EtcdClusterSpec>,

    /// DNS hosted zone to publish records into; discovered from the cluster
    /// name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_zone: Option<String>,

    /// Public DNS name of the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_public_name: Option<String>,

    /// Internal DNS name of the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_internal_name: Option<String>,

    /// Location of the secret store (cluster-readable URI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_store: Option<String>,

    /// Location of the key store (cluster-readable URI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_store: Option<String>,

    /// Location of the config store (cluster-readable URI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_store: Option<String>,

    /// The range from which service cluster IPs are allocated
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "serviceClusterIPRange")]
    pub service_cluster_ip_range: Option<String>,

    /// CIDRs allowed SSH access to nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_access: Vec<String>,

    /// CIDRs allowed access to the API
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_access: Vec<String>,

    /// Cloud-level labels applied to every managed resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cloud_labels: BTreeMap<String, String>,

    /// Pod networking provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<NetworkingSpec>,

    /// kube-controller-manager sub-spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_controller_manager: Option<KubeControllerManagerConfig>,

    /// kube-apiserver sub-spec
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "kubeAPIServer")]
    pub kube_apiserver: Option<KubeApiServerConfig>,

    /// kube-dns sub-spec
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "kubeDNS")]
    pub kube_dns: Option<KubeDnsConfig>,

    /// Container runtime sub-spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerConfig>,
}

/// A cluster subnet
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Subnet name, unique within the cluster
    pub name: String,

    /// Availability zone the subnet lives in
    pub zone: String,

    /// Subnet CIDR; auto-assigned from the network CIDR when empty
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "cidr")]
    pub cidr: Option<String>,

    /// Subnet type
    #[serde(default, rename = "type")]
    pub subnet_type: SubnetType,
}

/// The role a subnet plays in the topology
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum SubnetType {
    /// Instances receive public addresses and route directly to the internet
    #[default]
    Public,
    /// Instances are reached through NAT; no public addresses
    Private,
    /// Small public subnet carrying utility instances (bastions, NAT gateways)
    Utility,
}

/// Whether a tier of the cluster sits on public or private subnets
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Directly addressable from the internet
    #[default]
    Public,
    /// Reached via a bastion; no public addresses
    Private,
}

/// Network topology descriptor
///
/// A plain value type: it is copied into the completed spec rather than
/// shared, so normalization cannot lose or alias it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Placement of master instances
    #[serde(default)]
    pub masters: TopologyMode,

    /// Placement of node instances
    #[serde(default)]
    pub nodes: TopologyMode,
}

/// An etcd cluster (e.g. `main`, `events`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Etcd cluster name
    pub name: String,

    /// Members, ordered; each references a master instance group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<EtcdMemberSpec>,
}

/// A single etcd member
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdMemberSpec {
    /// Member name, unique within its etcd cluster
    pub name: String,

    /// Name of the instance group this member runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
}

/// Pod networking provider selection
///
/// Exactly one provider should be set; [`NetworkingSpec::provider_name`]
/// reports which one.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    /// Kubenet networking (the default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubenet: Option<EmptyNetworkingSpec>,

    /// Generic CNI networking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni: Option<EmptyNetworkingSpec>,

    /// Weave overlay networking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weave: Option<EmptyNetworkingSpec>,

    /// Calico networking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calico: Option<EmptyNetworkingSpec>,
}

/// Marker for networking providers that carry no options
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EmptyNetworkingSpec {}

impl NetworkingSpec {
    /// A spec selecting kubenet networking
    pub fn kubenet() -> Self {
        Self {
            kubenet: Some(EmptyNetworkingSpec {}),
            ..Default::default()
        }
    }

    /// A spec selecting weave networking
    pub fn weave() -> Self {
        Self {
            weave: Some(EmptyNetworkingSpec {}),
            ..Default::default()
        }
    }

    /// Name of the selected provider, or `None` if nothing is set
    pub fn provider_name(&self) -> Option<&'static str> {
        if self.kubenet.is_some() {
            Some("kubenet")
        } else if self.cni.is_some() {
            Some("cni")
        } else if self.weave.is_some() {
            Some("weave")
        } else if self.calico.is_some() {
            Some("calico")
        } else {
            None
        }
    }

    /// True when the provider needs a CNI overlay (anything but kubenet)
    pub fn uses_cni(&self) -> bool {
        matches!(self.provider_name(), Some(p) if p != "kubenet")
    }
}

/// kube-controller-manager configuration carried in the cluster spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeControllerManagerConfig {
    /// The pod CIDR handed to the controller manager
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "clusterCIDR")]
    pub cluster_cidr: Option<String>,

    /// Cloud provider flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
}

/// kube-apiserver configuration carried in the cluster spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiServerConfig {
    /// Container image to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Cloud provider flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,

    /// Service cluster IP range flag
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "serviceClusterIPRange")]
    pub service_cluster_ip_range: Option<String>,

    /// Whether anonymous requests are allowed; defaulted off on 1.5+
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_auth: Option<bool>,
}

/// kube-dns configuration carried in the cluster spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeDnsConfig {
    /// Number of kube-dns replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Cluster DNS domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// The well-known service IP kube-dns listens on
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "serverIP")]
    pub server_ip: Option<String>,
}

/// Container runtime configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    /// Docker version, derived from the kubernetes version when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Daemon log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Storage driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

impl Cluster {
    /// Returns true if this cluster joins an existing cloud network
    /// rather than owning one
    pub fn shared_vpc(&self) -> bool {
        self.spec
            .network_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }

    /// True when both masters and nodes sit on public subnets
    pub fn is_topology_public(&self) -> bool {
        self.spec.topology.masters == TopologyMode::Public
            && self.spec.topology.nodes == TopologyMode::Public
    }

    /// True when both masters and nodes sit on private subnets
    pub fn is_topology_private(&self) -> bool {
        self.spec.topology.masters == TopologyMode::Private
            && self.spec.topology.nodes == TopologyMode::Private
    }

    /// True when only the masters are private
    pub fn is_topology_private_masters(&self) -> bool {
        self.spec.topology.masters == TopologyMode::Private
            && self.spec.topology.nodes == TopologyMode::Public
    }

    /// Find a subnet by name
    pub fn subnet(&self, name: &str) -> Option<&SubnetSpec> {
        self.spec.subnets.iter().find(|s| s.name == name)
    }

    /// Validate the cluster
    ///
    /// With `strict` false this is the shallow check run on raw user input;
    /// with `strict` true it is the full post-normalization check, which
    /// additionally requires every field the normalizer is responsible for
    /// filling and enforces the subnet and IP-range invariants.
    pub fn validate(&self, strict: bool) -> Result<()> {
        validate_dns_name(&self.name)?;

        let mut seen = std::collections::BTreeSet::new();
        for (i, subnet) in self.spec.subnets.iter().enumerate() {
            let path = format!("spec.subnets[{i}]");
            if subnet.name.is_empty() {
                return Err(Error::validation(format!("{path}.name"), "name is required"));
            }
            if subnet.zone.is_empty() {
                return Err(Error::validation(format!("{path}.zone"), "zone is required"));
            }
            if !seen.insert(subnet.name.clone()) {
                return Err(Error::validation(
                    format!("{path}.name"),
                    format!("duplicate subnet name {:?}", subnet.name),
                ));
            }
        }

        if let Some(cidr) = &self.spec.network_cidr {
            let parsed: Cidr = cidr.parse()?;
            if !parsed.is_ipv4() {
                return Err(Error::validation(
                    "spec.networkCIDR",
                    "must be an IPv4 CIDR",
                ));
            }
        }

        if !strict {
            return Ok(());
        }

        let network_cidr: Cidr = self
            .spec
            .network_cidr
            .as_deref()
            .ok_or_else(|| Error::required_field("spec.networkCIDR"))?
            .parse()?;

        // Every subnet must have been assigned a CIDR inside the network
        // CIDR, pairwise disjoint from its siblings.
        let mut parsed_subnets: Vec<(&str, Cidr)> = Vec::new();
        for subnet in &self.spec.subnets {
            let cidr_str = subnet.cidr.as_deref().ok_or_else(|| {
                Error::required_field(format!("spec.subnets[{}].cidr", subnet.name))
            })?;
            let cidr: Cidr = cidr_str.parse()?;
            if !network_cidr.contains_cidr(&cidr) {
                return Err(Error::validation(
                    format!("spec.subnets[{}].cidr", subnet.name),
                    format!("{cidr} is not contained in networkCIDR {network_cidr}"),
                ));
            }
            for (other_name, other) in &parsed_subnets {
                if cidr.overlaps(other) {
                    return Err(Error::CidrOverlap(
                        format!("subnet {}: {cidr}", subnet.name),
                        format!("subnet {other_name}: {other}"),
                    ));
                }
            }
            parsed_subnets.push((subnet.name.as_str(), cidr));
        }

        if self.spec.kubernetes_version.is_none() {
            return Err(Error::required_field("spec.kubernetesVersion"));
        }
        if self.spec.networking.is_none() {
            return Err(Error::required_field("spec.networking"));
        }
        for (field, value) in [
            ("spec.configStore", &self.spec.config_store),
            ("spec.secretStore", &self.spec.secret_store),
            ("spec.keyStore", &self.spec.key_store),
        ] {
            if value.is_none() {
                return Err(Error::required_field(field));
            }
        }

        // Service and pod ranges are carved out of the non-masquerade range
        // and must not collide with each other.
        let non_masq: Cidr = self
            .spec
            .non_masquerade_cidr
            .as_deref()
            .ok_or_else(|| Error::required_field("spec.nonMasqueradeCIDR"))?
            .parse()?;
        let service_range: Cidr = self
            .spec
            .service_cluster_ip_range
            .as_deref()
            .ok_or_else(|| Error::required_field("spec.serviceClusterIPRange"))?
            .parse()?;
        if !non_masq.contains_cidr(&service_range) {
            return Err(Error::validation(
                "spec.serviceClusterIPRange",
                format!("{service_range} is not contained in nonMasqueradeCIDR {non_masq}"),
            ));
        }
        if let Some(cluster_cidr) = self
            .spec
            .kube_controller_manager
            .as_ref()
            .and_then(|kcm| kcm.cluster_cidr.as_deref())
        {
            let cluster_cidr: Cidr = cluster_cidr.parse()?;
            if !non_masq.contains_cidr(&cluster_cidr) {
                return Err(Error::validation(
                    "spec.kubeControllerManager.clusterCIDR",
                    format!("{cluster_cidr} is not contained in nonMasqueradeCIDR {non_masq}"),
                ));
            }
            if cluster_cidr.overlaps(&service_range) {
                return Err(Error::CidrOverlap(
                    format!("clusterCIDR {cluster_cidr}"),
                    format!("serviceClusterIPRange {service_range}"),
                ));
            }
        }

        Ok(())
    }
}

/// Check that a name is usable as a DNS name (lowercase, dotted)
fn validate_dns_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::required_field("name"));
    }
    if !name.contains('.') {
        return Err(Error::validation(
            "name",
            "cluster name must be a fully-qualified DNS name (e.g. mycluster.example.com)",
        ));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if !valid {
        return Err(Error::validation(
            "name",
            "cluster name may only contain lowercase letters, digits, '-' and '.'",
        ));
    }
    Ok(())
}
