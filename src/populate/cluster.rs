//! Cluster-spec completion
//!
//! Takes the sparse user-specified cluster and computes the full
//! specification, so that nothing downstream needs any brains of its own.
//! The input is never mutated: all work happens on an internal copy, and a
//! failure at any step means no partial result escapes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::api::{Cluster, EtcdClusterSpec, EtcdMemberSpec, InstanceGroup, NetworkingSpec};
use crate::cloud::{find_dns_hosted_zone, Cloud};
use crate::options::{resolve_component_images, SpecBuilder, TemplateFunctions};
use crate::vfs::{VfsContext, VfsPath};
use crate::{Error, Result};

use super::subnets::{assign_cidrs_to_subnets, assign_ip_ranges, DEFAULT_NETWORK_CIDR};

/// The etcd clusters every cluster runs
pub const ETCD_CLUSTERS: [&str; 2] = ["main", "events"];

/// Compute the full cluster specification from user input
///
/// The steps run in a fixed order because later ones read what earlier ones
/// fill: CIDR assignment before validation of ranges, store resolution
/// before the cluster-readable check, version normalization before the
/// options loader derives version-keyed defaults. Any failure aborts the
/// whole population.
pub async fn populate_cluster_spec(
    cluster: &Cluster,
    instance_groups: &[InstanceGroup],
    cloud: &dyn Cloud,
    vfs: &VfsContext,
) -> Result<Cluster> {
    cluster.validate(false)?;

    let mut full = cluster.clone();

    if full.spec.network_cidr.is_none() {
        full.spec.network_cidr = Some(DEFAULT_NETWORK_CIDR.to_string());
    }
    propagate_topology(&mut full);
    assign_cidrs_to_subnets(&mut full)?;
    assign_ip_ranges(&mut full)?;

    fill_defaults(&mut full, instance_groups)?;

    validate_etcd(&full, instance_groups)?;

    resolve_stores(&mut full, vfs)?;

    // Normalize the kubernetes version: a leading `v` is tolerated on input
    // but never stored.
    if let Some(version) = &full.spec.kubernetes_version {
        let normalized = version.trim().trim_start_matches('v').to_string();
        if *version != normalized {
            debug!(from = %version, to = %normalized, "normalized kubernetes version");
            full.spec.kubernetes_version = Some(normalized);
        }
    } else {
        return Err(Error::required_field("spec.kubernetesVersion"));
    }

    if full.spec.dns_zone.is_none() {
        let zone = find_dns_hosted_zone(cloud, &full.name).await?;
        info!(zone = %zone, "defaulted DNS zone");
        full.spec.dns_zone = Some(zone);
    }

    let tags = build_cloudup_tags(&full);
    let component_images = resolve_component_images(&full, vfs).await?;
    let functions = TemplateFunctions::new(
        full.clone(),
        instance_groups.to_vec(),
        tags,
        component_images,
    );
    full.spec = SpecBuilder::new(functions).build_complete_spec(&full.spec)?;

    full.validate(true)?;
    Ok(full)
}

/// Propagate the topology onto the subnet set
///
/// A private topology needs somewhere public to put bastions and the API
/// load balancer: every zone with a private subnet gets a utility subnet
/// alongside it, unless the user already declared one. This runs before
/// CIDR assignment so the synthesized subnets draw from the little pool.
fn propagate_topology(cluster: &mut Cluster) {
    use crate::api::{SubnetSpec, SubnetType, TopologyMode};

    if cluster.spec.topology.masters != TopologyMode::Private
        && cluster.spec.topology.nodes != TopologyMode::Private
    {
        return;
    }

    let private_zones: Vec<String> = cluster
        .spec
        .subnets
        .iter()
        .filter(|s| s.subnet_type == SubnetType::Private)
        .map(|s| s.zone.clone())
        .collect();
    for zone in private_zones {
        let covered = cluster
            .spec
            .subnets
            .iter()
            .any(|s| s.subnet_type == SubnetType::Utility && s.zone == zone);
        if !covered {
            cluster.spec.subnets.push(SubnetSpec {
                name: format!("utility-{zone}"),
                zone,
                cidr: None,
                subnet_type: SubnetType::Utility,
            });
        }
    }
}

/// Fill cluster-level defaults that are not CIDR-derived
fn fill_defaults(cluster: &mut Cluster, instance_groups: &[InstanceGroup]) -> Result<()> {
    match cluster.spec.cloud_provider.as_deref() {
        Some("aws") => {}
        Some(other) => {
            return Err(Error::validation(
                "spec.cloudProvider",
                format!("unsupported cloud provider {other:?}"),
            ));
        }
        None => return Err(Error::required_field("spec.cloudProvider")),
    }

    if cluster.spec.channel.is_none() {
        cluster.spec.channel = Some("stable".to_string());
    }
    if cluster.spec.networking.is_none() {
        cluster.spec.networking = Some(NetworkingSpec::kubenet());
    }
    if cluster.spec.master_public_name.is_none() {
        cluster.spec.master_public_name = Some(format!("api.{}", cluster.name));
    }
    if cluster.spec.master_internal_name.is_none() {
        cluster.spec.master_internal_name = Some(format!("api.internal.{}", cluster.name));
    }

    // Without explicit etcd configuration, each etcd cluster gets one member
    // per master instance group.
    if cluster.spec.etcd_clusters.is_empty() {
        let members: Vec<EtcdMemberSpec> = instance_groups
            .iter()
            .filter(|g| g.is_master())
            .map(|g| EtcdMemberSpec {
                name: g.name.clone(),
                instance_group: Some(g.name.clone()),
            })
            .collect();
        if members.is_empty() {
            return Err(Error::validation(
                "spec.etcdClusters",
                "no etcd configuration and no master instance groups to derive one from",
            ));
        }
        cluster.spec.etcd_clusters = ETCD_CLUSTERS
            .iter()
            .map(|name| EtcdClusterSpec {
                name: name.to_string(),
                members: members.clone(),
            })
            .collect();
    }

    Ok(())
}

/// Enforce the etcd quorum and reference invariants
fn validate_etcd(cluster: &Cluster, instance_groups: &[InstanceGroup]) -> Result<()> {
    for (i, etcd) in cluster.spec.etcd_clusters.iter().enumerate() {
        if etcd.name.is_empty() {
            return Err(Error::required_field(format!("spec.etcdClusters[{i}].name")));
        }

        let mut member_names = BTreeSet::new();
        let mut member_groups = BTreeSet::new();
        for (j, member) in etcd.members.iter().enumerate() {
            if member.name.is_empty() {
                return Err(Error::required_field(format!(
                    "spec.etcdClusters[{}].members[{j}].name",
                    etcd.name
                )));
            }
            let group = member.instance_group.as_deref().ok_or_else(|| {
                Error::required_field(format!(
                    "spec.etcdClusters[{}].members[{}].instanceGroup",
                    etcd.name, member.name
                ))
            })?;
            if !member_names.insert(member.name.clone()) {
                return Err(Error::validation(
                    format!("spec.etcdClusters[{}].members", etcd.name),
                    format!("duplicate member name {:?}", member.name),
                ));
            }
            if !member_groups.insert(group.to_string()) {
                return Err(Error::validation(
                    format!("spec.etcdClusters[{}].members", etcd.name),
                    format!("multiple members in instance group {group:?}"),
                ));
            }
            if !instance_groups.iter().any(|g| g.name == group) {
                return Err(Error::validation(
                    format!("spec.etcdClusters[{}].members[{}]", etcd.name, member.name),
                    format!("instance group {group:?} not found"),
                ));
            }
        }

        // etcd needs a strict majority to elect a leader; an even member
        // count buys no extra fault tolerance and can split-brain.
        if member_groups.len() % 2 == 0 {
            return Err(Error::QuorumViolation {
                etcd: etcd.name.clone(),
                count: member_groups.len(),
            });
        }
    }
    Ok(())
}

/// Resolve the secret, key and config stores relative to the config base
/// and enforce that each is cluster readable
fn resolve_stores(cluster: &mut Cluster, vfs: &VfsContext) -> Result<()> {
    let config_base = cluster
        .spec
        .config_base
        .as_deref()
        .ok_or_else(|| Error::required_field("spec.configBase"))?;
    let base = VfsPath::parse(config_base)?;

    let secret_store = match &cluster.spec.secret_store {
        Some(uri) => VfsPath::parse(uri)?,
        None => base.join("secrets"),
    };
    let key_store = match &cluster.spec.key_store {
        Some(uri) => VfsPath::parse(uri)?,
        None => base.join("pki"),
    };

    for store in [&base, &secret_store, &key_store] {
        if !store.is_cluster_readable(vfs) {
            return Err(Error::NotClusterReadable(store.to_string()));
        }
    }

    cluster.spec.secret_store = Some(secret_store.to_string());
    cluster.spec.key_store = Some(key_store.to_string());
    cluster.spec.config_store = Some(base.to_string());
    Ok(())
}

/// The tag set templates can probe with `HasTag`
pub fn build_cloudup_tags(cluster: &Cluster) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    tags.insert("_aws".to_string());

    if cluster.is_topology_public() {
        tags.insert("_topology_public".to_string());
    } else {
        tags.insert("_topology_private".to_string());
    }

    if let Some(networking) = &cluster.spec.networking {
        if let Some(provider) = networking.provider_name() {
            tags.insert(format!("_networking_{provider}"));
        }
        if networking.uses_cni() {
            tags.insert("_networking_cni".to_string());
        }
    }

    tags
}

/// Persist the completed cluster and instance-group documents to the
/// config store
pub async fn write_completed_spec(
    cluster: &Cluster,
    instance_groups: &[InstanceGroup],
    vfs: &VfsContext,
) -> Result<()> {
    let config_store = cluster
        .spec
        .config_store
        .as_deref()
        .ok_or_else(|| Error::required_field("spec.configStore"))?;
    let base = VfsPath::parse(config_store)?;

    let cluster_yaml = serde_yaml::to_string(cluster)?;
    vfs.write_file(&base.join("cluster.spec"), cluster_yaml.as_bytes())
        .await?;

    let mut groups = BTreeMap::new();
    for group in instance_groups {
        groups.insert(group.name.clone(), group);
    }
    for (name, group) in groups {
        let group_yaml = serde_yaml::to_string(group)?;
        vfs.write_file(
            &base.join("instancegroup").join(&name),
            group_yaml.as_bytes(),
        )
        .await?;
    }
    Ok(())
}
