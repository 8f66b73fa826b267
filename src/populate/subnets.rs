//! Automatic CIDR assignment
//!
//! Subnets the user left without a CIDR are carved deterministically out of
//! the network CIDR; the pod and service ranges are carved out of the
//! non-masquerade CIDR. Users who want full control simply set every CIDR
//! themselves and none of this runs.

use tracing::{debug, info};

use crate::api::{Cluster, KubeControllerManagerConfig, SubnetSpec, SubnetType};
use crate::net::{split_into_8_subnets, Cidr};
use crate::{Error, Result};

/// The non-masquerade range used when the user does not choose one
pub const DEFAULT_NON_MASQUERADE_CIDR: &str = "100.64.0.0/10";

/// The network CIDR used when the user does not choose one
pub const DEFAULT_NETWORK_CIDR: &str = "172.20.0.0/16";

/// Assign CIDRs to subnets that do not have one
///
/// The network range is split into 8 "big" blocks. The first non-reserved
/// block is subdivided again into 8 "little" blocks for utility subnets,
/// with the first little block left unused for future use. Blocks
/// overlapping a user-supplied subnet CIDR are reserved and never assigned.
/// Within each pool, subnets are assigned in ascending zone order, so
/// assignment is independent of input order.
pub fn assign_cidrs_to_subnets(cluster: &mut Cluster) -> Result<()> {
    if cluster.spec.subnets.iter().all(|s| s.cidr.is_some()) {
        debug!("all subnets have CIDRs; skipping assignment");
        return Ok(());
    }

    let network_cidr: Cidr = cluster
        .spec
        .network_cidr
        .as_deref()
        .ok_or_else(|| Error::required_field("spec.networkCIDR"))?
        .parse()?;

    let mut reserved: Vec<Cidr> = Vec::new();
    for subnet in &cluster.spec.subnets {
        if let Some(cidr) = &subnet.cidr {
            reserved.push(cidr.parse()?);
        }
    }

    let mut big_pool: Vec<Cidr> = split_into_8_subnets(&network_cidr)?
        .into_iter()
        .filter(|candidate| !reserved.iter().any(|r| r.overlaps(candidate)))
        .collect();

    if big_pool.is_empty() {
        return Err(Error::validation(
            "spec.networkCIDR",
            "no non-overlapping CIDRs remain in the network CIDR; cannot auto-assign subnet CIDRs",
        ));
    }

    // The little pool comes out of the first free big block; its lowest
    // child stays unused.
    let mut little_pool: Vec<Cidr> = split_into_8_subnets(&big_pool.remove(0))?
        .into_iter()
        .skip(1)
        .collect();

    assign_pool(&mut cluster.spec.subnets, &mut big_pool, "big", |s| {
        matches!(s.subnet_type, SubnetType::Public | SubnetType::Private)
    })?;
    assign_pool(&mut cluster.spec.subnets, &mut little_pool, "little", |s| {
        s.subnet_type == SubnetType::Utility
    })?;

    Ok(())
}

fn assign_pool(
    subnets: &mut [SubnetSpec],
    pool: &mut Vec<Cidr>,
    pool_name: &'static str,
    belongs: impl Fn(&SubnetSpec) -> bool,
) -> Result<()> {
    let mut indexes: Vec<usize> = (0..subnets.len()).filter(|&i| belongs(&subnets[i])).collect();
    indexes.sort_by(|&a, &b| subnets[a].zone.cmp(&subnets[b].zone));

    for i in indexes {
        let subnet = &mut subnets[i];
        if subnet.cidr.is_some() {
            continue;
        }
        if pool.is_empty() {
            return Err(Error::InsufficientCidrs {
                pool: pool_name,
                subnet: subnet.name.clone(),
            });
        }
        let cidr = pool.remove(0);
        subnet.cidr = Some(cidr.to_string());
        info!(subnet = %subnet.name, cidr = %cidr, "assigned subnet CIDR");
    }
    Ok(())
}

/// Derive the pod and service IP ranges from the non-masquerade range
///
/// The pod range (controller-manager `clusterCIDR`) takes the upper half of
/// the non-masquerade range; the service range takes a quarter of the lower
/// half, at the base. Both defaults only apply when the field is unset.
pub fn assign_ip_ranges(cluster: &mut Cluster) -> Result<()> {
    let non_masq: Cidr = cluster
        .spec
        .non_masquerade_cidr
        .get_or_insert_with(|| DEFAULT_NON_MASQUERADE_CIDR.to_string())
        .parse()?;
    if !non_masq.is_ipv4() {
        return Err(Error::UnsupportedAddressFamily(non_masq.to_string()));
    }

    let kcm = cluster
        .spec
        .kube_controller_manager
        .get_or_insert_with(KubeControllerManagerConfig::default);
    if kcm.cluster_cidr.is_none() {
        let pod_cidr = non_masq.subdivide(1, 1)?;
        kcm.cluster_cidr = Some(pod_cidr.to_string());
        debug!(cluster_cidr = %pod_cidr, "defaulted controller-manager clusterCIDR");
    }

    if cluster.spec.service_cluster_ip_range.is_none() {
        let service_range = non_masq.subdivide(0, 3)?;
        cluster.spec.service_cluster_ip_range = Some(service_range.to_string());
        debug!(range = %service_range, "defaulted serviceClusterIPRange");
    }

    Ok(())
}
