//! Spec normalization
//!
//! Turns sparse user input into complete specifications: the cluster first,
//! then each instance group against the completed cluster. Everything here
//! is pure computation except DNS zone discovery and component image
//! resolution, which go through the cloud handle and the VFS respectively.

mod cluster;
mod instance_group;
mod subnets;

pub use cluster::{build_cloudup_tags, populate_cluster_spec, write_completed_spec, ETCD_CLUSTERS};
pub use instance_group::populate_instance_group_spec;
pub use subnets::{
    assign_cidrs_to_subnets, assign_ip_ranges, DEFAULT_NETWORK_CIDR, DEFAULT_NON_MASQUERADE_CIDR,
};
