//! Error types for the Stratus provisioning engine

use thiserror::Error;

/// Main error type for Stratus operations
///
/// Every failure surfaced by the engine carries a stable kind, the offending
/// field path or task name, and the underlying cause where one exists. No
/// error is recovered inside the core; the normalizer and the reconciler both
/// abort on first failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Schema-level validation failure, before or after normalization
    #[error("validation error at {path}: {reason}")]
    Validation {
        /// Field path that failed validation (e.g. `spec.subnets[0].zone`)
        path: String,
        /// Human-readable reason
        reason: String,
    },

    /// A mandatory input field was not set
    #[error("required field not set: {0}")]
    RequiredField(String),

    /// Reconciliation attempted to change an immutable field
    #[error("cannot change immutable field: {0}")]
    CannotChange(String),

    /// Two CIDR ranges overlap where they must be disjoint
    #[error("CIDR ranges overlap: {0} and {1}")]
    CidrOverlap(String, String),

    /// The CIDR pool was exhausted during automatic subnet assignment
    #[error("insufficient {pool} CIDRs remaining for automatic allocation to subnet {subnet:?}")]
    InsufficientCidrs {
        /// Which pool ran dry (`big` or `little`)
        pool: &'static str,
        /// The subnet that could not be assigned
        subnet: String,
    },

    /// CIDR arithmetic was requested on an address family that does not support it
    #[error("unsupported address family for CIDR {0}")]
    UnsupportedAddressFamily(String),

    /// An etcd cluster has an even number of member instance groups
    #[error("etcd cluster {etcd} has {count} member instance groups; an odd number is required for quorum")]
    QuorumViolation {
        /// The offending etcd cluster name
        etcd: String,
        /// The even member count observed
        count: usize,
    },

    /// No hosted zone matched the cluster name during DNS zone discovery
    #[error("no DNS hosted zone found matching cluster name {0}")]
    DnsZoneNotFound(String),

    /// More than one hosted zone matched the cluster name equally well
    #[error("multiple DNS hosted zones match cluster name {0}; specify dnsZone explicitly")]
    DnsZoneAmbiguous(String),

    /// A persistent store URI is not readable from cluster nodes
    #[error("store path is not cluster readable: {0}")]
    NotClusterReadable(String),

    /// A shared resource was missing, or a mutation of one was attempted
    #[error("shared resource violation on task {0}: {1}")]
    SharedResourceViolation(String, String),

    /// A cloud-side call failed
    #[error("cloud API error during {op}: {cause}")]
    CloudApi {
        /// The operation that failed (e.g. `CreateSubnet`)
        op: String,
        /// Underlying cause
        cause: String,
    },

    /// A single task exceeded the maximum task duration
    #[error("task {0} timed out")]
    Timeout(String),

    /// Template rendering failure from the options loader
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error from the emitter or the VFS
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error for the given field path
    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a required-field error
    pub fn required_field(path: impl Into<String>) -> Self {
        Self::RequiredField(path.into())
    }

    /// Create a cannot-change error for an immutable field
    pub fn cannot_change(path: impl Into<String>) -> Self {
        Self::CannotChange(path.into())
    }

    /// Create a cloud API error wrapping the named operation
    pub fn cloud_api(op: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::CloudApi {
            op: op.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a shared-resource violation for the given task
    pub fn shared_violation(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SharedResourceViolation(task.into(), reason.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
