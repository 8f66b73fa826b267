//! Declarative task model and reconciler
//!
//! Each cloud resource the engine manages is described by a *task*: a typed,
//! name-addressable descriptor with references to the tasks it depends on.
//! Tasks form a DAG; the reconciler walks it in deterministic topological
//! order running the find → diff → check → render loop for each one.
//!
//! Tasks live in a single arena keyed by `<kind>/<name>` and reference each
//! other by logical name, never by pointer; references resolve lazily to
//! cloud ids (live back-end) or to literals (declarative emitter). Render on
//! the create path backfills output-only fields (ids, DNS names) into the
//! expected task so downstream tasks can resolve them.

mod autoscaling;
mod dns;
mod firewall;
mod load_balancer;
mod network;
mod policy;

pub use autoscaling::{AutoscalingGroup, KeyPair, LaunchConfiguration};
pub use dns::DnsRecord;
pub use firewall::{SecurityGroup, SecurityGroupRule};
pub use load_balancer::{
    LbAccessLog, LbConnectionDraining, LbConnectionSettings, LbCrossZoneLoadBalancing,
    LbHealthCheck, LbListener, LoadBalancer,
};
pub use network::{SubnetTask, Vpc};
pub use policy::{IamRole, IamRolePolicy};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cloud::Cloud;
use crate::target::{EmitterTarget, Target};
use crate::{Error, Result};

/// The kinds of cloud resource the engine manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskKind {
    /// Virtual private cloud network
    Vpc,
    /// VPC subnet
    Subnet,
    /// Security group
    SecurityGroup,
    /// Single security group rule
    SecurityGroupRule,
    /// Classic load balancer
    LoadBalancer,
    /// IAM role
    IamRole,
    /// Inline IAM role policy
    IamRolePolicy,
    /// Imported SSH key pair
    KeyPair,
    /// Launch configuration
    LaunchConfiguration,
    /// Auto-scaling group
    AutoscalingGroup,
    /// Route53 alias record
    DnsRecord,
}

impl TaskKind {
    /// Stable identifier used in arena keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vpc => "vpc",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security-group",
            Self::SecurityGroupRule => "security-group-rule",
            Self::LoadBalancer => "load-balancer",
            Self::IamRole => "iam-role",
            Self::IamRolePolicy => "iam-role-policy",
            Self::KeyPair => "key-pair",
            Self::LaunchConfiguration => "launch-configuration",
            Self::AutoscalingGroup => "autoscaling-group",
            Self::DnsRecord => "dns-record",
        }
    }

    /// The resource type the declarative emitter writes for this kind
    pub fn emitter_type(&self) -> &'static str {
        match self {
            Self::Vpc => "aws_vpc",
            Self::Subnet => "aws_subnet",
            Self::SecurityGroup => "aws_security_group",
            Self::SecurityGroupRule => "aws_security_group_rule",
            Self::LoadBalancer => "aws_elb",
            Self::IamRole => "aws_iam_role",
            Self::IamRolePolicy => "aws_iam_role_policy",
            Self::KeyPair => "aws_key_pair",
            Self::LaunchConfiguration => "aws_launch_configuration",
            Self::AutoscalingGroup => "aws_autoscaling_group",
            Self::DnsRecord => "aws_route53_record",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed reference to another task
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskRef {
    /// Kind of the referenced task
    pub kind: TaskKind,
    /// Logical name of the referenced task
    pub name: String,
}

impl TaskRef {
    /// Build a reference
    pub fn new(kind: TaskKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// The arena key the reference resolves through
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.name)
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Reconciliation state of a single task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TaskState {
    /// Not yet visited
    #[default]
    Pending,
    /// Querying the cloud for actual state
    Finding,
    /// Computing the field-wise delta
    Diffing,
    /// Validating the proposed changes
    Checking,
    /// Applying through the back-end
    Rendering,
    /// Finished; outputs available to dependents
    Done,
    /// Aborted; terminal
    Failed,
}

/// Everything a task sees while reconciling
pub struct TaskContext<'a> {
    /// The cloud handle
    pub cloud: &'a dyn Cloud,
    /// Name of the cluster being reconciled
    pub cluster_name: &'a str,
    /// The rest of the graph; tasks earlier in topological order carry
    /// their outputs
    pub graph: &'a TaskGraph,
}

/// The shared per-kind contract
///
/// `find` is a read-only cloud query (by id when known, otherwise by tags);
/// `changes` computes the field-wise delta with spurious differences
/// suppressed; `check_changes` enforces required fields on create and
/// immutability on update; the two render methods apply the delta through
/// the chosen back-end.
#[async_trait]
pub trait TaskPayload: Clone + Send + Sync {
    /// The kind tag for this payload
    const KIND: TaskKind;

    /// Logical task name
    fn name(&self) -> &str;

    /// References to the tasks this one depends on
    fn dependencies(&self) -> Vec<TaskRef>;

    /// True when the resource is used but not owned by the cluster
    fn is_shared(&self) -> bool {
        false
    }

    /// The cloud-assigned id, once known
    fn cloud_id(&self) -> Option<&str>;

    /// Query the cloud for the matching resource; `None` when absent.
    /// Backfills discovered identity onto `self`.
    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>>;

    /// Field-wise delta between the observed and expected state: each field
    /// is set iff it needs to change
    fn changes(actual: &Self, expected: &Self, ctx: &TaskContext<'_>) -> Self;

    /// True when the delta contains any change
    fn has_changes(changes: &Self) -> bool;

    /// Validate the proposed delta
    fn check_changes(actual: Option<&Self>, expected: &Self, changes: &Self) -> Result<()>;

    /// Apply through the live cloud API
    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        changes: &Self,
    ) -> Result<()>;

    /// Emit the declarative description
    fn render_emitter(&self, ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()>;
}

/// A task: closed union over the resource kinds
#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    /// VPC task
    Vpc(Vpc),
    /// Subnet task
    Subnet(SubnetTask),
    /// Security group task
    SecurityGroup(SecurityGroup),
    /// Security group rule task
    SecurityGroupRule(SecurityGroupRule),
    /// Load balancer task
    LoadBalancer(LoadBalancer),
    /// IAM role task
    IamRole(IamRole),
    /// IAM role policy task
    IamRolePolicy(IamRolePolicy),
    /// SSH key pair task
    KeyPair(KeyPair),
    /// Launch configuration task
    LaunchConfiguration(LaunchConfiguration),
    /// Auto-scaling group task
    AutoscalingGroup(AutoscalingGroup),
    /// DNS record task
    DnsRecord(DnsRecord),
}

macro_rules! for_each_task {
    ($task:expr, $payload:ident => $body:expr) => {
        match $task {
            Task::Vpc($payload) => $body,
            Task::Subnet($payload) => $body,
            Task::SecurityGroup($payload) => $body,
            Task::SecurityGroupRule($payload) => $body,
            Task::LoadBalancer($payload) => $body,
            Task::IamRole($payload) => $body,
            Task::IamRolePolicy($payload) => $body,
            Task::KeyPair($payload) => $body,
            Task::LaunchConfiguration($payload) => $body,
            Task::AutoscalingGroup($payload) => $body,
            Task::DnsRecord($payload) => $body,
        }
    };
}

impl Task {
    /// The kind tag
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Vpc(_) => TaskKind::Vpc,
            Self::Subnet(_) => TaskKind::Subnet,
            Self::SecurityGroup(_) => TaskKind::SecurityGroup,
            Self::SecurityGroupRule(_) => TaskKind::SecurityGroupRule,
            Self::LoadBalancer(_) => TaskKind::LoadBalancer,
            Self::IamRole(_) => TaskKind::IamRole,
            Self::IamRolePolicy(_) => TaskKind::IamRolePolicy,
            Self::KeyPair(_) => TaskKind::KeyPair,
            Self::LaunchConfiguration(_) => TaskKind::LaunchConfiguration,
            Self::AutoscalingGroup(_) => TaskKind::AutoscalingGroup,
            Self::DnsRecord(_) => TaskKind::DnsRecord,
        }
    }

    /// Logical name
    pub fn name(&self) -> &str {
        for_each_task!(self, p => p.name())
    }

    /// Arena key: `<kind>/<name>`
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind().as_str(), self.name())
    }

    /// References to the tasks this one depends on
    pub fn dependencies(&self) -> Vec<TaskRef> {
        for_each_task!(self, p => p.dependencies())
    }

    /// True when the resource is shared
    pub fn is_shared(&self) -> bool {
        for_each_task!(self, p => p.is_shared())
    }

    /// The cloud-assigned id, once known
    pub fn cloud_id(&self) -> Option<&str> {
        for_each_task!(self, p => p.cloud_id())
    }
}

/// The task arena: every task of a run, keyed by `<kind>/<name>`
#[derive(Default)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
}

impl TaskGraph {
    /// An empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task; the `<kind>/<name>` key must be unique
    pub fn insert(&mut self, task: Task) -> Result<()> {
        let key = task.key();
        if self.tasks.contains_key(&key) {
            return Err(Error::validation(
                key.clone(),
                "duplicate task in graph",
            ));
        }
        self.tasks.insert(key, task);
        Ok(())
    }

    /// Look up a task by kind and name
    pub fn get(&self, kind: TaskKind, name: &str) -> Option<&Task> {
        self.tasks.get(&TaskRef::new(kind, name).key())
    }

    /// Number of tasks in the graph
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when the graph holds no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterate tasks in key order
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// The load balancer payload behind a reference, for tasks that read
    /// its cloud-assigned endpoint
    pub fn load_balancer(&self, name: &str) -> Option<&LoadBalancer> {
        match self.get(TaskKind::LoadBalancer, name) {
            Some(Task::LoadBalancer(lb)) => Some(lb),
            _ => None,
        }
    }

    /// The cloud id a reference resolves to
    ///
    /// Valid once the referenced task has reconciled (it precedes the caller
    /// in topological order).
    pub fn cloud_id(&self, kind: TaskKind, name: &str) -> Result<String> {
        let task = self
            .get(kind, name)
            .ok_or_else(|| Error::validation(TaskRef::new(kind, name).key(), "task not found"))?;
        task.cloud_id()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::validation(
                    task.key(),
                    "referenced task has no cloud id yet; dependency ordering is broken",
                )
            })
    }

    /// The emitter-side link a reference resolves to: the literal cloud id
    /// for shared resources, a property reference otherwise
    pub fn emitter_link(&self, kind: TaskKind, name: &str) -> Result<String> {
        let task = self
            .get(kind, name)
            .ok_or_else(|| Error::validation(TaskRef::new(kind, name).key(), "task not found"))?;
        if task.is_shared() {
            return task.cloud_id().map(str::to_string).ok_or_else(|| {
                Error::shared_violation(task.key(), "shared resource has no id")
            });
        }
        Ok(format!("${{{}.{}.id}}", kind.emitter_type(), name))
    }

    /// Deterministic topological order over the task keys
    ///
    /// Fails when a dependency is missing from the graph or the references
    /// form a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();

        for (key, task) in &self.tasks {
            in_degree.entry(key.clone()).or_insert(0);
            for dep in task.dependencies() {
                let dep_key = dep.key();
                if !self.tasks.contains_key(&dep_key) {
                    return Err(Error::validation(
                        key.clone(),
                        format!("depends on missing task {dep_key}"),
                    ));
                }
                dependents.entry(dep_key).or_default().push(key.clone());
                *in_degree.entry(key.clone()).or_insert(0) += 1;
            }
        }

        let mut ready: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(k, _)| k.clone())
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(key) = ready.pop_front() {
            order.push(key.clone());
            if let Some(next) = dependents.get(&key) {
                // `next` is in insertion order, which follows the BTreeMap
                // walk above, so the order stays deterministic.
                for dependent in next {
                    let deg = in_degree
                        .get_mut(dependent)
                        .expect("dependent was registered");
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push_back(dependent.clone());
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(k, _)| k)
                .collect();
            return Err(Error::validation(
                stuck.join(", "),
                "task references form a cycle",
            ));
        }
        Ok(order)
    }
}

/// Drives a task graph to completion against one back-end
pub struct Reconciler<'a> {
    cloud: &'a dyn Cloud,
    cluster_name: String,
    max_task_duration: Duration,
}

impl<'a> Reconciler<'a> {
    /// Build a reconciler for a cluster
    pub fn new(cloud: &'a dyn Cloud, cluster_name: impl Into<String>) -> Self {
        Self {
            cloud,
            cluster_name: cluster_name.into(),
            max_task_duration: Duration::from_secs(crate::DEFAULT_MAX_TASK_DURATION_SECS),
        }
    }

    /// Cap the time any single task may spend; exceeding it aborts the run
    pub fn with_max_task_duration(mut self, duration: Duration) -> Self {
        self.max_task_duration = duration;
        self
    }

    /// Reconcile every task in topological order
    ///
    /// The first task failure aborts the run. On success the graph's tasks
    /// carry their outputs (cloud ids, DNS names) and the returned map holds
    /// the final state of every task.
    pub async fn run(
        &self,
        graph: &mut TaskGraph,
        target: &mut Target,
    ) -> Result<BTreeMap<String, TaskState>> {
        let order = graph.topological_order()?;
        let mut states: BTreeMap<String, TaskState> =
            order.iter().map(|k| (k.clone(), TaskState::Pending)).collect();

        info!(tasks = order.len(), "reconciling task graph");

        for key in order {
            let mut task = graph
                .tasks
                .remove(&key)
                .expect("topological order only contains graph keys");

            let outcome = tokio::time::timeout(
                self.max_task_duration,
                self.reconcile_one(&mut task, graph, target),
            )
            .await;

            // The task rejoins the arena even on failure so the caller can
            // inspect the graph.
            graph.tasks.insert(key.clone(), task);

            let state = match outcome {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    states.insert(key, TaskState::Failed);
                    return Err(e);
                }
                Err(_) => {
                    states.insert(key.clone(), TaskState::Failed);
                    return Err(Error::Timeout(key));
                }
            };
            states.insert(key, state);
        }

        if let Target::Emitter(emitter) = target {
            emitter.seal();
        }
        Ok(states)
    }

    async fn reconcile_one(
        &self,
        task: &mut Task,
        graph: &TaskGraph,
        target: &mut Target,
    ) -> Result<TaskState> {
        let ctx = TaskContext {
            cloud: self.cloud,
            cluster_name: &self.cluster_name,
            graph,
        };
        for_each_task!(task, p => drive(p, &ctx, target).await)
    }
}

/// The find → diff → check → render loop for one task
async fn drive<P: TaskPayload>(
    expected: &mut P,
    ctx: &TaskContext<'_>,
    target: &mut Target,
) -> Result<TaskState> {
    let key = format!("{}/{}", P::KIND.as_str(), expected.name());

    debug!(task = %key, state = ?TaskState::Finding);
    let actual = expected.find(ctx).await?;

    if expected.is_shared() && actual.is_none() {
        return Err(Error::shared_violation(
            key,
            "shared resource not found; it must already exist",
        ));
    }

    debug!(task = %key, state = ?TaskState::Diffing, found = actual.is_some());
    let changes = match &actual {
        Some(actual) => P::changes(actual, expected, ctx),
        None => expected.clone(),
    };

    // Shared resources are read-only: existence was checked above, and any
    // expectation that differs from observed state is a violation, never a
    // change to apply.
    if expected.is_shared() {
        if P::has_changes(&changes) {
            return Err(Error::shared_violation(
                key,
                "shared resources are read-only",
            ));
        }
        debug!(task = %key, "shared resource verified");
        return Ok(TaskState::Done);
    }

    debug!(task = %key, state = ?TaskState::Checking);
    P::check_changes(actual.as_ref(), expected, &changes)?;

    if actual.is_some() && !P::has_changes(&changes) {
        debug!(task = %key, "no changes");
        return Ok(TaskState::Done);
    }

    debug!(task = %key, state = ?TaskState::Rendering);
    match target {
        Target::Direct => expected.render_direct(ctx, actual.as_ref(), &changes).await?,
        Target::Emitter(emitter) => expected.render_emitter(ctx, emitter)?,
    }
    Ok(TaskState::Done)
}

/// Hex fingerprint of an SSH public key, used to version key pair names
pub fn public_key_fingerprint(public_key: &str) -> String {
    let digest = Sha256::digest(public_key.trim().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..32].to_string()
}

/// Changed-field helper: `Some` iff the expected value is set and differs
/// from the actual
pub(crate) fn field_change<T: Clone + PartialEq>(actual: &Option<T>, expected: &Option<T>) -> Option<T> {
    match expected {
        Some(value) if actual.as_ref() != Some(value) => Some(value.clone()),
        _ => None,
    }
}
