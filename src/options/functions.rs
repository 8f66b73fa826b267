//! Template function surface
//!
//! These functions are what connect static option templates to runtime
//! values. Every function is pure over the (cluster, instance groups, tags)
//! triple; anything that needs I/O (component image tags) is resolved before
//! the engine is built, so rendering itself never blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use minijinja::value::Value;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use tracing::debug;

use crate::api::{Cluster, InstanceGroup};
use crate::net::{well_known_service_ip, Cidr};
use crate::vfs::{VfsContext, VfsPath};
use crate::{Error, Result};

/// The component images with hard-coded tags
const KUBE_DNS_IMAGE: &str = "gcr.io/google_containers/kubedns-amd64:1.3";

/// Components whose images templates may ask for
pub const KNOWN_COMPONENTS: [&str; 5] = [
    "kube-apiserver",
    "kube-controller-manager",
    "kube-scheduler",
    "kube-proxy",
    "kube-dns",
];

/// True when the configured kubernetes version is a base URL for a CI build
/// rather than a release version
fn is_base_url(kubernetes_version: &str) -> bool {
    kubernetes_version.contains("://")
}

/// Resolve the image for each known component
///
/// Hard-coded components keep their pinned image. Release versions map to
/// the published image name; base-URL versions fetch the tag file the build
/// uploaded next to its binaries.
pub async fn resolve_component_images(
    cluster: &Cluster,
    vfs: &VfsContext,
) -> Result<BTreeMap<String, String>> {
    let version = cluster
        .spec
        .kubernetes_version
        .as_deref()
        .ok_or_else(|| Error::required_field("spec.kubernetesVersion"))?;

    let mut images = BTreeMap::new();
    for component in KNOWN_COMPONENTS {
        let image = if component == "kube-dns" {
            KUBE_DNS_IMAGE.to_string()
        } else if !is_base_url(version) {
            format!("gcr.io/google_containers/{component}:v{version}")
        } else {
            let base = version.trim_end_matches('/');
            let tag_url = format!("{base}/bin/linux/amd64/{component}.docker_tag");
            debug!(component, url = %tag_url, "fetching component image tag");
            let body = vfs.read_file(&VfsPath::parse(&tag_url)?).await?;
            let tag = String::from_utf8_lossy(&body).trim().to_string();
            format!("gcr.io/google_containers/{component}:{tag}")
        };
        images.insert(component.to_string(), image);
    }
    Ok(images)
}

/// The function map handed to option templates
///
/// Holds everything rendering needs by value, so the built environment is
/// self-contained and deterministic.
#[derive(Clone)]
pub struct TemplateFunctions {
    cluster: Arc<Cluster>,
    instance_groups: Arc<Vec<InstanceGroup>>,
    tags: BTreeSet<String>,
    component_images: BTreeMap<String, String>,
}

impl TemplateFunctions {
    /// Build the function map for a cluster
    pub fn new(
        cluster: Cluster,
        instance_groups: Vec<InstanceGroup>,
        tags: BTreeSet<String>,
        component_images: BTreeMap<String, String>,
    ) -> Self {
        Self {
            cluster: Arc::new(cluster),
            instance_groups: Arc::new(instance_groups),
            tags,
            component_images,
        }
    }

    /// Build a template environment with every function registered
    pub fn build_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        self.add_to(&mut env);
        env
    }

    /// Register the function surface on an environment
    pub fn add_to(&self, env: &mut Environment<'static>) {
        let cluster = self.cluster.clone();
        env.add_function("SharedVPC", move || cluster.shared_vpc());

        let cluster = self.cluster.clone();
        env.add_function("IsTopologyPublic", move || cluster.is_topology_public());
        let cluster = self.cluster.clone();
        env.add_function("IsTopologyPrivate", move || cluster.is_topology_private());
        let cluster = self.cluster.clone();
        env.add_function("IsTopologyPrivateMasters", move || {
            cluster.is_topology_private_masters()
        });

        let cluster = self.cluster.clone();
        env.add_function(
            "WellKnownServiceIP",
            move |id: u32| -> std::result::Result<String, minijinja::Error> {
                let range = cluster
                    .spec
                    .service_cluster_ip_range
                    .as_deref()
                    .ok_or_else(|| template_error("serviceClusterIPRange is not set"))?;
                let cidr: Cidr = range.parse().map_err(|e: Error| template_error(e))?;
                let ip = well_known_service_ip(&cidr, id).map_err(template_error)?;
                Ok(ip.to_string())
            },
        );

        env.add_function("Base64Encode", |s: &str| STANDARD.encode(s));
        env.add_function("replace", |s: &str, find: &str, replace: &str| {
            s.replace(find, replace)
        });
        env.add_function("join", |a: Vec<String>, sep: &str| a.join(sep));

        let cluster = self.cluster.clone();
        env.add_function("ClusterName", move || cluster.name.clone());

        let tags = self.tags.clone();
        env.add_function("HasTag", move |tag: &str| tags.contains(tag));

        let images = self.component_images.clone();
        env.add_function(
            "Image",
            move |component: &str| -> std::result::Result<String, minijinja::Error> {
                images
                    .get(component)
                    .cloned()
                    .ok_or_else(|| template_error(format!("unknown component {component:?}")))
            },
        );

        env.add_function("WithDefaultBool", |value: Option<bool>, default: bool| {
            value.unwrap_or(default)
        });

        let groups = self.instance_groups.clone();
        env.add_function(
            "GetInstanceGroup",
            move |name: &str| -> std::result::Result<Value, minijinja::Error> {
                groups
                    .iter()
                    .find(|g| g.name == name)
                    .map(Value::from_serialize)
                    .ok_or_else(|| template_error(format!("instance group {name:?} not found")))
            },
        );

        let cluster = self.cluster.clone();
        env.add_function(
            "CloudTags",
            move |ig: Value| -> std::result::Result<Value, minijinja::Error> {
                let group: InstanceGroup =
                    serde_json::from_value(serde_json::to_value(&ig).map_err(template_error)?)
                        .map_err(template_error)?;
                Ok(Value::from_serialize(cloud_tags_for_instance_group(
                    &cluster, &group,
                )))
            },
        );

        let cluster = self.cluster.clone();
        env.add_function("KubeDNS", move || Value::from_serialize(&cluster.spec.kube_dns));

        let cluster = self.cluster.clone();
        env.add_function("DnsControllerArgv", move || {
            Value::from_serialize(dns_controller_argv(&cluster))
        });

        let cluster = self.cluster.clone();
        env.add_function("GetELBName32", move |prefix: &str| elb_name32(prefix, &cluster.name));
    }

    /// The render context: the cluster itself, addressable as `cluster`
    pub fn context(&self) -> Value {
        Value::from_serialize(serde_json::json!({ "cluster": &*self.cluster }))
    }
}

fn template_error(msg: impl std::fmt::Display) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, msg.to_string())
}

/// The cloud tags an instance group's instances carry
pub fn cloud_tags_for_instance_group(
    cluster: &Cluster,
    group: &InstanceGroup,
) -> BTreeMap<String, String> {
    let mut tags = cluster.spec.cloud_labels.clone();
    tags.extend(group.spec.cloud_labels.clone());
    tags.insert(
        crate::cloud::TAG_CLUSTER.to_string(),
        cluster.name.clone(),
    );
    tags
}

/// Arguments for the dns-controller process
fn dns_controller_argv(cluster: &Cluster) -> Vec<String> {
    let mut argv = vec![
        "/usr/bin/dns-controller".to_string(),
        "--watch-ingress=false".to_string(),
        "--dns=aws-route53".to_string(),
    ];
    if let Some(zone) = cluster.spec.dns_zone.as_deref() {
        if !zone.is_empty() {
            if zone.contains('.') {
                argv.push(format!("--zone={zone}"));
            } else {
                argv.push(format!("--zone=*/{zone}"));
            }
        }
    }
    // permit wildcard updates
    argv.push("--zone=*/*".to_string());
    argv.push("-v=8".to_string());
    argv
}

/// A load-balancer-safe name: `<prefix>-<cluster>` with dots replaced,
/// truncated to the 32-character limit
pub fn elb_name32(prefix: &str, cluster_name: &str) -> String {
    let mut name = format!("{prefix}-{}", cluster_name.replace('.', "-"));
    name.truncate(32);
    name.trim_end_matches('-').to_string()
}
