//! Model options loader
//!
//! Completes a cluster spec by reducing it through two kinds of builders,
//! left to right:
//!
//! 1. **Code builders**: [`OptionsBuilder`] implementations that fill
//!    defaults for one component each.
//! 2. **File builders**: option templates rendered against the
//!    [`TemplateFunctions`] surface and merged into the spec.
//!
//! The reduction is deterministic, every builder is idempotent, and a value
//! already present in the spec always wins over a template-provided default.
//! Ordering between builders is the caller's responsibility: a builder may
//! read fields its predecessors populate, never its successors'.

mod components;
mod functions;

pub use components::{DockerOptionsBuilder, KubeApiServerOptionsBuilder};
pub use functions::{
    cloud_tags_for_instance_group, elb_name32, resolve_component_images, TemplateFunctions,
};

use tracing::debug;

use crate::api::ClusterSpec;
use crate::Result;

/// A code-based option builder
///
/// Implementations must be idempotent and must only set fields that are
/// still unset.
pub trait OptionsBuilder {
    /// Fill this builder's defaults into the spec
    fn build_options(&self, spec: &mut ClusterSpec) -> Result<()>;
}

/// The built-in option template with cluster-level component defaults
const CONFIG_TEMPLATE: &str = r#"kubeDNS:
  replicas: 2
  domain: cluster.local
  serverIP: "{{ WellKnownServiceIP(10) }}"
kubeAPIServer:
  image: "{{ Image('kube-apiserver') }}"
"#;

/// Builds the complete spec from builders plus option templates
pub struct SpecBuilder {
    builders: Vec<Box<dyn OptionsBuilder>>,
    templates: Vec<(String, String)>,
    functions: TemplateFunctions,
}

impl SpecBuilder {
    /// A builder with the standard code builders and the built-in config
    /// template
    pub fn new(functions: TemplateFunctions) -> Self {
        Self {
            builders: vec![
                Box::new(KubeApiServerOptionsBuilder),
                Box::new(DockerOptionsBuilder),
            ],
            templates: vec![("config".to_string(), CONFIG_TEMPLATE.to_string())],
            functions,
        }
    }

    /// Replace the template list (tests)
    pub fn with_templates(mut self, templates: Vec<(String, String)>) -> Self {
        self.templates = templates;
        self
    }

    /// Run the reduction and return the completed spec
    pub fn build_complete_spec(&self, spec: &ClusterSpec) -> Result<ClusterSpec> {
        let mut completed = spec.clone();

        for builder in &self.builders {
            builder.build_options(&mut completed)?;
        }

        let env = self.functions.build_environment();
        for (name, source) in &self.templates {
            debug!(template = %name, "rendering option template");
            let rendered = env.render_str(source, self.functions.context())?;
            let overlay: serde_yaml::Value = serde_yaml::from_str(&rendered)?;
            completed = merge_defaults(&completed, overlay)?;
        }

        Ok(completed)
    }
}

/// Merge template-provided defaults underneath the existing spec
///
/// Values already present in the spec win; objects merge recursively;
/// everything else fills only where the spec had nothing.
fn merge_defaults(spec: &ClusterSpec, overlay: serde_yaml::Value) -> Result<ClusterSpec> {
    let mut base = serde_json::to_value(spec)?;
    let overlay: serde_json::Value = serde_yaml::from_value(overlay)
        .map_err(|e| crate::Error::serialization(e.to_string()))?;
    merge_value(&mut base, overlay);
    Ok(serde_json::from_value(base)?)
}

fn merge_value(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) if !slot.is_null() => merge_value(slot, value),
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => {
            if base.is_null() {
                *base = overlay;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Cluster, KubeDnsConfig};
    use std::collections::{BTreeMap, BTreeSet};

    fn test_functions(cluster: &Cluster) -> TemplateFunctions {
        let mut images = BTreeMap::new();
        images.insert(
            "kube-apiserver".to_string(),
            "gcr.io/google_containers/kube-apiserver:v1.4.8".to_string(),
        );
        TemplateFunctions::new(cluster.clone(), Vec::new(), BTreeSet::new(), images)
    }

    fn test_cluster() -> Cluster {
        Cluster {
            name: "minimal.example.com".to_string(),
            spec: ClusterSpec {
                cloud_provider: Some("aws".to_string()),
                kubernetes_version: Some("1.4.8".to_string()),
                service_cluster_ip_range: Some("100.64.0.0/13".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_template_fills_kube_dns() {
        let cluster = test_cluster();
        let builder = SpecBuilder::new(test_functions(&cluster));
        let completed = builder.build_complete_spec(&cluster.spec).unwrap();

        let dns = completed.kube_dns.unwrap();
        assert_eq!(dns.replicas, Some(2));
        assert_eq!(dns.domain.as_deref(), Some("cluster.local"));
        assert_eq!(dns.server_ip.as_deref(), Some("100.64.0.10"));
    }

    #[test]
    fn test_existing_values_win_over_templates() {
        let mut cluster = test_cluster();
        cluster.spec.kube_dns = Some(KubeDnsConfig {
            replicas: Some(5),
            domain: None,
            server_ip: None,
        });

        let builder = SpecBuilder::new(test_functions(&cluster));
        let completed = builder.build_complete_spec(&cluster.spec).unwrap();

        let dns = completed.kube_dns.unwrap();
        // The user's replica count survives; the unset fields fill in.
        assert_eq!(dns.replicas, Some(5));
        assert_eq!(dns.domain.as_deref(), Some("cluster.local"));
    }

    #[test]
    fn test_code_builders_run_before_templates() {
        let cluster = test_cluster();
        let builder = SpecBuilder::new(test_functions(&cluster));
        let completed = builder.build_complete_spec(&cluster.spec).unwrap();

        // DockerOptionsBuilder output is present alongside template output.
        assert_eq!(
            completed.docker.as_ref().unwrap().version.as_deref(),
            Some("1.11.2")
        );
        assert_eq!(
            completed.kube_apiserver.as_ref().unwrap().image.as_deref(),
            Some("gcr.io/google_containers/kube-apiserver:v1.4.8")
        );
    }

    #[test]
    fn test_reduction_is_idempotent() {
        let cluster = test_cluster();
        let builder = SpecBuilder::new(test_functions(&cluster));
        let once = builder.build_complete_spec(&cluster.spec).unwrap();
        let twice = builder.build_complete_spec(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_undefined_template_variable_fails() {
        let cluster = test_cluster();
        let builder = SpecBuilder::new(test_functions(&cluster)).with_templates(vec![(
            "broken".to_string(),
            "dnsZone: \"{{ no_such_variable }}\"".to_string(),
        )]);
        assert!(builder.build_complete_spec(&cluster.spec).is_err());
    }
}
