//! Code-based option builders
//!
//! Each builder fills the defaults for one component of the cluster. They
//! run left-to-right before the file templates, are idempotent, and only
//! ever set fields that are still unset.

use crate::api::{parse_kubernetes_version, ClusterSpec, DockerConfig, KubeApiServerConfig};
use crate::{Error, Result};

use super::OptionsBuilder;

/// Fills kube-apiserver defaults
pub struct KubeApiServerOptionsBuilder;

impl OptionsBuilder for KubeApiServerOptionsBuilder {
    fn build_options(&self, spec: &mut ClusterSpec) -> Result<()> {
        let version_str = spec
            .kubernetes_version
            .clone()
            .ok_or_else(|| Error::required_field("spec.kubernetesVersion"))?;

        let apiserver = spec.kube_apiserver.get_or_insert_with(KubeApiServerConfig::default);

        if apiserver.cloud_provider.is_none() {
            apiserver.cloud_provider = spec.cloud_provider.clone();
        }
        if apiserver.service_cluster_ip_range.is_none() {
            apiserver.service_cluster_ip_range = spec.service_cluster_ip_range.clone();
        }

        // Anonymous auth exists from 1.5; leave it unset on older versions.
        if apiserver.anonymous_auth.is_none() {
            if let Ok(version) = parse_kubernetes_version(&version_str) {
                if (version.major, version.minor) >= (1, 5) {
                    apiserver.anonymous_auth = Some(false);
                }
            }
        }

        Ok(())
    }
}

/// Fills the docker version from the kubernetes version
pub struct DockerOptionsBuilder;

impl OptionsBuilder for DockerOptionsBuilder {
    fn build_options(&self, spec: &mut ClusterSpec) -> Result<()> {
        let version_str = spec
            .kubernetes_version
            .clone()
            .ok_or_else(|| Error::required_field("spec.kubernetesVersion"))?;

        let docker = spec.docker.get_or_insert_with(DockerConfig::default);
        if docker.log_level.is_none() {
            docker.log_level = Some("warn".to_string());
        }
        if docker.storage.is_none() {
            docker.storage = Some("devicemapper".to_string());
        }

        if docker.version.is_none() {
            // CI builds addressed by URL have no parseable version; leave
            // the docker version for the operator to pin.
            let Ok(version) = parse_kubernetes_version(&version_str) else {
                return Ok(());
            };
            let docker_version = if version.major == 1 && version.minor >= 5 {
                "1.12.3"
            } else if version.major == 1 && version.minor <= 4 {
                "1.11.2"
            } else {
                return Err(Error::validation(
                    "spec.kubernetesVersion",
                    format!("cannot infer docker version for kubernetes {version}"),
                ));
            };
            docker.version = Some(docker_version.to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_version(version: &str) -> ClusterSpec {
        ClusterSpec {
            cloud_provider: Some("aws".to_string()),
            kubernetes_version: Some(version.to_string()),
            service_cluster_ip_range: Some("100.64.0.0/13".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_docker_version_for_15() {
        let mut spec = spec_with_version("1.5.1");
        DockerOptionsBuilder.build_options(&mut spec).unwrap();
        assert_eq!(
            spec.docker.as_ref().unwrap().version.as_deref(),
            Some("1.12.3")
        );
    }

    #[test]
    fn test_docker_version_for_14() {
        let mut spec = spec_with_version("1.4.8");
        DockerOptionsBuilder.build_options(&mut spec).unwrap();
        assert_eq!(
            spec.docker.as_ref().unwrap().version.as_deref(),
            Some("1.11.2")
        );
    }

    #[test]
    fn test_docker_version_unknown_series_fails() {
        let mut spec = spec_with_version("2.0.0");
        assert!(DockerOptionsBuilder.build_options(&mut spec).is_err());
    }

    #[test]
    fn test_docker_version_explicit_value_kept() {
        let mut spec = spec_with_version("1.4.8");
        spec.docker = Some(DockerConfig {
            version: Some("1.13.0".to_string()),
            ..Default::default()
        });
        DockerOptionsBuilder.build_options(&mut spec).unwrap();
        assert_eq!(
            spec.docker.as_ref().unwrap().version.as_deref(),
            Some("1.13.0")
        );
    }

    #[test]
    fn test_apiserver_anonymous_auth_off_from_15() {
        let mut spec = spec_with_version("1.5.1");
        KubeApiServerOptionsBuilder.build_options(&mut spec).unwrap();
        assert_eq!(
            spec.kube_apiserver.as_ref().unwrap().anonymous_auth,
            Some(false)
        );

        let mut spec = spec_with_version("1.4.8");
        KubeApiServerOptionsBuilder.build_options(&mut spec).unwrap();
        assert_eq!(spec.kube_apiserver.as_ref().unwrap().anonymous_auth, None);
    }

    #[test]
    fn test_apiserver_inherits_cluster_settings() {
        let mut spec = spec_with_version("1.4.8");
        KubeApiServerOptionsBuilder.build_options(&mut spec).unwrap();
        let apiserver = spec.kube_apiserver.as_ref().unwrap();
        assert_eq!(apiserver.cloud_provider.as_deref(), Some("aws"));
        assert_eq!(
            apiserver.service_cluster_ip_range.as_deref(),
            Some("100.64.0.0/13")
        );
    }

    #[test]
    fn test_builders_are_idempotent() {
        let mut spec = spec_with_version("1.4.8");
        DockerOptionsBuilder.build_options(&mut spec).unwrap();
        KubeApiServerOptionsBuilder.build_options(&mut spec).unwrap();
        let once = spec.clone();
        DockerOptionsBuilder.build_options(&mut spec).unwrap();
        KubeApiServerOptionsBuilder.build_options(&mut spec).unwrap();
        assert_eq!(spec, once);
    }
}
