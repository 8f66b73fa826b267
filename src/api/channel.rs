//! Channel documents
//!
//! A channel maps kubernetes versions to the defaults a cluster of that
//! version should get: machine images and root-volume sizing. Channels let
//! defaults move forward without a new engine release.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A channel document: version-keyed provisioning defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Images, first match by provider and version range wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ChannelImageSpec>,

    /// Default root volume size in GB for master instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_root_volume_size: Option<i32>,

    /// Default root volume size in GB for node instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_root_volume_size: Option<i32>,

    /// Default root volume type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume_type: Option<String>,
}

/// One image entry in a channel
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelImageSpec {
    /// Cloud provider the image applies to
    pub provider_id: String,

    /// Image name (resolved to an id through the cloud)
    pub name: String,

    /// Semver range of kubernetes versions the image applies to
    pub kubernetes_version: String,
}

impl Channel {
    /// The stable channel shipped with the engine
    pub fn stable() -> Self {
        Self {
            images: vec![ChannelImageSpec {
                provider_id: "aws".to_string(),
                name: "k8s-1.4-debian-jessie-amd64-hvm-ebs-2016-10-21".to_string(),
                kubernetes_version: ">=1.4.0, <1.6.0".to_string(),
            }],
            master_root_volume_size: Some(20),
            node_root_volume_size: Some(20),
            root_volume_type: Some("gp2".to_string()),
        }
    }

    /// Load a channel from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Find the image for a provider and kubernetes version
    pub fn find_image(&self, provider_id: &str, version: &semver::Version) -> Result<&ChannelImageSpec> {
        for image in &self.images {
            if image.provider_id != provider_id {
                continue;
            }
            let range = semver::VersionReq::parse(&image.kubernetes_version).map_err(|e| {
                Error::validation(
                    format!("channel.images[{}].kubernetesVersion", image.name),
                    e.to_string(),
                )
            })?;
            if range.matches(version) {
                return Ok(image);
            }
        }
        Err(Error::validation(
            "channel.images",
            format!("no image found for provider {provider_id} and kubernetes {version}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_channel_matches_14_series() {
        let channel = Channel::stable();
        let version = semver::Version::parse("1.4.8").unwrap();
        let image = channel.find_image("aws", &version).unwrap();
        assert_eq!(image.name, "k8s-1.4-debian-jessie-amd64-hvm-ebs-2016-10-21");
    }

    #[test]
    fn test_find_image_rejects_unknown_provider() {
        let channel = Channel::stable();
        let version = semver::Version::parse("1.4.8").unwrap();
        assert!(channel.find_image("gce", &version).is_err());
    }

    #[test]
    fn test_find_image_rejects_out_of_range_version() {
        let channel = Channel::stable();
        let version = semver::Version::parse("1.3.0").unwrap();
        assert!(channel.find_image("aws", &version).is_err());
    }

    #[test]
    fn test_channel_yaml_roundtrip() {
        let channel = Channel::stable();
        let yaml = serde_yaml::to_string(&channel).unwrap();
        let parsed = Channel::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, channel);
    }
}
