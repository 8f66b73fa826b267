//! Key pair, launch configuration and auto-scaling group tasks

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::cloud::{CloudAutoscalingGroup, CloudLaunchConfiguration};
use crate::target::EmitterTarget;
use crate::{Error, Result};

use super::{field_change, public_key_fingerprint, TaskContext, TaskKind, TaskPayload, TaskRef};

/// An imported SSH key pair
///
/// The name embeds the public key fingerprint, so replacing the key means a
/// new key pair rather than a change to this one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyPair {
    /// Key pair name (`kubernetes.<cluster>-<fingerprint>`)
    pub name: String,
    /// The OpenSSH public key material
    pub public_key: Option<String>,
    /// Observed fingerprint; output-only
    pub fingerprint: Option<String>,
}

impl KeyPair {
    /// The conventional key pair name for a cluster and key
    pub fn name_for(cluster: &str, public_key: &str) -> String {
        format!("kubernetes.{cluster}-{}", public_key_fingerprint(public_key))
    }
}

#[async_trait]
impl TaskPayload for KeyPair {
    const KIND: TaskKind = TaskKind::KeyPair;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        Vec::new()
    }

    fn cloud_id(&self) -> Option<&str> {
        Some(&self.name)
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let Some(key) = ctx.cloud.describe_key_pair(&self.name).await? else {
            return Ok(None);
        };
        debug!(key = %key.name, "found matching key pair");
        self.fingerprint = Some(key.fingerprint.clone());
        Ok(Some(Self {
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            fingerprint: Some(key.fingerprint),
        }))
    }

    fn changes(actual: &Self, expected: &Self, _ctx: &TaskContext<'_>) -> Self {
        let expected_fingerprint = expected
            .public_key
            .as_deref()
            .map(public_key_fingerprint);
        Self {
            name: expected.name.clone(),
            public_key: None,
            fingerprint: field_change(&actual.fingerprint, &expected_fingerprint),
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.fingerprint.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, changes: &Self) -> Result<()> {
        if actual.is_none() && expected.public_key.is_none() {
            return Err(Error::required_field("PublicKey"));
        }
        if actual.is_some() && changes.fingerprint.is_some() {
            return Err(Error::cannot_change("PublicKey"));
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        _changes: &Self,
    ) -> Result<()> {
        if actual.is_some() {
            return Ok(());
        }
        let public_key = self
            .public_key
            .as_deref()
            .ok_or_else(|| Error::required_field("PublicKey"))?;
        debug!(key = %self.name, "importing key pair");
        let imported = ctx.cloud.import_key_pair(&self.name, public_key).await?;
        self.fingerprint = Some(imported.fingerprint);
        Ok(())
    }

    fn render_emitter(&self, _ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let public_key = self
            .public_key
            .as_deref()
            .ok_or_else(|| Error::required_field("PublicKey"))?;
        let reference = target.write_data_file(
            Self::KIND.emitter_type(),
            &self.name,
            "public_key",
            public_key.as_bytes(),
        );
        target.render_resource(
            Self::KIND.emitter_type(),
            &self.name,
            json!({
                "key_name": self.name,
                "public_key": reference,
            }),
        )
    }
}

/// A launch configuration
///
/// Launch configurations cannot be edited in the cloud, so every field is
/// immutable here; size or image changes go through a new configuration and
/// a rolling update, which is outside this engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchConfiguration {
    /// Launch configuration name
    pub name: String,
    /// Machine image name; resolved to an image id during find
    pub image: Option<String>,
    /// Resolved image id; output-only
    pub image_id: Option<String>,
    /// Machine type
    pub instance_type: Option<String>,
    /// Name of the key pair task instances use
    pub ssh_key: Option<String>,
    /// Name of the IAM role task instances assume
    pub iam_instance_profile: Option<String>,
    /// Names of the security group tasks instances join
    pub security_groups: Vec<String>,
    /// Whether instances get a public IP
    pub associate_public_ip: Option<bool>,
    /// Instance user data; bastions have none
    pub user_data: Option<String>,
    /// Root volume size in GB
    pub root_volume_size: Option<i64>,
    /// Root volume type
    pub root_volume_type: Option<String>,
    /// Spot price bid; on-demand when unset
    pub spot_price: Option<String>,
}

#[async_trait]
impl TaskPayload for LaunchConfiguration {
    const KIND: TaskKind = TaskKind::LaunchConfiguration;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        let mut deps: Vec<TaskRef> = self
            .security_groups
            .iter()
            .map(|s| TaskRef::new(TaskKind::SecurityGroup, s))
            .collect();
        if let Some(key) = &self.ssh_key {
            deps.push(TaskRef::new(TaskKind::KeyPair, key));
        }
        if let Some(role) = &self.iam_instance_profile {
            deps.push(TaskRef::new(TaskKind::IamRole, role));
        }
        deps
    }

    fn cloud_id(&self) -> Option<&str> {
        Some(&self.name)
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        // The image name resolves through the cloud exactly once, up front,
        // so both back-ends render a concrete image id.
        if self.image_id.is_none() {
            if let Some(image_name) = &self.image {
                let image = ctx.cloud.find_image(image_name).await?.ok_or_else(|| {
                    Error::cloud_api("DescribeImages", format!("image {image_name:?} not found"))
                })?;
                self.image_id = Some(image.id);
            }
        }

        let Some(lc) = ctx.cloud.describe_launch_configuration(&self.name).await? else {
            return Ok(None);
        };
        debug!(lc = %lc.name, "found matching launch configuration");

        Ok(Some(Self {
            name: self.name.clone(),
            image: self.image.clone(),
            image_id: Some(lc.image_id),
            instance_type: Some(lc.instance_type),
            ssh_key: self.ssh_key.clone(),
            iam_instance_profile: lc.iam_instance_profile.clone(),
            security_groups: lc.security_group_ids.clone(),
            associate_public_ip: Some(lc.associate_public_ip),
            user_data: lc.user_data.clone(),
            root_volume_size: lc.root_volume_size,
            root_volume_type: lc.root_volume_type.clone(),
            spot_price: lc.spot_price.clone(),
        }))
    }

    fn changes(actual: &Self, expected: &Self, ctx: &TaskContext<'_>) -> Self {
        let expected_group_ids: Option<Vec<String>> = expected
            .security_groups
            .iter()
            .map(|name| ctx.graph.cloud_id(TaskKind::SecurityGroup, name).ok())
            .collect();
        let security_groups = match expected_group_ids {
            Some(ids) => {
                let actual_set: BTreeSet<&String> = actual.security_groups.iter().collect();
                let expected_set: BTreeSet<&String> = ids.iter().collect();
                if actual_set == expected_set {
                    Vec::new()
                } else {
                    expected.security_groups.clone()
                }
            }
            None => expected.security_groups.clone(),
        };

        Self {
            name: expected.name.clone(),
            image: None,
            image_id: field_change(&actual.image_id, &expected.image_id),
            instance_type: field_change(&actual.instance_type, &expected.instance_type),
            ssh_key: None,
            iam_instance_profile: field_change(
                &actual.iam_instance_profile,
                &expected.iam_instance_profile,
            ),
            security_groups,
            associate_public_ip: field_change(&actual.associate_public_ip, &expected.associate_public_ip),
            user_data: field_change(&actual.user_data, &expected.user_data),
            root_volume_size: field_change(&actual.root_volume_size, &expected.root_volume_size),
            root_volume_type: field_change(&actual.root_volume_type, &expected.root_volume_type),
            spot_price: field_change(&actual.spot_price, &expected.spot_price),
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.image_id.is_some()
            || changes.instance_type.is_some()
            || changes.iam_instance_profile.is_some()
            || !changes.security_groups.is_empty()
            || changes.associate_public_ip.is_some()
            || changes.user_data.is_some()
            || changes.root_volume_size.is_some()
            || changes.root_volume_type.is_some()
            || changes.spot_price.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.image.is_none() {
                return Err(Error::required_field("Image"));
            }
            if expected.instance_type.is_none() {
                return Err(Error::required_field("InstanceType"));
            }
            return Ok(());
        }
        for (field, changed) in [
            ("Image", changes.image_id.is_some()),
            ("InstanceType", changes.instance_type.is_some()),
            ("IAMInstanceProfile", changes.iam_instance_profile.is_some()),
            ("SecurityGroups", !changes.security_groups.is_empty()),
            ("AssociatePublicIP", changes.associate_public_ip.is_some()),
            ("UserData", changes.user_data.is_some()),
            ("RootVolumeSize", changes.root_volume_size.is_some()),
            ("RootVolumeType", changes.root_volume_type.is_some()),
            ("SpotPrice", changes.spot_price.is_some()),
        ] {
            if changed {
                return Err(Error::cannot_change(field));
            }
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        _changes: &Self,
    ) -> Result<()> {
        if actual.is_some() {
            return Ok(());
        }
        let image_id = self
            .image_id
            .clone()
            .ok_or_else(|| Error::required_field("Image"))?;
        let instance_type = self
            .instance_type
            .clone()
            .ok_or_else(|| Error::required_field("InstanceType"))?;
        let security_group_ids: Vec<String> = self
            .security_groups
            .iter()
            .map(|name| ctx.graph.cloud_id(TaskKind::SecurityGroup, name))
            .collect::<Result<_>>()?;

        debug!(lc = %self.name, "creating launch configuration");
        ctx.cloud
            .create_launch_configuration(&CloudLaunchConfiguration {
                name: self.name.clone(),
                image_id,
                instance_type,
                key_name: self.ssh_key.clone(),
                iam_instance_profile: self.iam_instance_profile.clone(),
                security_group_ids,
                associate_public_ip: self.associate_public_ip.unwrap_or(false),
                user_data: self.user_data.clone(),
                root_volume_size: self.root_volume_size,
                root_volume_type: self.root_volume_type.clone(),
                spot_price: self.spot_price.clone(),
            })
            .await
    }

    fn render_emitter(&self, ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let security_groups: Vec<String> = self
            .security_groups
            .iter()
            .map(|s| ctx.graph.emitter_link(TaskKind::SecurityGroup, s))
            .collect::<Result<_>>()?;

        let mut body = json!({
            "name": self.name,
            "image_id": self.image_id,
            "instance_type": self.instance_type,
            "security_groups": security_groups,
            "associate_public_ip_address": self.associate_public_ip.unwrap_or(false),
            "lifecycle": { "create_before_destroy": true },
        });
        if let Some(key) = &self.ssh_key {
            body["key_name"] = json!(format!("${{aws_key_pair.{key}.id}}"));
        }
        if let Some(role) = &self.iam_instance_profile {
            body["iam_instance_profile"] = json!(format!("${{aws_iam_role.{role}.id}}"));
        }
        if let Some(user_data) = &self.user_data {
            let reference = target.write_data_file(
                Self::KIND.emitter_type(),
                &self.name,
                "user_data",
                user_data.as_bytes(),
            );
            body["user_data"] = json!(reference);
        }
        if self.root_volume_size.is_some() || self.root_volume_type.is_some() {
            body["root_block_device"] = json!({
                "volume_size": self.root_volume_size,
                "volume_type": self.root_volume_type,
                "delete_on_termination": true,
            });
        }
        if let Some(spot) = &self.spot_price {
            body["spot_price"] = json!(spot);
        }

        target.render_resource(Self::KIND.emitter_type(), &self.name, body)
    }
}

/// An auto-scaling group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AutoscalingGroup {
    /// Group name
    pub name: String,
    /// Name of the launch configuration task
    pub launch_configuration: String,
    /// Minimum size
    pub min_size: Option<i64>,
    /// Maximum size
    pub max_size: Option<i64>,
    /// Names of the subnet tasks the group spans
    pub subnets: Vec<String>,
    /// Tags propagated to instances
    pub tags: BTreeMap<String, String>,
}

#[async_trait]
impl TaskPayload for AutoscalingGroup {
    const KIND: TaskKind = TaskKind::AutoscalingGroup;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        let mut deps = vec![TaskRef::new(
            TaskKind::LaunchConfiguration,
            &self.launch_configuration,
        )];
        deps.extend(self.subnets.iter().map(|s| TaskRef::new(TaskKind::Subnet, s)));
        deps
    }

    fn cloud_id(&self) -> Option<&str> {
        Some(&self.name)
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let Some(group) = ctx.cloud.describe_autoscaling_group(&self.name).await? else {
            return Ok(None);
        };
        debug!(asg = %group.name, "found matching autoscaling group");
        Ok(Some(Self {
            name: self.name.clone(),
            launch_configuration: group.launch_configuration.clone(),
            min_size: Some(group.min_size),
            max_size: Some(group.max_size),
            subnets: group.subnet_ids.clone(),
            tags: group.tags.clone(),
        }))
    }

    fn changes(actual: &Self, expected: &Self, ctx: &TaskContext<'_>) -> Self {
        let expected_subnet_ids: Option<Vec<String>> = expected
            .subnets
            .iter()
            .map(|name| ctx.graph.cloud_id(TaskKind::Subnet, name).ok())
            .collect();
        let subnets = match expected_subnet_ids {
            Some(ids) => {
                let actual_set: BTreeSet<&String> = actual.subnets.iter().collect();
                let expected_set: BTreeSet<&String> = ids.iter().collect();
                if actual_set == expected_set {
                    Vec::new()
                } else {
                    expected.subnets.clone()
                }
            }
            None => expected.subnets.clone(),
        };

        Self {
            name: expected.name.clone(),
            launch_configuration: if actual.launch_configuration == expected.launch_configuration {
                String::new()
            } else {
                expected.launch_configuration.clone()
            },
            min_size: field_change(&actual.min_size, &expected.min_size),
            max_size: field_change(&actual.max_size, &expected.max_size),
            subnets,
            tags: if actual.tags == expected.tags {
                BTreeMap::new()
            } else {
                expected.tags.clone()
            },
        }
    }

    fn has_changes(changes: &Self) -> bool {
        !changes.launch_configuration.is_empty()
            || changes.min_size.is_some()
            || changes.max_size.is_some()
            || !changes.subnets.is_empty()
            || !changes.tags.is_empty()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, _changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.launch_configuration.is_empty() {
                return Err(Error::required_field("LaunchConfiguration"));
            }
            if expected.subnets.is_empty() {
                return Err(Error::required_field("Subnets"));
            }
            if expected.min_size.is_none() || expected.max_size.is_none() {
                return Err(Error::required_field("MinSize/MaxSize"));
            }
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        _changes: &Self,
    ) -> Result<()> {
        let subnet_ids: Vec<String> = self
            .subnets
            .iter()
            .map(|name| ctx.graph.cloud_id(TaskKind::Subnet, name))
            .collect::<Result<_>>()?;
        let group = CloudAutoscalingGroup {
            name: self.name.clone(),
            launch_configuration: self.launch_configuration.clone(),
            min_size: self.min_size.unwrap_or(1),
            max_size: self.max_size.unwrap_or(1),
            subnet_ids,
            tags: self.tags.clone(),
        };
        if actual.is_none() {
            debug!(asg = %self.name, "creating autoscaling group");
            ctx.cloud.create_autoscaling_group(&group).await
        } else {
            debug!(asg = %self.name, "updating autoscaling group");
            ctx.cloud.update_autoscaling_group(&group).await
        }
    }

    fn render_emitter(&self, ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let subnets: Vec<String> = self
            .subnets
            .iter()
            .map(|s| ctx.graph.emitter_link(TaskKind::Subnet, s))
            .collect::<Result<_>>()?;
        let tags: Vec<serde_json::Value> = self
            .tags
            .iter()
            .map(|(key, value)| {
                json!({
                    "key": key,
                    "value": value,
                    "propagate_at_launch": true,
                })
            })
            .collect();

        target.render_resource(
            Self::KIND.emitter_type(),
            &self.name,
            json!({
                "name": self.name,
                "launch_configuration": format!(
                    "${{aws_launch_configuration.{}.id}}",
                    self.launch_configuration
                ),
                "min_size": self.min_size,
                "max_size": self.max_size,
                "vpc_zone_identifier": subnets,
                "tag": tags,
            }),
        )
    }
}
