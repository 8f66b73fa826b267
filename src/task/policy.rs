//! IAM role and inline policy tasks

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::cloud::{CloudIamRole, CloudIamRolePolicy};
use crate::target::EmitterTarget;
use crate::{Error, Result};

use super::{field_change, TaskContext, TaskKind, TaskPayload, TaskRef};

/// An IAM role
///
/// The role name is its cloud identity; only the assume-role (trust) policy
/// document is mutable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IamRole {
    /// Role name
    pub name: String,
    /// Assume-role policy document (JSON)
    pub role_policy_document: Option<String>,
}

#[async_trait]
impl TaskPayload for IamRole {
    const KIND: TaskKind = TaskKind::IamRole;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        Vec::new()
    }

    fn cloud_id(&self) -> Option<&str> {
        // Roles are addressed by name throughout.
        Some(&self.name)
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let Some(role) = ctx.cloud.get_iam_role(&self.name).await? else {
            return Ok(None);
        };
        debug!(role = %role.name, "found matching IAM role");
        Ok(Some(Self {
            name: self.name.clone(),
            role_policy_document: Some(role.assume_role_policy_document),
        }))
    }

    fn changes(actual: &Self, expected: &Self, _ctx: &TaskContext<'_>) -> Self {
        Self {
            name: expected.name.clone(),
            role_policy_document: field_change(
                &actual.role_policy_document,
                &expected.role_policy_document,
            ),
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.role_policy_document.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, _changes: &Self) -> Result<()> {
        if actual.is_none() && expected.role_policy_document.is_none() {
            return Err(Error::required_field("RolePolicyDocument"));
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        actual: Option<&Self>,
        changes: &Self,
    ) -> Result<()> {
        let document = self
            .role_policy_document
            .clone()
            .ok_or_else(|| Error::required_field("RolePolicyDocument"))?;
        let role = CloudIamRole {
            name: self.name.clone(),
            assume_role_policy_document: document,
        };
        if actual.is_none() {
            debug!(role = %self.name, "creating IAM role");
            ctx.cloud.create_iam_role(&role).await
        } else if changes.role_policy_document.is_some() {
            debug!(role = %self.name, "updating IAM role trust policy");
            ctx.cloud.update_iam_role(&role).await
        } else {
            Ok(())
        }
    }

    fn render_emitter(&self, _ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let document = self
            .role_policy_document
            .as_deref()
            .ok_or_else(|| Error::required_field("RolePolicyDocument"))?;
        let reference = target.write_data_file(
            Self::KIND.emitter_type(),
            &self.name,
            "policy",
            document.as_bytes(),
        );
        target.render_resource(
            Self::KIND.emitter_type(),
            &self.name,
            json!({
                "name": self.name,
                "assume_role_policy": reference,
            }),
        )
    }
}

/// An inline policy attached to an IAM role
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IamRolePolicy {
    /// Policy name
    pub name: String,
    /// Name of the role task the policy attaches to
    pub role: String,
    /// Policy document (JSON)
    pub policy_document: Option<String>,
}

#[async_trait]
impl TaskPayload for IamRolePolicy {
    const KIND: TaskKind = TaskKind::IamRolePolicy;

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<TaskRef> {
        vec![TaskRef::new(TaskKind::IamRole, &self.role)]
    }

    fn cloud_id(&self) -> Option<&str> {
        Some(&self.name)
    }

    async fn find(&mut self, ctx: &TaskContext<'_>) -> Result<Option<Self>> {
        let Some(policy) = ctx.cloud.get_iam_role_policy(&self.role, &self.name).await? else {
            return Ok(None);
        };
        debug!(policy = %policy.policy_name, "found matching role policy");
        Ok(Some(Self {
            name: self.name.clone(),
            role: self.role.clone(),
            policy_document: Some(policy.policy_document),
        }))
    }

    fn changes(actual: &Self, expected: &Self, _ctx: &TaskContext<'_>) -> Self {
        Self {
            name: expected.name.clone(),
            role: expected.role.clone(),
            policy_document: field_change(&actual.policy_document, &expected.policy_document),
        }
    }

    fn has_changes(changes: &Self) -> bool {
        changes.policy_document.is_some()
    }

    fn check_changes(actual: Option<&Self>, expected: &Self, _changes: &Self) -> Result<()> {
        if actual.is_none() {
            if expected.role.is_empty() {
                return Err(Error::required_field("Role"));
            }
            if expected.policy_document.is_none() {
                return Err(Error::required_field("PolicyDocument"));
            }
        }
        Ok(())
    }

    async fn render_direct(
        &mut self,
        ctx: &TaskContext<'_>,
        _actual: Option<&Self>,
        _changes: &Self,
    ) -> Result<()> {
        let document = self
            .policy_document
            .clone()
            .ok_or_else(|| Error::required_field("PolicyDocument"))?;
        debug!(policy = %self.name, role = %self.role, "putting role policy");
        ctx.cloud
            .put_iam_role_policy(&CloudIamRolePolicy {
                role_name: self.role.clone(),
                policy_name: self.name.clone(),
                policy_document: document,
            })
            .await
    }

    fn render_emitter(&self, _ctx: &TaskContext<'_>, target: &mut EmitterTarget) -> Result<()> {
        let document = self
            .policy_document
            .as_deref()
            .ok_or_else(|| Error::required_field("PolicyDocument"))?;
        let reference = target.write_data_file(
            Self::KIND.emitter_type(),
            &self.name,
            "policy",
            document.as_bytes(),
        );
        target.render_resource(
            Self::KIND.emitter_type(),
            &self.name,
            json!({
                "name": self.name,
                "role": format!("${{aws_iam_role.{}.name}}", self.role),
                "policy": reference,
            }),
        )
    }
}
