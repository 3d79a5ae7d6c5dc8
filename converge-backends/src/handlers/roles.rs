//! Handler for `role_assignment` resources.
//!
//! Declares which roles a user or group holds in which projects or
//! domains. Names in the declaration are resolved to identity backend
//! ids at operation time; updates revoke what left the declaration
//! before granting what joined it.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use converge_core::error::LifecycleError;
use converge_core::handler::{OpCtx, ResourceHandler};
use converge_core::properties::{
    self, PropertyKind, PropertyMap, PropertySchema, PropertyValue, SchemaMap,
};
use converge_core::resource::{CompletionStatus, ProgressToken, ResourceRecord, ResourceSpec};
use converge_core::roles::{self, RoleAssignment, RoleScope};

pub struct RoleAssignmentHandler {
    schema: SchemaMap,
}

impl RoleAssignmentHandler {
    pub fn new() -> Self {
        let mut schema = SchemaMap::new();
        schema.insert(
            "target_id".to_string(),
            PropertySchema::new(PropertyKind::String).required(),
        );
        schema.insert(
            "roles".to_string(),
            PropertySchema::new(PropertyKind::List).update_allowed(),
        );
        Self { schema }
    }

    async fn grant(
        &self,
        target_id: &str,
        assignment: &RoleAssignment,
        op: &OpCtx<'_>,
    ) -> Result<(), LifecycleError> {
        op.adapter()
            .invoke("identity.grant_role", scope_args(target_id, assignment))
            .await?;
        Ok(())
    }

    /// Revoke one assignment. A grant that is already gone counts as
    /// revoked.
    async fn revoke(
        &self,
        target_id: &str,
        assignment: &RoleAssignment,
        op: &OpCtx<'_>,
    ) -> Result<(), LifecycleError> {
        match op
            .adapter()
            .invoke("identity.revoke_role", scope_args(target_id, assignment))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Assignment {} already revoked", assignment.key());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for RoleAssignmentHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn scope_args(target_id: &str, assignment: &RoleAssignment) -> Value {
    match &assignment.scope {
        RoleScope::Project(id) => json!({
            "target_id": target_id,
            "role_id": assignment.role,
            "project_id": id,
        }),
        RoleScope::Domain(id) => json!({
            "target_id": target_id,
            "role_id": assignment.role,
            "domain_id": id,
        }),
    }
}

fn target_id(properties: &PropertyMap) -> Result<&str, LifecycleError> {
    properties
        .get("target_id")
        .and_then(PropertyValue::as_str)
        .ok_or_else(|| LifecycleError::SchemaViolation("target_id must be a string".to_string()))
}

#[async_trait]
impl ResourceHandler for RoleAssignmentHandler {
    fn kind(&self) -> &'static str {
        "role_assignment"
    }

    fn schema(&self) -> &SchemaMap {
        &self.schema
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["identity"]
    }

    /// Schema validation plus the scope invariant, checked without any
    /// backend traffic so declaration mistakes fail fast.
    async fn validate(&self, spec: &ResourceSpec, _op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        properties::validate(&spec.properties, self.schema())?;
        let raw = roles::parse_assignments(spec.properties.get("roles"))?;
        for assignment in &raw {
            roles::check_scope(assignment)?;
        }
        Ok(())
    }

    async fn create(&self, spec: &ResourceSpec, op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        let target = target_id(&spec.properties)?;
        op.set_correlation(target.to_string());

        op.step("normalize-assignments")?;
        let raw = roles::parse_assignments(spec.properties.get("roles"))?;
        let assignments = roles::normalize(&raw, op.adapter()).await?;

        op.step("grant-roles")?;
        for assignment in &assignments {
            self.grant(target, assignment, op).await?;
        }
        debug!(
            resource_id = %op.resource_id(),
            "Granted {} assignments to {}",
            assignments.len(),
            target
        );
        Ok(())
    }

    /// Grants apply synchronously, so a create that returned is done.
    async fn check_create_complete(
        &self,
        _token: &ProgressToken,
        _op: &OpCtx<'_>,
    ) -> Result<CompletionStatus, LifecycleError> {
        Ok(CompletionStatus::Done)
    }

    async fn update(
        &self,
        desired: &ResourceSpec,
        record: &ResourceRecord,
        op: &OpCtx<'_>,
    ) -> Result<(), LifecycleError> {
        let target = target_id(&desired.properties)?;
        op.set_correlation(target.to_string());

        op.step("normalize-assignments")?;
        let stored_raw = roles::parse_assignments(record.properties.get("roles"))?;
        let stored = roles::normalize(&stored_raw, op.adapter()).await?;
        let desired_raw = roles::parse_assignments(desired.properties.get("roles"))?;
        let desired_assignments = roles::normalize(&desired_raw, op.adapter()).await?;

        let diff = roles::diff(&desired_assignments, &stored);
        if diff.is_empty() {
            debug!(resource_id = %op.resource_id(), "Assignments already match");
            return Ok(());
        }

        // Removals strictly precede additions.
        if !diff.removed.is_empty() {
            op.step("revoke-roles")?;
            for assignment in &diff.removed {
                self.revoke(target, assignment, op).await?;
            }
        }
        if !diff.added.is_empty() {
            op.step("grant-roles")?;
            for assignment in &diff.added {
                self.grant(target, assignment, op).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, record: &ResourceRecord, op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        let target = target_id(&record.properties)?;
        let raw = roles::parse_assignments(record.properties.get("roles"))?;

        op.step("revoke-roles")?;
        for assignment in &raw {
            // A name that no longer resolves has nothing left to revoke.
            let normalized = match roles::normalize_one(assignment, op.adapter()).await {
                Ok(normalized) => normalized,
                Err(LifecycleError::UnresolvedReference { kind, name }) => {
                    debug!("Skipping revoke of unresolved {} {:?}", kind, name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.revoke(target, &normalized, op).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_args_carry_exactly_one_scope_field() {
        let project = RoleAssignment {
            role: "r1".to_string(),
            scope: RoleScope::Project("p1".to_string()),
        };
        let args = scope_args("u1", &project);
        assert_eq!(args["project_id"], "p1");
        assert!(args.get("domain_id").is_none());

        let domain = RoleAssignment {
            role: "r1".to_string(),
            scope: RoleScope::Domain("d1".to_string()),
        };
        let args = scope_args("u1", &domain);
        assert_eq!(args["domain_id"], "d1");
        assert!(args.get("project_id").is_none());
    }

    #[test]
    fn schema_requires_target_id() {
        let handler = RoleAssignmentHandler::new();
        let err = properties::validate(&PropertyMap::new(), handler.schema()).unwrap_err();
        assert!(matches!(err, LifecycleError::SchemaViolation(_)));
    }
}
