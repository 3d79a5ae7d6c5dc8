//! In-memory identity backend.
//!
//! Keeps name-to-id tables for roles, projects, and domains plus the set
//! of granted role assignments. Lookups return the bare id string;
//! unknown names are `NotFound` so callers can surface them as
//! unresolved references. Every grant and revoke is appended to an
//! operations log, which tests use to assert ordering.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use converge_core::backend::{BackendClient, BackendError};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct IdentityState {
    roles: BTreeMap<String, String>,
    projects: BTreeMap<String, String>,
    domains: BTreeMap<String, String>,
    /// Granted assignments keyed `(target_id, role_id, scope)` where
    /// scope is `project:<id>` or `domain:<id>`.
    grants: BTreeSet<(String, String, String)>,
    ops: Vec<String>,
}

/// Memory-backed client for the `identity` service.
#[derive(Default)]
pub struct MemoryIdentityClient {
    state: Mutex<IdentityState>,
}

impl MemoryIdentityClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_role(&self, name: &str, id: &str) {
        let mut state = self.state.lock().await;
        state.roles.insert(name.to_string(), id.to_string());
    }

    pub async fn add_project(&self, name: &str, id: &str) {
        let mut state = self.state.lock().await;
        state.projects.insert(name.to_string(), id.to_string());
    }

    pub async fn add_domain(&self, name: &str, id: &str) {
        let mut state = self.state.lock().await;
        state.domains.insert(name.to_string(), id.to_string());
    }

    /// Snapshot of the granted assignments.
    pub async fn grants(&self) -> BTreeSet<(String, String, String)> {
        self.state.lock().await.grants.clone()
    }

    /// Grant and revoke calls in the order the backend received them.
    pub async fn operations(&self) -> Vec<String> {
        self.state.lock().await.ops.clone()
    }

    async fn lookup(&self, args: &Value, table: Table) -> Result<Value, BackendError> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Other(format!("{} requires a name", table.verb())))?;
        let state = self.state.lock().await;
        let ids = match table {
            Table::Role => &state.roles,
            Table::Project => &state.projects,
            Table::Domain => &state.domains,
        };
        ids.get(name)
            .map(|id| Value::String(id.clone()))
            .ok_or_else(|| BackendError::NotFound(format!("{} {:?}", table.noun(), name)))
    }

    async fn grant(&self, args: &Value) -> Result<Value, BackendError> {
        let (target, role, scope) = assignment_args(args, "grant_role")?;
        let mut state = self.state.lock().await;
        state.ops.push(format!("grant {} {} {}", target, role, scope));
        state.grants.insert((target, role, scope));
        Ok(json!({ "granted": true }))
    }

    async fn revoke(&self, args: &Value) -> Result<Value, BackendError> {
        let (target, role, scope) = assignment_args(args, "revoke_role")?;
        let mut state = self.state.lock().await;
        state
            .ops
            .push(format!("revoke {} {} {}", target, role, scope));
        if !state.grants.remove(&(target.clone(), role.clone(), scope.clone())) {
            return Err(BackendError::NotFound(format!(
                "assignment {} {} {}",
                target, role, scope
            )));
        }
        debug!("Revoked role {} from {} in {}", role, target, scope);
        Ok(json!({ "revoked": true }))
    }
}

enum Table {
    Role,
    Project,
    Domain,
}

impl Table {
    fn verb(&self) -> &'static str {
        match self {
            Table::Role => "get_role_id",
            Table::Project => "get_project_id",
            Table::Domain => "get_domain_id",
        }
    }

    fn noun(&self) -> &'static str {
        match self {
            Table::Role => "role",
            Table::Project => "project",
            Table::Domain => "domain",
        }
    }
}

fn assignment_args(args: &Value, verb: &str) -> Result<(String, String, String), BackendError> {
    let target = args
        .get("target_id")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Other(format!("{} requires a target_id", verb)))?;
    let role = args
        .get("role_id")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Other(format!("{} requires a role_id", verb)))?;
    let scope = match (
        args.get("project_id").and_then(Value::as_str),
        args.get("domain_id").and_then(Value::as_str),
    ) {
        (Some(project), None) => format!("project:{}", project),
        (None, Some(domain)) => format!("domain:{}", domain),
        _ => {
            return Err(BackendError::Other(format!(
                "{} requires exactly one of project_id or domain_id",
                verb
            )));
        }
    };
    Ok((target.to_string(), role.to_string(), scope))
}

#[async_trait]
impl BackendClient for MemoryIdentityClient {
    fn service(&self) -> &str {
        "identity"
    }

    async fn call(&self, verb: &str, args: &Value) -> Result<Value, BackendError> {
        match verb {
            "get_role_id" => self.lookup(args, Table::Role).await,
            "get_project_id" => self.lookup(args, Table::Project).await,
            "get_domain_id" => self.lookup(args, Table::Domain).await,
            "grant_role" => self.grant(args).await,
            "revoke_role" => self.revoke(args).await,
            _ => Err(BackendError::UnsupportedCapability(format!(
                "identity.{}",
                verb
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookups_return_the_bare_id() {
        let identity = MemoryIdentityClient::new();
        identity.add_role("admin", "r-admin").await;

        let id = identity
            .call("get_role_id", &json!({ "name": "admin" }))
            .await
            .unwrap();
        assert_eq!(id, Value::String("r-admin".to_string()));

        let err = identity
            .call("get_role_id", &json!({ "name": "ghost" }))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn grant_then_revoke_round_trips() {
        let identity = MemoryIdentityClient::new();
        let args = json!({ "target_id": "u1", "role_id": "r1", "project_id": "p1" });

        identity.call("grant_role", &args).await.unwrap();
        assert_eq!(identity.grants().await.len(), 1);

        identity.call("revoke_role", &args).await.unwrap();
        assert!(identity.grants().await.is_empty());

        // A second revoke has nothing to remove.
        let err = identity.call("revoke_role", &args).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn scope_must_be_exactly_one_of_project_or_domain() {
        let identity = MemoryIdentityClient::new();
        let both = json!({
            "target_id": "u1",
            "role_id": "r1",
            "project_id": "p1",
            "domain_id": "d1"
        });
        assert!(identity.call("grant_role", &both).await.is_err());

        let neither = json!({ "target_id": "u1", "role_id": "r1" });
        assert!(identity.call("grant_role", &neither).await.is_err());
    }

    #[tokio::test]
    async fn operations_are_logged_in_order() {
        let identity = MemoryIdentityClient::new();
        identity
            .call(
                "grant_role",
                &json!({ "target_id": "u1", "role_id": "r1", "project_id": "p1" }),
            )
            .await
            .unwrap();
        identity
            .call(
                "revoke_role",
                &json!({ "target_id": "u1", "role_id": "r1", "project_id": "p1" }),
            )
            .await
            .unwrap();

        let ops = identity.operations().await;
        assert_eq!(ops, vec!["grant u1 r1 project:p1", "revoke u1 r1 project:p1"]);
    }
}
