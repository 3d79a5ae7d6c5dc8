//! Role assignment parsing, normalization, and diffing.
//!
//! Assignments arrive as raw property maps naming roles and scopes by
//! human-readable name. They are parsed into [`RawAssignment`] (which can
//! still express an invalid scope), checked, then normalized against the
//! identity backend into [`RoleAssignment`] whose typed scope cannot
//! represent both-or-neither. Diffing is pure set difference over
//! normalized assignments.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::{BackendAdapter, BackendError};
use crate::error::LifecycleError;
use crate::properties::PropertyValue;

/// One assignment as declared in properties, before scope checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAssignment {
    pub role: String,
    pub project: Option<String>,
    pub domain: Option<String>,
}

/// The scope an assignment grants a role in. Exactly one by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleScope {
    Project(String),
    Domain(String),
}

impl RoleScope {
    pub fn value(&self) -> &str {
        match self {
            RoleScope::Project(v) | RoleScope::Domain(v) => v,
        }
    }
}

/// A normalized role assignment: backend identifiers, typed scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: String,
    pub scope: RoleScope,
}

impl RoleAssignment {
    /// Uniqueness key within one scope kind.
    pub fn key(&self) -> String {
        format!("{}:{}", self.role, self.scope.value())
    }
}

/// Assignments to add and to remove, disjoint by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDiff {
    pub added: BTreeSet<RoleAssignment>,
    pub removed: BTreeSet<RoleAssignment>,
}

impl AssignmentDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Parse the `roles` property into raw assignments.
///
/// `None` (property absent) parses as no assignments. Each entry must be
/// a map with a string `role` and optional string `project` / `domain`.
pub fn parse_assignments(
    value: Option<&PropertyValue>,
) -> Result<Vec<RawAssignment>, LifecycleError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let items = value.as_list().ok_or_else(|| {
        LifecycleError::SchemaViolation("roles must be a list of assignments".to_string())
    })?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let entry = item.as_map().ok_or_else(|| {
            LifecycleError::SchemaViolation("each role assignment must be a map".to_string())
        })?;
        for key in entry.keys() {
            if key != "role" && key != "project" && key != "domain" {
                return Err(LifecycleError::SchemaViolation(format!(
                    "unknown assignment field {:?}",
                    key
                )));
            }
        }
        let role = entry
            .get("role")
            .and_then(PropertyValue::as_str)
            .ok_or_else(|| {
                LifecycleError::SchemaViolation(
                    "role assignment requires a string role".to_string(),
                )
            })?
            .to_string();
        let project = field_string(entry.get("project"), "project")?;
        let domain = field_string(entry.get("domain"), "domain")?;
        out.push(RawAssignment {
            role,
            project,
            domain,
        });
    }
    Ok(out)
}

fn field_string(
    value: Option<&PropertyValue>,
    name: &str,
) -> Result<Option<String>, LifecycleError> {
    match value {
        None => Ok(None),
        Some(v) => v.as_str().map(|s| Some(s.to_string())).ok_or_else(|| {
            LifecycleError::SchemaViolation(format!("assignment {} must be a string", name))
        }),
    }
}

/// Enforce the scope invariant on one raw assignment.
pub fn check_scope(raw: &RawAssignment) -> Result<(), LifecycleError> {
    match (&raw.project, &raw.domain) {
        (Some(_), Some(_)) => Err(LifecycleError::ConflictingScope {
            role: raw.role.clone(),
        }),
        (None, None) => Err(LifecycleError::MissingScope {
            role: raw.role.clone(),
        }),
        _ => Ok(()),
    }
}

/// Normalize one raw assignment: resolve role and scope names to ids.
pub async fn normalize_one(
    raw: &RawAssignment,
    adapter: &BackendAdapter,
) -> Result<RoleAssignment, LifecycleError> {
    check_scope(raw)?;
    let role = lookup(adapter, "identity.get_role_id", "role", &raw.role).await?;
    let scope = match (&raw.project, &raw.domain) {
        (Some(project), None) => RoleScope::Project(
            lookup(adapter, "identity.get_project_id", "project", project).await?,
        ),
        (None, Some(domain)) => {
            RoleScope::Domain(lookup(adapter, "identity.get_domain_id", "domain", domain).await?)
        }
        _ => unreachable!("scope invariant checked above"),
    };
    Ok(RoleAssignment { role, scope })
}

/// Normalize a batch of raw assignments.
///
/// The scope invariant is checked for every entry before any backend
/// lookup runs, so an invalid entry fails fast without side traffic.
pub async fn normalize(
    raw: &[RawAssignment],
    adapter: &BackendAdapter,
) -> Result<Vec<RoleAssignment>, LifecycleError> {
    for assignment in raw {
        check_scope(assignment)?;
    }
    let mut out = Vec::with_capacity(raw.len());
    for assignment in raw {
        out.push(normalize_one(assignment, adapter).await?);
    }
    Ok(out)
}

async fn lookup(
    adapter: &BackendAdapter,
    capability: &str,
    kind: &str,
    name: &str,
) -> Result<String, LifecycleError> {
    match adapter.invoke(capability, json!({ "name": name })).await {
        Ok(value) => value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                LifecycleError::Backend(BackendError::Other(format!(
                    "{} returned a non-string id",
                    capability
                )))
            }),
        Err(e) if e.is_not_found() => Err(LifecycleError::UnresolvedReference {
            kind: kind.to_string(),
            name: name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Set difference between desired and stored assignments.
///
/// Duplicates collapse and order is irrelevant. Project- and
/// domain-scoped entries with the same role and value are distinct, so a
/// scope change shows up as one removal plus one addition.
pub fn diff(desired: &[RoleAssignment], stored: &[RoleAssignment]) -> AssignmentDiff {
    let desired: BTreeSet<RoleAssignment> = desired.iter().cloned().collect();
    let stored: BTreeSet<RoleAssignment> = stored.iter().cloned().collect();
    AssignmentDiff {
        added: desired.difference(&stored).cloned().collect(),
        removed: stored.difference(&desired).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendClient;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn project(role: &str, value: &str) -> RoleAssignment {
        RoleAssignment {
            role: role.to_string(),
            scope: RoleScope::Project(value.to_string()),
        }
    }

    fn domain(role: &str, value: &str) -> RoleAssignment {
        RoleAssignment {
            role: role.to_string(),
            scope: RoleScope::Domain(value.to_string()),
        }
    }

    #[test]
    fn diff_partitions_added_and_removed() {
        let stored = vec![project("r1", "p1"), project("r2", "p1"), domain("r1", "d1")];
        let desired = vec![project("r1", "p1"), project("r2", "p2"), domain("r2", "d1")];

        let d = diff(&desired, &stored);
        assert_eq!(
            d.added,
            [project("r2", "p2"), domain("r2", "d1")].into_iter().collect()
        );
        assert_eq!(
            d.removed,
            [project("r2", "p1"), domain("r1", "d1")].into_iter().collect()
        );
        assert!(d.added.is_disjoint(&d.removed));
    }

    #[test]
    fn applying_a_diff_reproduces_the_desired_set() {
        let stored = vec![project("r1", "p1"), project("r2", "p1"), domain("r3", "d1")];
        let desired = vec![project("r2", "p1"), project("r2", "p2"), domain("r4", "d2")];
        let d = diff(&desired, &stored);

        let mut applied: BTreeSet<RoleAssignment> = stored.iter().cloned().collect();
        for r in &d.removed {
            applied.remove(r);
        }
        for a in &d.added {
            applied.insert(a.clone());
        }
        let want: BTreeSet<RoleAssignment> = desired.iter().cloned().collect();
        assert_eq!(applied, want);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let a = vec![project("r1", "p1"), domain("r2", "d1")];
        let d = diff(&a, &a);
        assert!(d.is_empty());
    }

    #[test]
    fn duplicates_collapse() {
        let desired = vec![project("r1", "p1"), project("r1", "p1")];
        let d = diff(&desired, &[]);
        assert_eq!(d.added.len(), 1);
    }

    #[test]
    fn same_key_in_different_scopes_does_not_cancel() {
        let desired = vec![project("r1", "v")];
        let stored = vec![domain("r1", "v")];
        let d = diff(&desired, &stored);
        assert_eq!(d.added, [project("r1", "v")].into_iter().collect());
        assert_eq!(d.removed, [domain("r1", "v")].into_iter().collect());
    }

    #[test]
    fn parse_reads_role_and_scope_fields() {
        let value = PropertyValue::from_json(&serde_json::json!([
            { "role": "admin", "project": "acme" },
            { "role": "reader", "domain": "default" },
        ]))
        .unwrap();
        let raw = parse_assignments(Some(&value)).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].role, "admin");
        assert_eq!(raw[0].project.as_deref(), Some("acme"));
        assert_eq!(raw[1].domain.as_deref(), Some("default"));
    }

    #[test]
    fn parse_of_absent_property_is_empty() {
        assert!(parse_assignments(None).unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        let not_a_list = PropertyValue::String("admin".to_string());
        assert!(parse_assignments(Some(&not_a_list)).is_err());

        let missing_role =
            PropertyValue::from_json(&serde_json::json!([{ "project": "acme" }])).unwrap();
        assert!(parse_assignments(Some(&missing_role)).is_err());

        let unknown_field = PropertyValue::from_json(
            &serde_json::json!([{ "role": "admin", "project": "acme", "user": "u" }]),
        )
        .unwrap();
        assert!(parse_assignments(Some(&unknown_field)).is_err());
    }

    #[test]
    fn scope_invariant_rejects_both_and_neither() {
        let both = RawAssignment {
            role: "admin".to_string(),
            project: Some("p".to_string()),
            domain: Some("d".to_string()),
        };
        assert!(matches!(
            check_scope(&both),
            Err(LifecycleError::ConflictingScope { role }) if role == "admin"
        ));

        let neither = RawAssignment {
            role: "admin".to_string(),
            project: None,
            domain: None,
        };
        assert!(matches!(
            check_scope(&neither),
            Err(LifecycleError::MissingScope { role }) if role == "admin"
        ));
    }

    struct TableIdentity {
        roles: BTreeMap<String, String>,
        projects: BTreeMap<String, String>,
        domains: BTreeMap<String, String>,
    }

    #[async_trait]
    impl BackendClient for TableIdentity {
        fn service(&self) -> &str {
            "identity"
        }

        async fn call(&self, verb: &str, args: &Value) -> Result<Value, BackendError> {
            let name = args
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::Other("missing name".to_string()))?;
            let table = match verb {
                "get_role_id" => &self.roles,
                "get_project_id" => &self.projects,
                "get_domain_id" => &self.domains,
                other => {
                    return Err(BackendError::UnsupportedCapability(format!(
                        "identity.{}",
                        other
                    )));
                }
            };
            table
                .get(name)
                .map(|id| Value::String(id.clone()))
                .ok_or_else(|| BackendError::NotFound(name.to_string()))
        }
    }

    fn make_adapter() -> BackendAdapter {
        let mut adapter = BackendAdapter::new();
        adapter.register(Arc::new(TableIdentity {
            roles: [("admin".to_string(), "r-1".to_string())].into_iter().collect(),
            projects: [("acme".to_string(), "p-1".to_string())].into_iter().collect(),
            domains: [("default".to_string(), "d-1".to_string())].into_iter().collect(),
        }));
        adapter
    }

    #[tokio::test]
    async fn normalize_resolves_names_to_ids() {
        let adapter = make_adapter();
        let raw = vec![
            RawAssignment {
                role: "admin".to_string(),
                project: Some("acme".to_string()),
                domain: None,
            },
            RawAssignment {
                role: "admin".to_string(),
                project: None,
                domain: Some("default".to_string()),
            },
        ];
        let normalized = normalize(&raw, &adapter).await.unwrap();
        assert_eq!(normalized[0], project("r-1", "p-1"));
        assert_eq!(normalized[1], domain("r-1", "d-1"));
    }

    #[tokio::test]
    async fn unknown_name_is_an_unresolved_reference() {
        let adapter = make_adapter();
        let raw = vec![RawAssignment {
            role: "nonesuch".to_string(),
            project: Some("acme".to_string()),
            domain: None,
        }];
        let err = normalize(&raw, &adapter).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::UnresolvedReference { ref kind, ref name }
                if kind == "role" && name == "nonesuch"
        ));
    }

    #[tokio::test]
    async fn scope_errors_fire_before_any_lookup() {
        // No identity client registered: a lookup would fail with
        // UnsupportedCapability, so the scope error proves ordering.
        let adapter = BackendAdapter::new();
        let raw = vec![
            RawAssignment {
                role: "admin".to_string(),
                project: Some("acme".to_string()),
                domain: None,
            },
            RawAssignment {
                role: "reader".to_string(),
                project: Some("p".to_string()),
                domain: Some("d".to_string()),
            },
        ];
        let err = normalize(&raw, &adapter).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ConflictingScope { .. }));
    }
}
