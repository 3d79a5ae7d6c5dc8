//! Handler for `kv_record` resources.
//!
//! A record is a small subtree in the kv backend describing one server:
//! `<root>/<image>/<server_id>` holding the originating request id, the
//! owning tenant, and placeholder slots later stages fill in. The server
//! is resolved through the compute backend, so the record always names a
//! machine that exists at create time.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use converge_core::backend::BackendError;
use converge_core::error::LifecycleError;
use converge_core::handler::{OpCtx, ResourceHandler};
use converge_core::properties::{
    Constraint, PropertyKind, PropertyMap, PropertySchema, PropertyValue, SchemaMap,
};
use converge_core::resource::{CompletionStatus, ProgressToken, ResourceRecord, ResourceSpec};

/// Where a record lives and what it describes.
struct Target {
    root: String,
    base: String,
    server_id: String,
    tenant: String,
}

pub struct KvRecordHandler {
    schema: SchemaMap,
}

impl KvRecordHandler {
    pub fn new() -> Self {
        let mut schema = SchemaMap::new();
        schema.insert(
            "root".to_string(),
            PropertySchema::new(PropertyKind::String).default_value("backends"),
        );
        schema.insert(
            "image".to_string(),
            PropertySchema::new(PropertyKind::String).update_allowed(),
        );
        schema.insert(
            "server_id".to_string(),
            PropertySchema::new(PropertyKind::String).required(),
        );
        schema.insert(
            "timeout".to_string(),
            PropertySchema::new(PropertyKind::Number)
                .default_value(60.0)
                .constraint(Constraint::Range {
                    min: Some(1.0),
                    max: Some(3600.0),
                }),
        );
        Self { schema }
    }

    /// Resolve the server and compute the record's target path. The
    /// `image` property overrides the image reported by compute.
    async fn resolve_target(
        &self,
        properties: &PropertyMap,
        op: &OpCtx<'_>,
    ) -> Result<Target, LifecycleError> {
        let server_id = prop_str(properties, "server_id").ok_or_else(|| {
            LifecycleError::SchemaViolation("server_id must be a string".to_string())
        })?;
        let root = prop_str(properties, "root").unwrap_or("backends");

        let server = match op
            .adapter()
            .invoke("compute.get_server", json!({ "id": server_id }))
            .await
        {
            Ok(server) => server,
            Err(e) if e.is_not_found() => {
                return Err(LifecycleError::UnresolvedReference {
                    kind: "server".to_string(),
                    name: server_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let image = match prop_str(properties, "image") {
            Some(image) => image.to_string(),
            None => server
                .get("image")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    LifecycleError::Backend(BackendError::Other(
                        "get_server returned no image".to_string(),
                    ))
                })?,
        };
        let tenant = server
            .get("tenant_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Target {
            base: format!("{}/{}/{}", root, sanitize_image(&image), server_id),
            root: root.to_string(),
            server_id: server_id.to_string(),
            tenant,
        })
    }

    async fn ensure_root(&self, root: &str, op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        match op
            .adapter()
            .invoke("kv.write", json!({ "path": root, "dir": true }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, target: &Target, op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        let entries = [
            ("request", op.context().request_id.clone()),
            ("tenant", target.tenant.clone()),
            ("port", String::new()),
            ("container", String::new()),
            ("monitor", String::new()),
        ];
        for (name, value) in entries {
            op.adapter()
                .invoke(
                    "kv.write",
                    json!({ "path": format!("{}/{}", target.base, name), "value": value }),
                )
                .await?;
        }
        Ok(())
    }

    async fn remove_record(&self, base: &str, op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        match op
            .adapter()
            .invoke("kv.delete", json!({ "path": base, "recursive": true }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Record {} already absent", base);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for KvRecordHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn prop_str<'a>(properties: &'a PropertyMap, name: &str) -> Option<&'a str> {
    properties.get(name).and_then(PropertyValue::as_str)
}

fn sanitize_image(image: &str) -> String {
    image.replace('/', "-")
}

/// Path the record was written under, from the progress token when there
/// is one, otherwise recomputed from properties where possible.
fn recorded_path(record: &ResourceRecord) -> Option<String> {
    record
        .progress
        .as_ref()
        .and_then(|token| token.note("path"))
        .map(str::to_string)
        .or_else(|| {
            let root = prop_str(&record.properties, "root")?;
            let image = prop_str(&record.properties, "image")?;
            let server_id = prop_str(&record.properties, "server_id")?;
            Some(format!("{}/{}/{}", root, sanitize_image(image), server_id))
        })
}

#[async_trait]
impl ResourceHandler for KvRecordHandler {
    fn kind(&self) -> &'static str {
        "kv_record"
    }

    fn schema(&self) -> &SchemaMap {
        &self.schema
    }

    fn required_services(&self) -> &'static [&'static str] {
        &["kv", "compute"]
    }

    async fn create(&self, spec: &ResourceSpec, op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        op.step("resolve-server")?;
        let target = self.resolve_target(&spec.properties, op).await?;
        op.set_correlation(target.server_id.clone());
        op.note("path", target.base.as_str());

        op.step("ensure-root")?;
        self.ensure_root(&target.root, op).await?;

        op.step("write-record")?;
        self.write_record(&target, op).await?;
        info!(
            resource_id = %op.resource_id(),
            path = %target.base,
            "Wrote record"
        );
        Ok(())
    }

    async fn check_create_complete(
        &self,
        token: &ProgressToken,
        op: &OpCtx<'_>,
    ) -> Result<CompletionStatus, LifecycleError> {
        let Some(base) = token.note("path") else {
            return Err(LifecycleError::CheckFailed(
                "progress token has no recorded path".to_string(),
            ));
        };
        let Some(expected) = token.correlation_id.as_deref() else {
            return Err(LifecycleError::CheckFailed(
                "progress token has no correlation id".to_string(),
            ));
        };

        // The record only converges when the tree it landed in is the one
        // named for the expected server.
        let terminal = base.rsplit('/').next().unwrap_or(base);
        if terminal != expected {
            return Ok(CompletionStatus::Pending);
        }
        match op
            .adapter()
            .invoke("kv.read", json!({ "path": format!("{}/request", base) }))
            .await
        {
            Ok(_) => Ok(CompletionStatus::Done),
            Err(e) if e.is_not_found() => Ok(CompletionStatus::Pending),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        desired: &ResourceSpec,
        record: &ResourceRecord,
        op: &OpCtx<'_>,
    ) -> Result<(), LifecycleError> {
        op.step("resolve-server")?;
        let target = self.resolve_target(&desired.properties, op).await?;
        op.set_correlation(target.server_id.clone());
        op.note("path", target.base.as_str());

        if let Some(previous) = recorded_path(record) {
            if previous != target.base {
                op.step("remove-old-record")?;
                self.remove_record(&previous, op).await?;
            }
        }

        op.step("write-record")?;
        self.ensure_root(&target.root, op).await?;
        self.write_record(&target, op).await?;
        Ok(())
    }

    async fn delete(&self, record: &ResourceRecord, op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        let Some(base) = recorded_path(record) else {
            debug!(
                resource_id = %record.resource_id,
                "No recorded path, nothing to remove"
            );
            return Ok(());
        };
        op.note("path", base.as_str());
        op.step("remove-record")?;
        self.remove_record(&base, op).await?;
        Ok(())
    }

    fn attribute(&self, record: &ResourceRecord, name: &str) -> Option<PropertyValue> {
        match name {
            "value" => recorded_path(record).map(PropertyValue::from),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::properties;
    use converge_core::resource::ResourceState;

    #[test]
    fn image_slashes_become_dashes() {
        assert_eq!(sanitize_image("acme/web"), "acme-web");
        assert_eq!(sanitize_image("plain"), "plain");
    }

    #[test]
    fn schema_applies_root_and_timeout_defaults() {
        let handler = KvRecordHandler::new();
        let properties: PropertyMap = [("server_id".to_string(), PropertyValue::from("s1"))]
            .into_iter()
            .collect();

        let effective = properties::validate(&properties, handler.schema()).unwrap();
        assert_eq!(effective["root"], PropertyValue::from("backends"));
        assert_eq!(effective["timeout"], PropertyValue::from(60.0));
    }

    #[test]
    fn schema_rejects_missing_server_id() {
        let handler = KvRecordHandler::new();
        let err = properties::validate(&PropertyMap::new(), handler.schema()).unwrap_err();
        assert!(matches!(err, LifecycleError::SchemaViolation(_)));
    }

    #[test]
    fn recorded_path_prefers_the_token() {
        let properties: PropertyMap = [
            ("root".to_string(), PropertyValue::from("backends")),
            ("image".to_string(), PropertyValue::from("acme/web")),
            ("server_id".to_string(), PropertyValue::from("s1")),
        ]
        .into_iter()
        .collect();
        let mut record = ResourceRecord::new(
            "res-1",
            "kv_record",
            ResourceState::CreateComplete,
            properties,
        );

        // Without a token the path is recomputed from properties.
        assert_eq!(
            recorded_path(&record).as_deref(),
            Some("backends/acme-web/s1")
        );

        let mut token = ProgressToken::new("res-1");
        token
            .notes
            .insert("path".to_string(), "backends/other/s9".to_string());
        record.progress = Some(token);
        assert_eq!(recorded_path(&record).as_deref(), Some("backends/other/s9"));
    }
}
