//! In-memory compute backend.
//!
//! A flat server inventory. Only the fields the record handler needs are
//! modeled: the image a server runs and the tenant that owns it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use converge_core::backend::{BackendClient, BackendError};
use serde_json::{Value, json};
use tokio::sync::Mutex;

#[derive(Clone)]
struct ServerEntry {
    image: String,
    tenant_id: String,
}

/// Memory-backed client for the `compute` service.
#[derive(Default)]
pub struct MemoryComputeClient {
    servers: Mutex<BTreeMap<String, ServerEntry>>,
}

impl MemoryComputeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_server(&self, id: &str, image: &str, tenant_id: &str) {
        self.servers.lock().await.insert(
            id.to_string(),
            ServerEntry {
                image: image.to_string(),
                tenant_id: tenant_id.to_string(),
            },
        );
    }

    pub async fn remove_server(&self, id: &str) {
        self.servers.lock().await.remove(id);
    }

    async fn get_server(&self, args: &Value) -> Result<Value, BackendError> {
        let id = args
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Other("get_server requires an id".to_string()))?;
        let servers = self.servers.lock().await;
        let entry = servers
            .get(id)
            .ok_or_else(|| BackendError::NotFound(format!("server {:?}", id)))?;
        Ok(json!({
            "id": id,
            "image": entry.image,
            "tenant_id": entry.tenant_id,
        }))
    }
}

#[async_trait]
impl BackendClient for MemoryComputeClient {
    fn service(&self) -> &str {
        "compute"
    }

    async fn call(&self, verb: &str, args: &Value) -> Result<Value, BackendError> {
        match verb {
            "get_server" => self.get_server(args).await,
            _ => Err(BackendError::UnsupportedCapability(format!(
                "compute.{}",
                verb
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_server_resolves() {
        let compute = MemoryComputeClient::new();
        compute.add_server("s1", "acme/web", "t-1").await;

        let server = compute
            .call("get_server", &json!({ "id": "s1" }))
            .await
            .unwrap();
        assert_eq!(server["image"], "acme/web");
        assert_eq!(server["tenant_id"], "t-1");
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let compute = MemoryComputeClient::new();
        let err = compute
            .call("get_server", &json!({ "id": "ghost" }))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
