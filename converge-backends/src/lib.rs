//! converge-backends - backend clients and resource handlers.
//!
//! Memory-backed implementations of the kv, identity, and compute
//! services plus the handlers that drive them, wired together by
//! [`available_handlers`].

use std::sync::Arc;

use tracing::warn;

use converge_core::backend::BackendAdapter;
use converge_core::handler::{HandlerRegistry, ResourceHandler};

pub mod clients;
pub mod handlers;

pub use clients::{MemoryComputeClient, MemoryIdentityClient, MemoryKvClient};
pub use handlers::{KvRecordHandler, RoleAssignmentHandler};

/// Build a registry of the shipped handlers whose backend services the
/// adapter carries.
///
/// A handler whose services are missing is skipped with a warning, never
/// an error: hosts without an identity backend simply cannot declare
/// `role_assignment` resources.
pub fn available_handlers(adapter: &BackendAdapter) -> HandlerRegistry {
    let shipped: [Arc<dyn ResourceHandler>; 2] = [
        Arc::new(KvRecordHandler::new()),
        Arc::new(RoleAssignmentHandler::new()),
    ];

    let mut registry = HandlerRegistry::new();
    for handler in shipped {
        let missing: Vec<&str> = handler
            .required_services()
            .iter()
            .copied()
            .filter(|service| !adapter.supports(service))
            .collect();
        if missing.is_empty() {
            registry.register(handler);
        } else {
            warn!(
                "Skipping handler {}: backend services {:?} not configured",
                handler.kind(),
                missing
            );
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_adapter_yields_both_handlers() {
        let mut adapter = BackendAdapter::new();
        adapter.register(Arc::new(MemoryKvClient::new()));
        adapter.register(Arc::new(MemoryIdentityClient::new()));
        adapter.register(Arc::new(MemoryComputeClient::new()));

        let registry = available_handlers(&adapter);
        assert_eq!(registry.kinds(), vec!["kv_record", "role_assignment"]);
    }

    #[test]
    fn missing_kv_backend_drops_the_record_handler() {
        let mut adapter = BackendAdapter::new();
        adapter.register(Arc::new(MemoryIdentityClient::new()));
        adapter.register(Arc::new(MemoryComputeClient::new()));

        let registry = available_handlers(&adapter);
        assert!(!registry.contains("kv_record"));
        assert!(registry.contains("role_assignment"));
    }

    #[test]
    fn empty_adapter_yields_an_empty_registry() {
        let registry = available_handlers(&BackendAdapter::new());
        assert!(registry.kinds().is_empty());
    }
}
