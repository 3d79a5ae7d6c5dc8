//! Backend client adapter.
//!
//! Handlers never talk to a concrete backend service directly. They name a
//! capability such as `kv.write` or `identity.get_role_id` and the
//! [`BackendAdapter`] routes it to whichever [`BackendClient`] registered
//! that service prefix. Hosts decide at startup which clients exist, so an
//! optional backend that is not installed simply leaves its capabilities
//! unroutable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors reported by backend clients.
///
/// The adapter boundary is where failures are classified: callers decide
/// whether to retry based on [`BackendError::is_transient`], never by
/// matching on backend-specific error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No registered client can serve this capability.
    #[error("unsupported capability {0:?}")]
    UnsupportedCapability(String),

    /// The named remote object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The backend could not be reached; retrying may succeed.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// Whether a retry of the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, BackendError::AlreadyExists(_))
    }
}

/// A client for one backend service.
///
/// Implementations own their transport and credentials and expose a uniform
/// verb-plus-arguments call surface. The verb is the capability name with
/// the service prefix stripped, so a client registered as `kv` sees `read`
/// when the adapter dispatches `kv.read`.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Service prefix this client serves, e.g. `kv` or `identity`.
    fn service(&self) -> &str;

    /// Execute one verb against the backend.
    async fn call(&self, verb: &str, args: &Value) -> Result<Value, BackendError>;
}

/// Routes capability invocations to registered clients.
#[derive(Default)]
pub struct BackendAdapter {
    clients: HashMap<String, Arc<dyn BackendClient>>,
}

impl BackendAdapter {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Register a client under its service prefix, replacing any previous
    /// client for the same service.
    pub fn register(&mut self, client: Arc<dyn BackendClient>) {
        self.clients.insert(client.service().to_string(), client);
    }

    /// Whether a client is registered for the given service prefix.
    pub fn supports(&self, service: &str) -> bool {
        self.clients.contains_key(service)
    }

    /// Registered service prefixes, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a capability of the form `service.verb`.
    pub async fn invoke(&self, capability: &str, args: Value) -> Result<Value, BackendError> {
        let (service, verb) = capability
            .split_once('.')
            .ok_or_else(|| BackendError::UnsupportedCapability(capability.to_string()))?;
        let client = self
            .clients
            .get(service)
            .ok_or_else(|| BackendError::UnsupportedCapability(capability.to_string()))?;
        debug!("Invoking {} on {} backend", verb, service);
        client.call(verb, &args).await
    }
}
