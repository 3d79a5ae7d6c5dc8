//! Error taxonomy for orchestration operations.
//!
//! Every fallible operation in this crate returns [`LifecycleError`].
//! Backend and store failures are wrapped rather than flattened so
//! callers can still distinguish a transient outage from a caller bug.

use thiserror::Error;

use crate::backend::BackendError;
use crate::resource::ResourceState;
use crate::store::StoreError;

/// Errors that can occur while driving a resource through its lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Declared properties do not satisfy the handler's schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A role assignment names both a project and a domain scope.
    #[error("assignment for role {role:?} sets both project and domain")]
    ConflictingScope { role: String },

    /// A role assignment names neither a project nor a domain scope.
    #[error("assignment for role {role:?} sets neither project nor domain")]
    MissingScope { role: String },

    /// A symbolic name could not be resolved to a backend identifier.
    #[error("no {kind} found with name {name:?}")]
    UnresolvedReference { kind: String, name: String },

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The stored record changed underneath this operation.
    #[error("concurrent modification of resource {0}")]
    ConcurrentModification(String),

    /// The convergence budget ran out before the resource completed.
    #[error("timed out after {attempts} completion checks")]
    Timeout { attempts: u32 },

    /// A completion check reported the resource as failed.
    #[error("completion check failed: {0}")]
    CheckFailed(String),

    /// The operation was cancelled by its owner.
    #[error("operation cancelled")]
    Cancelled,

    /// Credentials or identity headers were missing or malformed.
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// No handler is registered for the requested resource kind.
    #[error("unknown resource kind {0:?}")]
    UnknownKind(String),

    /// No record exists for the requested resource.
    #[error("unknown resource {0:?}")]
    UnknownResource(String),

    /// The record is not in a state that permits the operation.
    #[error("resource {resource_id} is {state}, cannot {operation}")]
    InvalidState {
        resource_id: String,
        state: ResourceState,
        operation: &'static str,
    },

    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;
