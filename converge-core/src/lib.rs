//! converge-core - resource orchestration state machine.
//!
//! Drives declared resources through create, converge, update, and
//! delete against pluggable backends, persisting every transition.

pub mod backend;
pub mod context;
pub mod error;
pub mod events;
pub mod handler;
pub mod lifecycle;
pub mod poller;
pub mod properties;
pub mod resource;
pub mod roles;
pub mod store;

pub use backend::{BackendAdapter, BackendClient, BackendError};
pub use context::{HeaderMap, RequestContext, new_request_id};
pub use error::{LifecycleError, Result};
pub use events::{EventSink, NullSink, TracingSink};
pub use handler::{CancelFlag, HandlerRegistry, OpCtx, ResourceHandler};
pub use lifecycle::Lifecycle;
pub use poller::{PollBudget, PollPolicy, poll_until_complete};
pub use properties::{Constraint, PropertyKind, PropertyMap, PropertySchema, PropertyValue, SchemaMap};
pub use resource::{
    CompletionFailure, CompletionStatus, ProgressToken, ResourceRecord, ResourceSpec,
    ResourceState,
};
pub use roles::{AssignmentDiff, RoleAssignment, RoleScope};
pub use store::{MemoryRecordStore, RecordStore, SqliteRecordStore, StoreError};
