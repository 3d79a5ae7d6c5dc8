//! Observability sink for lifecycle events.
//!
//! The state machine reports what happened through an injected sink
//! instead of a global logger, so embedders can forward events to their
//! own telemetry. All methods default to no-ops; implement the ones you
//! care about.

use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::resource::ResourceState;

/// Receives lifecycle notifications.
pub trait EventSink: Send + Sync {
    /// A record moved between states.
    fn state_changed(
        &self,
        _resource_id: &str,
        _kind: &str,
        _from: ResourceState,
        _to: ResourceState,
    ) {
    }

    /// A handler finished one step of an operation.
    fn step_completed(&self, _resource_id: &str, _step: &str) {}

    /// An operation gave up with an error.
    fn operation_failed(&self, _resource_id: &str, _operation: &str, _error: &LifecycleError) {}

    /// A convergence check came back pending.
    fn poll_attempt(&self, _resource_id: &str, _attempt: u32, _reason: &str) {}
}

/// Default sink: structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn state_changed(&self, resource_id: &str, kind: &str, from: ResourceState, to: ResourceState) {
        info!(
            resource_id = %resource_id,
            kind = %kind,
            from = %from,
            to = %to,
            "Resource state changed"
        );
    }

    fn step_completed(&self, resource_id: &str, step: &str) {
        debug!(resource_id = %resource_id, step = %step, "Step completed");
    }

    fn operation_failed(&self, resource_id: &str, operation: &str, error: &LifecycleError) {
        warn!(
            resource_id = %resource_id,
            operation = %operation,
            error = %error,
            "Operation failed"
        );
    }

    fn poll_attempt(&self, resource_id: &str, attempt: u32, reason: &str) {
        debug!(
            resource_id = %resource_id,
            attempt = attempt,
            reason = %reason,
            "Convergence check pending"
        );
    }
}

/// Sink that drops everything. Useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {}
