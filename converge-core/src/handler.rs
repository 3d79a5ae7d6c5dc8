//! Resource handlers and the per-operation context they run in.
//!
//! A handler owns the backend logic for one resource kind. The state
//! machine hands it an [`OpCtx`] scoped to the running operation; the
//! handler reports progress through it (`step`, `note`,
//! `set_correlation`) and the machine materializes the result as the
//! record's [`ProgressToken`], on success and on failure alike.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::backend::BackendAdapter;
use crate::context::RequestContext;
use crate::error::LifecycleError;
use crate::events::EventSink;
use crate::properties::{self, PropertyValue, SchemaMap};
use crate::resource::{CompletionStatus, ProgressToken, ResourceRecord, ResourceSpec};

/// Cooperative cancellation signal, shared between an operation's owner
/// and the handler running it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ProgressInner {
    correlation_id: Option<String>,
    steps: Vec<String>,
    notes: BTreeMap<String, String>,
}

/// Everything a handler may touch while one operation runs.
///
/// Cancellation is only observed at step boundaries: a backend call that
/// already started is never interrupted mid-flight.
pub struct OpCtx<'a> {
    ctx: &'a RequestContext,
    adapter: &'a BackendAdapter,
    events: &'a dyn EventSink,
    resource_id: String,
    cancel: CancelFlag,
    progress: Mutex<ProgressInner>,
}

impl<'a> OpCtx<'a> {
    pub(crate) fn new(
        ctx: &'a RequestContext,
        adapter: &'a BackendAdapter,
        events: &'a dyn EventSink,
        resource_id: String,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            ctx,
            adapter,
            events,
            resource_id,
            cancel,
            progress: Mutex::new(ProgressInner::default()),
        }
    }

    pub fn context(&self) -> &RequestContext {
        self.ctx
    }

    pub fn adapter(&self) -> &BackendAdapter {
        self.adapter
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Open the next step of the operation.
    ///
    /// Checks the cancel flag first; once this returns `Ok` the step is
    /// part of the token, so a later failure still shows how far the
    /// operation got.
    pub fn step(&self, name: &str) -> Result<(), LifecycleError> {
        if self.cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }
        self.lock_progress().steps.push(name.to_string());
        self.events.step_completed(&self.resource_id, name);
        Ok(())
    }

    /// Attach a named scratch value to the token.
    pub fn note(&self, key: &str, value: impl Into<String>) {
        self.lock_progress().notes.insert(key.to_string(), value.into());
    }

    /// Set the id a completion check compares backend state against.
    pub fn set_correlation(&self, id: impl Into<String>) {
        self.lock_progress().correlation_id = Some(id.into());
    }

    pub(crate) fn token(&self) -> ProgressToken {
        let inner = self.lock_progress();
        ProgressToken {
            resource_id: self.resource_id.clone(),
            correlation_id: inner.correlation_id.clone(),
            steps: inner.steps.clone(),
            notes: inner.notes.clone(),
        }
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, ProgressInner> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Backend logic for one resource kind.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Kind tag this handler serves, e.g. `kv_record`.
    fn kind(&self) -> &'static str;

    /// Property schema for this kind.
    fn schema(&self) -> &SchemaMap;

    /// Backend services this handler invokes. A registry builder can
    /// skip handlers whose services the adapter does not carry.
    fn required_services(&self) -> &'static [&'static str] {
        &[]
    }

    /// Check a spec before any backend mutation.
    ///
    /// The default validates the properties against [`Self::schema`];
    /// handlers with cross-property invariants override and extend it.
    async fn validate(&self, spec: &ResourceSpec, _op: &OpCtx<'_>) -> Result<(), LifecycleError> {
        properties::validate(&spec.properties, self.schema()).map(|_| ())
    }

    /// Issue the backend mutations that bring the resource into being.
    async fn create(&self, spec: &ResourceSpec, op: &OpCtx<'_>) -> Result<(), LifecycleError>;

    /// Query whether a started create has converged. Pure: no mutations,
    /// no state transitions.
    async fn check_create_complete(
        &self,
        token: &ProgressToken,
        op: &OpCtx<'_>,
    ) -> Result<CompletionStatus, LifecycleError>;

    /// Move the backend from the recorded configuration to `desired`.
    async fn update(
        &self,
        desired: &ResourceSpec,
        record: &ResourceRecord,
        op: &OpCtx<'_>,
    ) -> Result<(), LifecycleError>;

    /// Remove everything the record says was created.
    async fn delete(&self, record: &ResourceRecord, op: &OpCtx<'_>) -> Result<(), LifecycleError>;

    /// Resolve a read-only attribute of a live resource.
    fn attribute(&self, _record: &ResourceRecord, _name: &str) -> Option<PropertyValue> {
        None
    }
}

/// Handlers keyed by resource kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ResourceHandler>) {
        debug!("Registered handler for kind {}", handler.kind());
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
