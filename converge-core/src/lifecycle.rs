//! The resource lifecycle state machine.
//!
//! [`Lifecycle`] drives a single resource through create, converge,
//! update, and delete. It owns the record for the duration of each call:
//! every transition is a compare-and-swap against the state the machine
//! last saw, so a second writer loses with `ConcurrentModification`
//! instead of corrupting the record. Handlers perform the actual backend
//! mutations; the machine decides state, persistence, and events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::BackendAdapter;
use crate::context::RequestContext;
use crate::error::LifecycleError;
use crate::events::EventSink;
use crate::handler::{CancelFlag, HandlerRegistry, OpCtx, ResourceHandler};
use crate::poller::{PollPolicy, poll_until_complete};
use crate::properties::{self, PropertyValue};
use crate::resource::{
    CompletionFailure, CompletionStatus, ProgressToken, ResourceRecord, ResourceSpec,
    ResourceState,
};
use crate::store::RecordStore;

pub struct Lifecycle {
    adapter: Arc<BackendAdapter>,
    store: Arc<dyn RecordStore>,
    registry: HandlerRegistry,
    events: Arc<dyn EventSink>,
}

impl Lifecycle {
    pub fn new(
        adapter: Arc<BackendAdapter>,
        store: Arc<dyn RecordStore>,
        registry: HandlerRegistry,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            adapter,
            store,
            registry,
            events,
        }
    }

    pub fn adapter(&self) -> &BackendAdapter {
        &self.adapter
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Current record for a resource, if any.
    pub async fn record(&self, resource_id: &str) -> Result<Option<ResourceRecord>, LifecycleError> {
        Ok(self.store.load(resource_id).await?)
    }

    /// Begin creating a resource.
    ///
    /// Validates the spec (failures surface before anything is
    /// persisted), claims the resource id with a `CreateInProgress`
    /// record, and runs the handler's backend mutations. On success the
    /// record stays `CreateInProgress` holding the returned token;
    /// completion is decided by [`Lifecycle::converge_create`]. On
    /// failure the record moves to `Failed` with the partial token
    /// preserved for a compensating delete.
    pub async fn create(
        &self,
        spec: &ResourceSpec,
        ctx: &RequestContext,
        cancel: &CancelFlag,
    ) -> Result<ProgressToken, LifecycleError> {
        let handler = self.handler_for(&spec.kind)?;
        let effective = properties::validate(&spec.properties, handler.schema())?;
        let resource_id = spec
            .resource_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let spec = ResourceSpec {
            kind: spec.kind.clone(),
            properties: effective,
            resource_id: Some(resource_id.clone()),
        };

        let op = self.op_ctx(ctx, resource_id.clone(), cancel.clone());
        handler.validate(&spec, &op).await?;

        let record = ResourceRecord::new(
            resource_id.clone(),
            spec.kind.clone(),
            ResourceState::CreateInProgress,
            spec.properties.clone(),
        );
        if !self
            .store
            .compare_and_swap(&resource_id, None, record.clone())
            .await?
        {
            return Err(LifecycleError::ConcurrentModification(resource_id));
        }
        self.events.state_changed(
            &resource_id,
            &record.kind,
            ResourceState::Pending,
            ResourceState::CreateInProgress,
        );

        match handler.create(&spec, &op).await {
            Ok(()) => {
                let token = op.token();
                let mut next = record.clone();
                next.progress = Some(token.clone());
                next.updated_at = Utc::now();
                if !self
                    .store
                    .compare_and_swap(&resource_id, Some(ResourceState::CreateInProgress), next)
                    .await?
                {
                    return Err(LifecycleError::ConcurrentModification(resource_id));
                }
                Ok(token)
            }
            Err(e) => {
                self.fail_record(&record, "create", op.token(), &e).await;
                Err(e)
            }
        }
    }

    /// Single completion check. Pure query: no transition happens.
    pub async fn check_create_complete(
        &self,
        token: &ProgressToken,
        ctx: &RequestContext,
    ) -> Result<CompletionStatus, LifecycleError> {
        let record = self.load_required(&token.resource_id).await?;
        let handler = self.handler_for(&record.kind)?;
        let op = self.op_ctx(ctx, token.resource_id.clone(), CancelFlag::new());
        handler.check_create_complete(token, &op).await
    }

    /// Poll the completion check until the create converges.
    ///
    /// Transient backend errors count as pending and are absorbed by the
    /// poll budget. `Done` moves the record to `CreateComplete`; timeout,
    /// cancellation, and failed checks move it to `Failed`.
    pub async fn converge_create(
        &self,
        token: &ProgressToken,
        ctx: &RequestContext,
        policy: &PollPolicy,
        cancel: &CancelFlag,
    ) -> Result<(), LifecycleError> {
        let record = self.load_required(&token.resource_id).await?;
        if record.state != ResourceState::CreateInProgress {
            return Err(LifecycleError::InvalidState {
                resource_id: record.resource_id.clone(),
                state: record.state,
                operation: "converge_create",
            });
        }
        let handler = self.handler_for(&record.kind)?;

        let attempts = AtomicU32::new(0);
        // Shared references are Copy, so the `async move` blocks below can
        // lift them out of the FnMut closure without borrowing it.
        let counter = &attempts;
        let handler = &handler;
        let status = poll_until_complete(
            || async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if cancel.is_cancelled() {
                    return CompletionStatus::Failed(CompletionFailure::Cancelled);
                }
                let op = self.op_ctx(ctx, token.resource_id.clone(), cancel.clone());
                match handler.check_create_complete(token, &op).await {
                    Ok(CompletionStatus::Pending) => {
                        self.events
                            .poll_attempt(&token.resource_id, attempt, "not yet converged");
                        CompletionStatus::Pending
                    }
                    Ok(status) => status,
                    Err(LifecycleError::Backend(e)) if e.is_transient() => {
                        self.events
                            .poll_attempt(&token.resource_id, attempt, "backend unavailable");
                        CompletionStatus::Pending
                    }
                    Err(e) => CompletionStatus::Failed(CompletionFailure::Check {
                        reason: e.to_string(),
                    }),
                }
            },
            policy,
        )
        .await;

        match status {
            CompletionStatus::Done => {
                let current = self.load_required(&token.resource_id).await?;
                let mut done = current.clone();
                done.state = ResourceState::CreateComplete;
                done.updated_at = Utc::now();
                if !self
                    .store
                    .compare_and_swap(
                        &token.resource_id,
                        Some(ResourceState::CreateInProgress),
                        done,
                    )
                    .await?
                {
                    return Err(LifecycleError::ConcurrentModification(
                        token.resource_id.clone(),
                    ));
                }
                self.events.state_changed(
                    &token.resource_id,
                    &current.kind,
                    ResourceState::CreateInProgress,
                    ResourceState::CreateComplete,
                );
                Ok(())
            }
            // The poller never surfaces Pending; treat it as exhausted.
            CompletionStatus::Pending => Err(LifecycleError::Timeout {
                attempts: attempts.load(Ordering::SeqCst),
            }),
            CompletionStatus::Failed(failure) => {
                let error = match failure {
                    CompletionFailure::Timeout { attempts } => LifecycleError::Timeout { attempts },
                    CompletionFailure::Cancelled => LifecycleError::Cancelled,
                    CompletionFailure::Check { reason } => LifecycleError::CheckFailed(reason),
                };
                let current = self.load_required(&token.resource_id).await?;
                self.fail_record(&current, "converge_create", token.clone(), &error)
                    .await;
                Err(error)
            }
        }
    }

    /// Move a resource to a new desired configuration.
    ///
    /// Only legal from `CreateComplete` or `UpdateComplete`. The handler
    /// sees both the desired spec and the stored record and applies
    /// removals before additions. An empty diff is a successful no-op.
    pub async fn update(
        &self,
        desired: &ResourceSpec,
        ctx: &RequestContext,
        cancel: &CancelFlag,
    ) -> Result<(), LifecycleError> {
        let resource_id = desired.resource_id.clone().ok_or_else(|| {
            LifecycleError::SchemaViolation("update requires a resource_id".to_string())
        })?;
        let record = self.load_required(&resource_id).await?;
        if !matches!(
            record.state,
            ResourceState::CreateComplete | ResourceState::UpdateComplete
        ) {
            return Err(LifecycleError::InvalidState {
                resource_id,
                state: record.state,
                operation: "update",
            });
        }
        if desired.kind != record.kind {
            return Err(LifecycleError::SchemaViolation(format!(
                "cannot change resource kind from {:?} to {:?}",
                record.kind, desired.kind
            )));
        }
        let handler = self.handler_for(&record.kind)?;
        let effective = properties::validate(&desired.properties, handler.schema())?;
        properties::validate_update(&record.properties, &effective, handler.schema())?;
        let desired = ResourceSpec {
            kind: record.kind.clone(),
            properties: effective,
            resource_id: Some(resource_id.clone()),
        };
        let op = self.op_ctx(ctx, resource_id.clone(), cancel.clone());
        handler.validate(&desired, &op).await?;

        let in_progress = self
            .transition(&record, ResourceState::UpdateInProgress, "update")
            .await?;

        match handler.update(&desired, &record, &op).await {
            Ok(()) => {
                let mut next = in_progress.clone();
                next.state = ResourceState::UpdateComplete;
                next.properties = desired.properties.clone();
                next.progress = Some(op.token());
                next.updated_at = Utc::now();
                if !self
                    .store
                    .compare_and_swap(&resource_id, Some(ResourceState::UpdateInProgress), next)
                    .await?
                {
                    return Err(LifecycleError::ConcurrentModification(resource_id));
                }
                self.events.state_changed(
                    &resource_id,
                    &record.kind,
                    ResourceState::UpdateInProgress,
                    ResourceState::UpdateComplete,
                );
                Ok(())
            }
            Err(e) => {
                self.fail_record(&in_progress, "update", op.token(), &e).await;
                Err(e)
            }
        }
    }

    /// Tear a resource down.
    ///
    /// Idempotent: an absent record or one already in `DeleteComplete`
    /// succeeds without touching any backend.
    pub async fn delete(
        &self,
        resource_id: &str,
        ctx: &RequestContext,
        cancel: &CancelFlag,
    ) -> Result<(), LifecycleError> {
        let Some(record) = self.store.load(resource_id).await? else {
            debug!("Delete of unknown resource {} is a no-op", resource_id);
            return Ok(());
        };
        if record.state == ResourceState::DeleteComplete {
            return Ok(());
        }
        let handler = self.handler_for(&record.kind)?;
        let in_progress = self
            .transition(&record, ResourceState::DeleteInProgress, "delete")
            .await?;
        let op = self.op_ctx(ctx, record.resource_id.clone(), cancel.clone());

        match handler.delete(&record, &op).await {
            Ok(()) => {
                let mut next = in_progress.clone();
                next.state = ResourceState::DeleteComplete;
                next.updated_at = Utc::now();
                if !self
                    .store
                    .compare_and_swap(resource_id, Some(ResourceState::DeleteInProgress), next)
                    .await?
                {
                    return Err(LifecycleError::ConcurrentModification(
                        resource_id.to_string(),
                    ));
                }
                self.events.state_changed(
                    resource_id,
                    &record.kind,
                    ResourceState::DeleteInProgress,
                    ResourceState::DeleteComplete,
                );
                Ok(())
            }
            Err(e) => {
                self.fail_record(&in_progress, "delete", op.token(), &e).await;
                Err(e)
            }
        }
    }

    /// Resolve a read-only attribute of a live resource.
    pub async fn attribute(
        &self,
        resource_id: &str,
        name: &str,
    ) -> Result<Option<PropertyValue>, LifecycleError> {
        let record = self.load_required(resource_id).await?;
        let handler = self.handler_for(&record.kind)?;
        Ok(handler.attribute(&record, name))
    }

    fn handler_for(&self, kind: &str) -> Result<Arc<dyn ResourceHandler>, LifecycleError> {
        self.registry
            .get(kind)
            .ok_or_else(|| LifecycleError::UnknownKind(kind.to_string()))
    }

    async fn load_required(&self, resource_id: &str) -> Result<ResourceRecord, LifecycleError> {
        self.store
            .load(resource_id)
            .await?
            .ok_or_else(|| LifecycleError::UnknownResource(resource_id.to_string()))
    }

    fn op_ctx<'a>(
        &'a self,
        ctx: &'a RequestContext,
        resource_id: String,
        cancel: CancelFlag,
    ) -> OpCtx<'a> {
        OpCtx::new(ctx, &self.adapter, self.events.as_ref(), resource_id, cancel)
    }

    /// Guarded transition between states, surfacing illegal moves as
    /// `InvalidState` and lost races as `ConcurrentModification`.
    async fn transition(
        &self,
        current: &ResourceRecord,
        next_state: ResourceState,
        operation: &'static str,
    ) -> Result<ResourceRecord, LifecycleError> {
        if !current.state.can_transition(next_state) {
            return Err(LifecycleError::InvalidState {
                resource_id: current.resource_id.clone(),
                state: current.state,
                operation,
            });
        }
        let mut next = current.clone();
        next.state = next_state;
        next.error = None;
        next.updated_at = Utc::now();
        if !self
            .store
            .compare_and_swap(&current.resource_id, Some(current.state), next.clone())
            .await?
        {
            return Err(LifecycleError::ConcurrentModification(
                current.resource_id.clone(),
            ));
        }
        self.events
            .state_changed(&current.resource_id, &current.kind, current.state, next_state);
        Ok(next)
    }

    /// Move a record to `Failed`, preserving partial progress for the
    /// compensating delete. The original operation error wins over any
    /// bookkeeping failure here.
    async fn fail_record(
        &self,
        current: &ResourceRecord,
        operation: &'static str,
        token: ProgressToken,
        error: &LifecycleError,
    ) {
        self.events
            .operation_failed(&current.resource_id, operation, error);
        let mut failed = current.clone();
        failed.state = ResourceState::Failed;
        failed.progress = Some(token);
        failed.error = Some(error.to_string());
        failed.updated_at = Utc::now();
        match self
            .store
            .compare_and_swap(&current.resource_id, Some(current.state), failed)
            .await
        {
            Ok(true) => {
                self.events.state_changed(
                    &current.resource_id,
                    &current.kind,
                    current.state,
                    ResourceState::Failed,
                );
            }
            Ok(false) => {
                warn!(
                    resource_id = %current.resource_id,
                    "Record changed while recording failure"
                );
            }
            Err(e) => {
                warn!(
                    resource_id = %current.resource_id,
                    error = %e,
                    "Could not record failure"
                );
            }
        }
    }
}
