//! Resource specs, lifecycle states, and persisted records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::properties::PropertyMap;

/// A declarative description of one resource.
///
/// Immutable after creation: an update supplies a whole new spec. The
/// `resource_id` is set once the record exists and carried on subsequent
/// specs for the same resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: String,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub resource_id: Option<String>,
}

impl ResourceSpec {
    pub fn new(kind: impl Into<String>, properties: PropertyMap) -> Self {
        Self {
            kind: kind.into(),
            properties,
            resource_id: None,
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }
}

/// Lifecycle state of a resource record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Pending,
    CreateInProgress,
    CreateComplete,
    UpdateInProgress,
    UpdateComplete,
    DeleteInProgress,
    DeleteComplete,
    Failed,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Pending => "pending",
            ResourceState::CreateInProgress => "create_in_progress",
            ResourceState::CreateComplete => "create_complete",
            ResourceState::UpdateInProgress => "update_in_progress",
            ResourceState::UpdateComplete => "update_complete",
            ResourceState::DeleteInProgress => "delete_in_progress",
            ResourceState::DeleteComplete => "delete_complete",
            ResourceState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResourceState::Pending),
            "create_in_progress" => Some(ResourceState::CreateInProgress),
            "create_complete" => Some(ResourceState::CreateComplete),
            "update_in_progress" => Some(ResourceState::UpdateInProgress),
            "update_complete" => Some(ResourceState::UpdateComplete),
            "delete_in_progress" => Some(ResourceState::DeleteInProgress),
            "delete_complete" => Some(ResourceState::DeleteComplete),
            "failed" => Some(ResourceState::Failed),
            _ => None,
        }
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// Every operation passes through its `*InProgress` state; none can be
    /// skipped. `Failed` only admits the compensating delete.
    pub fn can_transition(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Pending, CreateInProgress)
                | (CreateInProgress, CreateComplete)
                | (CreateInProgress, Failed)
                | (CreateComplete, UpdateInProgress)
                | (CreateComplete, DeleteInProgress)
                | (UpdateInProgress, UpdateComplete)
                | (UpdateInProgress, Failed)
                | (UpdateComplete, UpdateInProgress)
                | (UpdateComplete, DeleteInProgress)
                | (DeleteInProgress, DeleteComplete)
                | (DeleteInProgress, Failed)
                | (Failed, DeleteInProgress)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ResourceState::DeleteComplete
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            ResourceState::CreateInProgress
                | ResourceState::UpdateInProgress
                | ResourceState::DeleteInProgress
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque progress carried from create to its completion checks.
///
/// Records how far an operation got: the steps attempted in order, named
/// scratch values, and the correlation id the completion check compares
/// against backend state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressToken {
    pub resource_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl ProgressToken {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            correlation_id: None,
            steps: Vec::new(),
            notes: BTreeMap::new(),
        }
    }

    pub fn last_step(&self) -> Option<&str> {
        self.steps.last().map(String::as_str)
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }
}

/// The persisted lifecycle record for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub kind: String,
    pub state: ResourceState,
    /// Last applied (validated, defaulted) properties.
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub progress: Option<ProgressToken>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(
        resource_id: impl Into<String>,
        kind: impl Into<String>,
        state: ResourceState,
        properties: PropertyMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            resource_id: resource_id.into(),
            kind: kind.into(),
            state,
            properties,
            progress: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Answer of a completion check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Done,
    Pending,
    Failed(CompletionFailure),
}

/// Why a convergence attempt gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionFailure {
    Timeout { attempts: u32 },
    Cancelled,
    Check { reason: String },
}

impl fmt::Display for CompletionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionFailure::Timeout { attempts } => {
                write!(f, "timed out after {} completion checks", attempts)
            }
            CompletionFailure::Cancelled => f.write_str("cancelled"),
            CompletionFailure::Check { reason } => f.write_str(reason),
        }
    }
}
