//! Error types for the forgeflow engine.
//!
//! `ForgeflowError` is the crate-wide error. The dedicated structs carry
//! the fields callers branch on and convert into it with `?`.

use crate::core::{PipelineStatus, StageId};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The main error type for forgeflow operations.
#[derive(Debug, Error)]
pub enum ForgeflowError {
    /// A stage id did not resolve, or a stage has no registered worker.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// A pipeline status change outside the transition table.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransitionError),

    /// An external worker call failed or timed out.
    #[error("{0}")]
    WorkerCall(#[from] WorkerCallError),

    /// The store could not read or commit a row.
    #[error("{0}")]
    Persistence(#[from] PersistenceError),

    /// A write to the execution context touched a key it does not own.
    #[error("{0}")]
    ContextConflict(#[from] ContextConflictError),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. "pipeline".
        entity: &'static str,
        /// The id that was looked up.
        id: Uuid,
    },

    /// An operation's precondition on the current state was not met.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A runner is already active for the pipeline.
    #[error("Pipeline {0} already has an active runner")]
    AlreadyRunning(Uuid),

    /// The run was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// An attempt to modify or delete an immutable artifact.
    #[error("Artifact {0} is immutable")]
    ArtifactImmutable(Uuid),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ForgeflowError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Returns true if the stage loop may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerCall(_) | Self::Persistence(_) | Self::Serialization(_)
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::UnknownStage(_) => "UnknownStage",
            Self::InvalidTransition(_) => "InvalidTransition",
            Self::WorkerCall(_) => "WorkerCall",
            Self::Persistence(_) => "Persistence",
            Self::ContextConflict(_) => "ContextConflict",
            Self::NotFound { .. } => "NotFound",
            Self::InvalidState(_) => "InvalidState",
            Self::AlreadyRunning(_) => "AlreadyRunning",
            Self::Cancelled(_) => "Cancelled",
            Self::ArtifactImmutable(_) => "ArtifactImmutable",
            Self::Config(_) => "Config",
            Self::Serialization(_) => "Serialization",
        };
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        map
    }
}

impl From<serde_json::Error> for ForgeflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised when a stage id cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown stage '{stage_id}': {reason}")]
pub struct UnknownStageError {
    /// The offending stage id.
    pub stage_id: String,
    /// Why resolution failed.
    pub reason: String,
}

impl UnknownStageError {
    /// Creates an error for a string that names no stage.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            reason: "no such stage".to_string(),
        }
    }

    /// Creates an error for a stage with no worker behind it.
    #[must_use]
    pub fn unregistered(stage: StageId) -> Self {
        Self {
            stage_id: stage.to_string(),
            reason: "no worker registered".to_string(),
        }
    }
}

/// Error raised for a status change outside the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid pipeline transition: {from} -> {to}")]
pub struct InvalidTransitionError {
    /// Current status.
    pub from: PipelineStatus,
    /// Requested status.
    pub to: PipelineStatus,
}

impl InvalidTransitionError {
    /// Creates a new invalid transition error.
    #[must_use]
    pub fn new(from: PipelineStatus, to: PipelineStatus) -> Self {
        Self { from, to }
    }
}

/// Errors from an external worker call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerCallError {
    /// The call did not finish within the worker timeout.
    #[error("Worker for stage '{stage}' timed out after {timeout_secs}s")]
    Timeout {
        /// The stage being run.
        stage: StageId,
        /// The timeout that elapsed.
        timeout_secs: u64,
    },

    /// The call failed.
    #[error("Worker for stage '{stage}' failed: {reason}")]
    Failed {
        /// The stage being run.
        stage: StageId,
        /// The failure description.
        reason: String,
    },
}

impl WorkerCallError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(stage: StageId, timeout_secs: u64) -> Self {
        Self::Timeout {
            stage,
            timeout_secs,
        }
    }

    /// Creates a failed-call error.
    #[must_use]
    pub fn failed(stage: StageId, reason: impl Into<String>) -> Self {
        Self::Failed {
            stage,
            reason: reason.into(),
        }
    }

    /// Returns the stage whose worker failed.
    #[must_use]
    pub fn stage(&self) -> StageId {
        match self {
            Self::Timeout { stage, .. } | Self::Failed { stage, .. } => *stage,
        }
    }

    /// Returns true if the call timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error raised when the store fails to read or commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Persistence error during {operation}: {message}")]
pub struct PersistenceError {
    /// The store operation that failed.
    pub operation: String,
    /// The underlying failure.
    pub message: String,
}

impl PersistenceError {
    /// Creates a new persistence error.
    #[must_use]
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Error raised when a context write targets a key it does not own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Context conflict: key '{key}' is already owned by {owner}")]
pub struct ContextConflictError {
    /// The key being written.
    pub key: String,
    /// Who owns the key.
    pub owner: String,
}

impl ContextConflictError {
    /// Creates a new context conflict error.
    #[must_use]
    pub fn new(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
        }
    }
}

/// Error raised when a notification could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Notification via {channel} failed: {message}")]
pub struct NotificationError {
    /// Delivery channel, e.g. "slack".
    pub channel: String,
    /// The underlying failure.
    pub message: String,
}

impl NotificationError {
    /// Creates a new notification error.
    #[must_use]
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
        }
    }
}
