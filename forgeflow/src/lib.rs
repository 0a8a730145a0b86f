//! # Forgeflow
//!
//! A stage orchestration engine for a software delivery pipeline.
//!
//! A pipeline runs up to fifteen stages in a fixed order: five domains
//! (architecture, development, testing, security, devops), each running an
//! execute, a review and an approve stage. Forgeflow provides:
//!
//! - **Strict state machines**: pipeline and stage statuses only move along legal edges
//! - **Retrying stage runner**: bounded exponential backoff with jitter
//! - **Context propagation**: each stage sees the outputs of the stages before it
//! - **Approval gates**: agent rejections halt the pipeline, optional human sign-off per domain
//! - **Event fan-out**: lifecycle events for subscribers and an external forwarder
//! - **Immutable artifacts**: checksummed stage outputs, approval records never change
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use forgeflow::prelude::*;
//!
//! let orchestrator = Orchestrator::builder()
//!     .config(ForgeflowConfig::from_env()?)
//!     .store(Arc::new(InMemoryStore::new()))
//!     .dispatcher(WorkerDispatcher::with_client(client)?)
//!     .build()?;
//!
//! let pipeline_id = orchestrator.start_pipeline(project_id, "alice").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod catalog;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod notifications;
pub mod observability;
pub mod orchestrator;
pub mod runner;
pub mod storage;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::catalog::{
        behavior, stages_for, PromptWorker, StageDefinition, Worker, WorkerClient,
        WorkerDispatcher, WorkerOutput, WorkerRequest,
    };
    pub use crate::config::{ForgeflowConfig, HumanApprovalConfig};
    pub use crate::context::ExecutionContext;
    pub use crate::core::{
        ApprovalDecision, ApprovalRequest, ApprovalStatus, Artifact, ArtifactKind, Domain,
        EventType, PipelineEvent, PipelineInstance, PipelineStatus, Project, StageId, StageRole,
        StageRun, StageRunStatus,
    };
    pub use crate::errors::{
        ContextConflictError, ForgeflowError, InvalidTransitionError, PersistenceError,
        UnknownStageError, WorkerCallError,
    };
    pub use crate::events::{EventForwarder, EventSubscriber, LoggingSubscriber};
    pub use crate::notifications::{Notification, Notifier};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::orchestrator::{Orchestrator, OrchestratorBuilder};
    pub use crate::runner::{CancellationToken, RetryConfig};
    pub use crate::storage::{InMemoryStore, PipelineStore};
}
