//! Pipeline and stage runners.
//!
//! A [`PipelineRunner`] drives one pipeline through its stage sequence. Each
//! stage is executed by a [`StageRunner`], which owns the retry loop, the
//! approval gate check and artifact persistence.

mod approval;
mod cancellation;
mod pipeline_runner;
mod retry;
mod stage_runner;

pub use approval::ApprovalWaiters;
pub use cancellation::CancellationToken;
pub use pipeline_runner::{PipelineOutcome, PipelineRunner};
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig};
pub use stage_runner::{StageOutcome, StageRunner};

use crate::catalog::WorkerDispatcher;
use crate::config::ForgeflowConfig;
use crate::events::EventPublisher;
use crate::notifications::NotificationDispatcher;
use crate::storage::PipelineStore;
use std::sync::Arc;

/// Collaborators shared by every runner.
#[derive(Clone)]
pub struct RunEnvironment {
    /// Persisted pipeline state.
    pub store: Arc<dyn PipelineStore>,
    /// Stage-to-worker table.
    pub dispatcher: Arc<WorkerDispatcher>,
    /// Lifecycle event fan-out.
    pub publisher: Arc<EventPublisher>,
    /// Background notification pool.
    pub notifications: Arc<NotificationDispatcher>,
    /// Runners suspended on human approval.
    pub approvals: Arc<ApprovalWaiters>,
    /// Engine configuration.
    pub config: Arc<ForgeflowConfig>,
}

impl std::fmt::Debug for RunEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEnvironment")
            .field("dispatcher", &self.dispatcher)
            .field("publisher", &self.publisher)
            .field("notifications", &self.notifications)
            .field("approvals", &self.approvals)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
