//! Stage-to-worker lookup table, validated once at startup.

use super::behaviors::BEHAVIORS;
use super::worker::{PromptWorker, Worker, WorkerClient};
use crate::core::StageId;
use crate::errors::UnknownStageError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves a stage to its worker.
///
/// The table is complete by construction: a dispatcher can only be built
/// once every stage has a worker, so dispatch never fails mid-pipeline.
#[derive(Clone)]
pub struct WorkerDispatcher {
    workers: [Arc<dyn Worker>; StageId::COUNT],
}

impl WorkerDispatcher {
    /// Starts a builder with no workers registered.
    #[must_use]
    pub fn builder() -> WorkerDispatcherBuilder {
        WorkerDispatcherBuilder::default()
    }

    /// Builds a dispatcher with a prompt worker for every stage.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStageError` if a behavior is missing for a stage.
    pub fn with_client(client: Arc<dyn WorkerClient>) -> Result<Self, UnknownStageError> {
        BEHAVIORS
            .iter()
            .fold(Self::builder(), |builder, behavior| {
                builder.register(Arc::new(PromptWorker::new(behavior, client.clone())))
            })
            .build()
    }

    /// Returns the worker for a stage.
    #[must_use]
    pub fn dispatch(&self, stage: StageId) -> Arc<dyn Worker> {
        self.workers[stage.index()].clone()
    }
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.workers.iter().map(|w| w.name()))
            .finish()
    }
}

/// Collects one worker per stage.
#[derive(Default)]
pub struct WorkerDispatcherBuilder {
    slots: [Option<Arc<dyn Worker>>; StageId::COUNT],
}

impl WorkerDispatcherBuilder {
    /// Registers a worker under the stage it reports. A later registration replaces an earlier one.
    #[must_use]
    pub fn register(mut self, worker: Arc<dyn Worker>) -> Self {
        let stage = worker.stage();
        if self.slots[stage.index()].replace(worker).is_some() {
            warn!(stage = %stage, "Replacing registered worker");
        }
        self
    }

    /// Builds the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStageError` naming the first stage without a worker.
    pub fn build(self) -> Result<WorkerDispatcher, UnknownStageError> {
        let mut workers = Vec::with_capacity(StageId::COUNT);
        for (stage, slot) in StageId::ALL.into_iter().zip(self.slots) {
            let worker = slot.ok_or_else(|| UnknownStageError::unregistered(stage))?;
            debug!(stage = %stage, worker = worker.name(), "Registered worker");
            workers.push(worker);
        }
        let workers = workers
            .try_into()
            .map_err(|_: Vec<_>| UnknownStageError::new("<incomplete table>"))?;
        Ok(WorkerDispatcher { workers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockWorkerClient;
    use crate::testing::ScriptedWorker;

    #[test]
    fn test_build_rejects_missing_stage() {
        let builder = StageId::ALL
            .into_iter()
            .filter(|id| *id != StageId::SecurityReview)
            .fold(WorkerDispatcher::builder(), |b, id| {
                b.register(Arc::new(ScriptedWorker::new(id)))
            });

        let err = builder.build().unwrap_err();
        assert_eq!(err.stage_id, "security_review");
    }

    #[test]
    fn test_dispatch_returns_registered_worker() {
        let dispatcher = StageId::ALL
            .into_iter()
            .fold(WorkerDispatcher::builder(), |b, id| {
                b.register(Arc::new(ScriptedWorker::new(id)))
            })
            .build()
            .unwrap();

        for id in StageId::ALL {
            assert_eq!(dispatcher.dispatch(id).stage(), id);
        }
    }

    #[test]
    fn test_with_client_covers_every_stage() {
        let dispatcher = WorkerDispatcher::with_client(Arc::new(MockWorkerClient::new())).unwrap();
        assert_eq!(dispatcher.dispatch(StageId::Devops).name(), "Cloud Engineer Agent");
        assert_eq!(
            dispatcher.dispatch(StageId::TestingApproval).name(),
            "QA Manager Agent"
        );
    }
}
