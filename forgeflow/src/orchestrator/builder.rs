//! Orchestrator builder with validation.

use super::Orchestrator;
use crate::catalog::WorkerDispatcher;
use crate::config::ForgeflowConfig;
use crate::errors::ForgeflowError;
use crate::events::{EventForwarder, EventPublisher, ForwardingQueue};
use crate::notifications::{LoggingNotifier, NotificationDispatcher, Notifier};
use crate::runner::{ApprovalWaiters, RunEnvironment};
use crate::storage::PipelineStore;
use std::sync::Arc;

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: ForgeflowConfig,
    store: Option<Arc<dyn PipelineStore>>,
    dispatcher: Option<WorkerDispatcher>,
    notifier: Option<Arc<dyn Notifier>>,
    forwarder: Option<Arc<dyn EventForwarder>>,
}

impl OrchestratorBuilder {
    /// Creates a builder with the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the config.
    #[must_use]
    pub fn config(mut self, config: ForgeflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the persistence collaborator. Required.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn PipelineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the worker table. Required.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: WorkerDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sets the notification channel. Defaults to [`LoggingNotifier`].
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Forwards every event to an external durable log.
    #[must_use]
    pub fn forwarder(mut self, forwarder: Arc<dyn EventForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Validates the config and wires the orchestrator.
    ///
    /// Must be called inside a Tokio runtime when a forwarder is set, since
    /// the forwarding queue spawns its drain task here.
    ///
    /// # Errors
    ///
    /// Returns `ForgeflowError::Config` for an invalid config or a missing
    /// store or dispatcher.
    pub fn build(self) -> Result<Orchestrator, ForgeflowError> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| ForgeflowError::Config("a pipeline store is required".to_string()))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| ForgeflowError::Config("a worker dispatcher is required".to_string()))?;
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LoggingNotifier));

        let mut publisher = EventPublisher::new();
        if let Some(forwarder) = self.forwarder {
            publisher = publisher
                .with_forwarding(ForwardingQueue::spawn(forwarder, self.config.event_queue_capacity));
        }

        let env = RunEnvironment {
            store,
            dispatcher: Arc::new(dispatcher),
            publisher: Arc::new(publisher),
            notifications: Arc::new(NotificationDispatcher::new(
                notifier,
                self.config.notification_concurrency,
            )),
            approvals: Arc::new(ApprovalWaiters::new()),
            config: Arc::new(self.config),
        };
        Ok(Orchestrator::from_env(env))
    }
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("has_store", &self.store.is_some())
            .field("has_dispatcher", &self.dispatcher.is_some())
            .field("has_forwarder", &self.forwarder.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::testing::{scripted_dispatcher, CallLog};

    #[test]
    fn test_build_requires_store_and_dispatcher() {
        let err = OrchestratorBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("store"));

        let err = OrchestratorBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("dispatcher"));
    }

    #[test]
    fn test_build_validates_config() {
        let err = OrchestratorBuilder::new()
            .config(ForgeflowConfig::new().with_max_concurrent_pipelines(0))
            .store(Arc::new(InMemoryStore::new()))
            .dispatcher(scripted_dispatcher(Vec::new(), &CallLog::new()).unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, ForgeflowError::Config(_)));
    }
}
