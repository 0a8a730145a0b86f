//! Projects, configs and a ready-made runner environment for tests.

use super::mocks::{scripted_dispatcher, CallLog, FlakyStore, ScriptedWorker};
use crate::catalog;
use crate::config::ForgeflowConfig;
use crate::context::ExecutionContext;
use crate::core::{Domain, PipelineInstance, Project, StageId, StageRun};
use crate::errors::ForgeflowError;
use crate::events::{CollectingSubscriber, EventPublisher};
use crate::notifications::{CollectingNotifier, NotificationDispatcher};
use crate::runner::{ApprovalWaiters, CancellationToken, PipelineRunner, RunEnvironment};
use crate::storage::PipelineStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A project that runs only the architecture domain.
#[must_use]
pub fn architecture_project() -> Project {
    Project::new("todo-api", "A REST API for todo lists").with_domains([Domain::Architecture])
}

/// A project with every domain enabled.
#[must_use]
pub fn full_project(deployment_enabled: bool) -> Project {
    Project::new("storefront", "An online store with payments and search")
        .with_domains(Domain::ALL)
        .with_deployment(deployment_enabled)
}

/// Default config with millisecond retry backoff.
#[must_use]
pub fn fast_config() -> ForgeflowConfig {
    let config = ForgeflowConfig::default();
    let retry = config.retry.clone().with_base_delay_ms(1).with_max_delay_ms(10);
    config.with_retry(retry)
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
///
/// Returns whether the condition held.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A persisted pipeline wired to scripted workers and collecting sinks.
#[derive(Debug)]
pub struct TestHarness {
    /// Shared runner collaborators.
    pub env: RunEnvironment,
    /// The backing store.
    pub store: Arc<FlakyStore>,
    /// Every published event.
    pub events: Arc<CollectingSubscriber>,
    /// Every delivered notification.
    pub notifier: Arc<CollectingNotifier>,
    /// Worker calls in order.
    pub calls: CallLog,
    /// Cancellation token for the pipeline's run.
    pub token: CancellationToken,
    /// The project.
    pub project: Project,
    /// The persisted pipeline.
    pub pipeline_id: Uuid,
}

impl TestHarness {
    /// Starts building a harness.
    #[must_use]
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// An architecture-only pipeline with default workers.
    pub async fn architecture_only() -> Result<Self, ForgeflowError> {
        Self::builder().build().await
    }

    /// An architecture-only pipeline with one scripted worker replaced.
    pub async fn architecture_only_with(worker: ScriptedWorker) -> Result<Self, ForgeflowError> {
        Self::builder().worker(worker).build().await
    }

    /// Returns a runner for the harness pipeline.
    #[must_use]
    pub fn runner(&self) -> PipelineRunner {
        PipelineRunner::new(self.env.clone(), self.pipeline_id, self.token.clone())
    }

    /// Returns a freshly seeded execution context.
    #[must_use]
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::for_project(
            self.pipeline_id,
            &self.project,
            &self.env.config.scale_requirement,
        )
    }

    /// Reads the pipeline row.
    pub async fn pipeline(&self) -> Result<PipelineInstance, ForgeflowError> {
        self.store.get_pipeline(self.pipeline_id).await
    }

    /// Reads the stage run for `stage`.
    pub async fn stage_run(&self, stage: StageId) -> Result<StageRun, ForgeflowError> {
        self.store
            .list_stage_runs(self.pipeline_id)
            .await?
            .into_iter()
            .find(|r| r.stage_id == stage)
            .ok_or_else(|| ForgeflowError::InvalidState(format!("no stage run for {stage}")))
    }
}

/// Builder for [`TestHarness`].
#[derive(Debug)]
pub struct TestHarnessBuilder {
    project: Project,
    config: ForgeflowConfig,
    workers: Vec<ScriptedWorker>,
    artifact_failures: usize,
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self {
            project: architecture_project(),
            config: ForgeflowConfig::default(),
            workers: Vec::new(),
            artifact_failures: 0,
        }
    }
}

impl TestHarnessBuilder {
    /// Uses this project.
    #[must_use]
    pub fn project(mut self, project: Project) -> Self {
        self.project = project;
        self
    }

    /// Uses this config.
    #[must_use]
    pub fn config(mut self, config: ForgeflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default worker for the worker's stage.
    #[must_use]
    pub fn worker(mut self, worker: ScriptedWorker) -> Self {
        self.workers.push(worker);
        self
    }

    /// Fails the first `count` artifact inserts.
    #[must_use]
    pub fn failing_artifact_inserts(mut self, count: usize) -> Self {
        self.artifact_failures = count;
        self
    }

    /// Persists the project and a PENDING pipeline, and wires the environment.
    pub async fn build(self) -> Result<TestHarness, ForgeflowError> {
        let store = Arc::new(FlakyStore::new());
        store.fail_artifact_inserts(self.artifact_failures);
        store.insert_project(self.project.clone());

        let pipeline = PipelineInstance::new(&self.project, "tester");
        let pipeline_id = pipeline.id;
        let runs = catalog::stages_for(&self.project.enabled_domains, self.project.deployment_enabled)
            .map(|def| StageRun::new(pipeline_id, def))
            .collect();
        store.insert_pipeline(pipeline, runs).await?;

        let calls = CallLog::new();
        let dispatcher = scripted_dispatcher(self.workers, &calls)?;

        let events = Arc::new(CollectingSubscriber::new());
        let publisher = EventPublisher::new();
        publisher.subscribe(events.clone());

        let notifier = Arc::new(CollectingNotifier::new());
        let notifications =
            NotificationDispatcher::new(notifier.clone(), self.config.notification_concurrency);

        let env = RunEnvironment {
            store: store.clone(),
            dispatcher: Arc::new(dispatcher),
            publisher: Arc::new(publisher),
            notifications: Arc::new(notifications),
            approvals: Arc::new(ApprovalWaiters::new()),
            config: Arc::new(self.config),
        };

        Ok(TestHarness {
            env,
            store,
            events,
            notifier,
            calls,
            token: CancellationToken::new(),
            project: self.project,
            pipeline_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineStatus;

    #[tokio::test]
    async fn test_harness_persists_pending_pipeline() {
        let harness = TestHarness::architecture_only().await.unwrap();
        let pipeline = harness.pipeline().await.unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Pending);
        assert_eq!(
            harness.store.list_stage_runs(harness.pipeline_id).await.unwrap().len(),
            3
        );
        assert!(harness.stage_run(StageId::Development).await.is_err());
    }

    #[tokio::test]
    async fn test_devops_runs_follow_deployment_flag() {
        let without = TestHarness::builder()
            .project(full_project(false))
            .build()
            .await
            .unwrap();
        assert!(without.stage_run(StageId::DevopsApproval).await.is_err());

        let with = TestHarness::builder()
            .project(full_project(true))
            .build()
            .await
            .unwrap();
        assert!(with.stage_run(StageId::DevopsApproval).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until() {
        assert!(wait_until(Duration::from_secs(1), || async { true }).await);
        assert!(!wait_until(Duration::from_millis(50), || async { false }).await);
    }
}
