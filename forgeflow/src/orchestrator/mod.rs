//! The public entry point: start, retry, cancel and approve pipelines.
//!
//! The orchestrator owns one background task per active pipeline. Tasks
//! queue on a semaphore sized by `max_concurrent_pipelines`, and an
//! active-run registry keeps at most one runner per pipeline id.

mod builder;
mod integration_tests;

pub use builder::OrchestratorBuilder;

use crate::catalog;
use crate::config::ForgeflowConfig;
use crate::core::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, Artifact, EventType, PipelineEvent,
    PipelineInstance, PipelineStatus, StageRun,
};
use crate::errors::ForgeflowError;
use crate::events::{EventSubscriber, SubscriberId};
use crate::notifications::Notification;
use crate::runner::{CancellationToken, PipelineRunner, RunEnvironment};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CANCEL_REASON: &str = "cancelled";

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: Uuid,
    token: CancellationToken,
}

/// Starts and supervises pipeline runs.
pub struct Orchestrator {
    env: RunEnvironment,
    permits: Arc<Semaphore>,
    active: Arc<DashMap<Uuid, ActiveRun>>,
    tasks: Mutex<JoinSet<()>>,
}

impl Orchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub(crate) fn from_env(env: RunEnvironment) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(env.config.max_concurrent_pipelines)),
            env,
            active: Arc::new(DashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Returns the engine config.
    #[must_use]
    pub fn config(&self) -> &ForgeflowConfig {
        &self.env.config
    }

    /// Creates a PENDING pipeline for a project and launches its runner.
    ///
    /// Returns immediately with the new pipeline's id.
    pub async fn start_pipeline(
        &self,
        project_id: Uuid,
        triggered_by: &str,
    ) -> Result<Uuid, ForgeflowError> {
        let project = self.env.store.get_project(project_id).await?;
        let pipeline = PipelineInstance::new(&project, triggered_by);
        let pipeline_id = pipeline.id;
        let runs: Vec<StageRun> = catalog::stages_for(&project.enabled_domains, project.deployment_enabled)
            .map(|def| StageRun::new(pipeline_id, def))
            .collect();
        let stage_count = runs.len();

        self.env.store.insert_pipeline(pipeline, runs).await?;
        self.launch(pipeline_id)?;

        info!(
            pipeline_id = %pipeline_id,
            project = %project.name,
            triggered_by,
            stages = stage_count,
            "Pipeline created"
        );
        Ok(pipeline_id)
    }

    /// Restarts a FAILED or REJECTED pipeline from its first stage.
    ///
    /// Stage runs are reset but keep their retry counts, artifacts from
    /// earlier runs are kept, and the pipeline version is bumped.
    pub async fn retry_pipeline(&self, pipeline_id: Uuid) -> Result<(), ForgeflowError> {
        if self.is_pipeline_running(pipeline_id) {
            return Err(ForgeflowError::AlreadyRunning(pipeline_id));
        }

        let pipeline = self
            .env
            .store
            .modify_pipeline(
                pipeline_id,
                Box::new(move |p| {
                    if !p.status.is_retryable() {
                        return Err(ForgeflowError::InvalidState(format!(
                            "pipeline {} cannot be retried from {}",
                            p.id, p.status
                        )));
                    }
                    p.transition(PipelineStatus::Running)?;
                    p.version += 1;
                    p.current_stage = None;
                    p.started_at = Some(chrono::Utc::now());
                    p.completed_at = None;
                    p.status_reason = None;
                    Ok(())
                }),
            )
            .await?;

        for run in self.env.store.list_stage_runs(pipeline_id).await? {
            self.env
                .store
                .modify_stage_run(
                    run.id,
                    Box::new(|r| {
                        r.reset();
                        Ok(())
                    }),
                )
                .await?;
        }

        self.launch(pipeline_id)?;
        info!(pipeline_id = %pipeline_id, version = pipeline.version, "Pipeline retried");
        Ok(())
    }

    /// Forces a PENDING, RUNNING or WAITING_APPROVAL pipeline to FAILED and
    /// signals its runner.
    pub async fn cancel_pipeline(&self, pipeline_id: Uuid) -> Result<(), ForgeflowError> {
        let pipeline = self.env.store.get_pipeline(pipeline_id).await?;
        if !pipeline.status.is_cancellable() {
            return Err(ForgeflowError::InvalidState(format!(
                "pipeline {pipeline_id} cannot be cancelled from {}",
                pipeline.status
            )));
        }

        let token = self.active.get(&pipeline_id).map(|run| run.token.clone());
        if let Some(token) = &token {
            token.cancel(CANCEL_REASON);
        }

        let cancelled = self
            .env
            .store
            .modify_pipeline(
                pipeline_id,
                Box::new(|p| {
                    if !p.status.is_cancellable() {
                        return Err(ForgeflowError::InvalidState(format!(
                            "pipeline {} finished as {} before it could be cancelled",
                            p.id, p.status
                        )));
                    }
                    p.finish(PipelineStatus::Failed, Some(CANCEL_REASON.to_string()))?;
                    Ok(())
                }),
            )
            .await?;

        info!(
            pipeline_id = %pipeline_id,
            stage = ?cancelled.current_stage,
            had_runner = token.is_some(),
            "Pipeline cancelled"
        );
        let mut event = PipelineEvent::new(pipeline_id, EventType::PipelineCancelled)
            .with_data(json!({ "reason": CANCEL_REASON }));
        event.stage_id = cancelled.current_stage;
        self.env.publisher.publish(event).await;
        Ok(())
    }

    /// Records a human decision on a pending approval and wakes the waiting runner.
    ///
    /// A rejection moves the pipeline to REJECTED with `comment` as the reason.
    pub async fn decide_approval(
        &self,
        approval_id: Uuid,
        decision: ApprovalDecision,
        decided_by: &str,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, ForgeflowError> {
        let request = self.env.store.get_approval(approval_id).await?;
        if request.status != ApprovalStatus::Pending {
            return Err(ForgeflowError::InvalidState(format!(
                "approval {approval_id} is already {}",
                request.status
            )));
        }
        let pipeline = self.env.store.get_pipeline(request.pipeline_id).await?;
        if pipeline.status != PipelineStatus::WaitingApproval {
            return Err(ForgeflowError::InvalidState(format!(
                "pipeline {} is {}, not waiting for approval",
                pipeline.id, pipeline.status
            )));
        }
        let waiter = self.env.approvals.claim(approval_id).ok_or_else(|| {
            ForgeflowError::InvalidState(format!("no runner is waiting on approval {approval_id}"))
        })?;

        let decider = decided_by.to_string();
        let notes = comment.clone();
        let decided = self
            .env
            .store
            .modify_approval(
                approval_id,
                Box::new(move |a| {
                    if a.decide(decision.status(), Some(decider), notes) {
                        Ok(())
                    } else {
                        Err(ForgeflowError::InvalidState(format!(
                            "approval {} is already {}",
                            a.id, a.status
                        )))
                    }
                }),
            )
            .await?;

        let reason = comment
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| format!("Rejected by {decided_by}"));
        self.env
            .store
            .modify_pipeline(
                request.pipeline_id,
                Box::new(move |p| {
                    match decision {
                        ApprovalDecision::Approve => p.transition(PipelineStatus::Approved)?,
                        ApprovalDecision::Reject => p.finish(PipelineStatus::Rejected, Some(reason))?,
                    }
                    Ok(())
                }),
            )
            .await?;

        info!(
            pipeline_id = %request.pipeline_id,
            approval_id = %approval_id,
            decision = %decided.status,
            decided_by,
            "Approval decided"
        );
        self.env
            .publisher
            .publish(
                PipelineEvent::for_stage(request.pipeline_id, request.stage_id, EventType::ApprovalDecided)
                    .with_data(json!({
                        "approval_id": approval_id,
                        "status": decided.status,
                        "decided_by": decided_by,
                    })),
            )
            .await;

        if waiter.send(decision).is_err() {
            warn!(approval_id = %approval_id, "Runner stopped waiting before the decision arrived");
        }
        Ok(decided)
    }

    /// Registers an event subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        self.env.publisher.subscribe(subscriber)
    }

    /// Removes an event subscriber. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.env.publisher.unsubscribe(id)
    }

    /// Reads a pipeline.
    pub async fn pipeline(&self, pipeline_id: Uuid) -> Result<PipelineInstance, ForgeflowError> {
        self.env.store.get_pipeline(pipeline_id).await
    }

    /// Lists a pipeline's stage runs in catalog order.
    pub async fn stage_runs(&self, pipeline_id: Uuid) -> Result<Vec<StageRun>, ForgeflowError> {
        self.env.store.list_stage_runs(pipeline_id).await
    }

    /// Lists a pipeline's artifacts, from every run.
    pub async fn list_artifacts(&self, pipeline_id: Uuid) -> Result<Vec<Artifact>, ForgeflowError> {
        self.env.store.list_artifacts(pipeline_id).await
    }

    /// Lists approvals still waiting for a decision.
    pub async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>, ForgeflowError> {
        self.env.store.list_pending_approvals().await
    }

    /// Returns the number of pipelines with a live runner, queued ones included.
    #[must_use]
    pub fn active_pipeline_count(&self) -> usize {
        self.active.len()
    }

    /// Returns true if a runner is live for the pipeline.
    #[must_use]
    pub fn is_pipeline_running(&self, pipeline_id: Uuid) -> bool {
        self.active.contains_key(&pipeline_id)
    }

    /// Cancels every active pipeline, waits for the runners to exit, then
    /// drains the notification pool and the event forwarder.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.active.iter().map(|entry| *entry.key()).collect();
        info!(active = ids.len(), "Orchestrator shutting down");
        for id in ids {
            if let Err(e) = self.cancel_pipeline(id).await {
                warn!(pipeline_id = %id, error = %e, "Could not cancel pipeline during shutdown");
            }
        }
        // Runners whose pipeline finished between listing and cancelling still hold tokens.
        for entry in self.active.iter() {
            entry.token.cancel("orchestrator shutting down");
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Pipeline task ended abnormally");
            }
        }
        self.env.notifications.flush().await;
        self.env.publisher.shutdown().await;
    }

    fn launch(&self, pipeline_id: Uuid) -> Result<(), ForgeflowError> {
        let run = ActiveRun {
            run_id: Uuid::new_v4(),
            token: CancellationToken::new(),
        };
        match self.active.entry(pipeline_id) {
            Entry::Occupied(_) => return Err(ForgeflowError::AlreadyRunning(pipeline_id)),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
            }
        }

        let env = self.env.clone();
        let permits = self.permits.clone();
        let active = self.active.clone();

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                () = run.token.cancelled() => None,
            };
            if let Some(_permit) = permit {
                let runner = PipelineRunner::new(env.clone(), pipeline_id, run.token.clone());
                match runner.run().await {
                    Ok(outcome) => debug!(pipeline_id = %pipeline_id, ?outcome, "Runner finished"),
                    Err(e) => record_runner_error(&env, pipeline_id, &e).await,
                }
            } else {
                debug!(pipeline_id = %pipeline_id, "Cancelled while queued");
            }
            active.remove_if(&pipeline_id, |_, current| current.run_id == run.run_id);
        });
        Ok(())
    }
}

/// Marks a pipeline FAILED after its runner hit an error outside any stage.
async fn record_runner_error(env: &RunEnvironment, pipeline_id: Uuid, err: &ForgeflowError) {
    error!(pipeline_id = %pipeline_id, error = %err, "Pipeline runner failed");
    let reason = err.to_string();
    let result = env
        .store
        .modify_pipeline(
            pipeline_id,
            Box::new(move |p| {
                if !p.status.is_terminal() {
                    p.finish(PipelineStatus::Failed, Some(reason))?;
                }
                Ok(())
            }),
        )
        .await;
    if let Err(e) = result {
        warn!(pipeline_id = %pipeline_id, error = %e, "Could not mark pipeline failed");
        return;
    }

    env.notifications.notify(Notification::Failed {
        pipeline_id,
        stage: None,
        error: err.to_string(),
    });
    env.publisher
        .publish(
            PipelineEvent::new(pipeline_id, EventType::PipelineFailed)
                .with_data(json!({ "error": err.to_string() })),
        )
        .await;
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("env", &self.env)
            .field("available_permits", &self.permits.available_permits())
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
