//! Scripted workers and a fault-injecting store.

use crate::catalog::{behavior, Worker, WorkerDispatcher, WorkerOutput};
use crate::context::ExecutionContext;
use crate::core::{
    ApprovalRequest, Artifact, PipelineInstance, Project, StageId, StageRole, StageRun,
};
use crate::errors::{ForgeflowError, PersistenceError, UnknownStageError, WorkerCallError};
use crate::storage::{
    ApprovalUpdate, InMemoryStore, PipelineStore, PipelineUpdate, StageRunUpdate,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One scripted worker response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return this output.
    Succeed(Value),
    /// Fail with this reason.
    Fail(String),
    /// Wait, then return this output.
    Delay(Duration, Value),
    /// Never return.
    Hang,
}

/// Shared, ordered record of which stages were called.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<StageId>>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a call.
    pub fn record(&self, stage: StageId) {
        self.calls.lock().push(stage);
    }

    /// Returns every call in order, retries included.
    #[must_use]
    pub fn stages(&self) -> Vec<StageId> {
        self.calls.lock().clone()
    }

    /// Returns each called stage once, in first-call order.
    #[must_use]
    pub fn distinct_stages(&self) -> Vec<StageId> {
        let mut seen = Vec::new();
        for stage in self.stages() {
            if !seen.contains(&stage) {
                seen.push(stage);
            }
        }
        seen
    }

    /// Returns how many times a stage was called.
    #[must_use]
    pub fn count(&self, stage: StageId) -> usize {
        self.calls.lock().iter().filter(|s| **s == stage).count()
    }
}

/// The output a scripted worker returns once its script runs out.
///
/// Approve-role stages approve; other stages return a small summary.
#[must_use]
pub fn default_output(stage: StageId) -> Value {
    match stage.role() {
        StageRole::Approve => json!({
            "approved": true,
            "approval_notes": format!("{stage} looks good"),
        }),
        _ => json!({
            "stage": stage.as_str(),
            "summary": format!("{stage} finished"),
        }),
    }
}

/// A [`Worker`] that plays back a script of responses.
#[derive(Debug)]
pub struct ScriptedWorker {
    stage: StageId,
    name: String,
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: Value,
    calls: Arc<AtomicUsize>,
    contexts: Arc<Mutex<Vec<Value>>>,
    log: Option<CallLog>,
}

impl ScriptedWorker {
    /// Creates a worker that always returns [`default_output`].
    #[must_use]
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            name: behavior(stage).name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: default_output(stage),
            calls: Arc::new(AtomicUsize::new(0)),
            contexts: Arc::new(Mutex::new(Vec::new())),
            log: None,
        }
    }

    /// Creates an approve-role worker that always rejects with `notes`.
    #[must_use]
    pub fn rejecting(stage: StageId, notes: &str) -> Self {
        Self::new(stage).with_fallback(json!({ "approved": false, "approval_notes": notes }))
    }

    /// Replaces the output returned once the script runs out.
    #[must_use]
    pub fn with_fallback(mut self, output: Value) -> Self {
        self.fallback = output;
        self
    }

    /// Records every call in a shared log.
    #[must_use]
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Queues a successful response.
    #[must_use]
    pub fn then_succeed(self, output: Value) -> Self {
        self.then(ScriptStep::Succeed(output))
    }

    /// Queues a failed response.
    #[must_use]
    pub fn then_fail(self, reason: impl Into<String>) -> Self {
        self.then(ScriptStep::Fail(reason.into()))
    }

    /// Queues a delayed successful response.
    #[must_use]
    pub fn then_delay(self, delay: Duration, output: Value) -> Self {
        self.then(ScriptStep::Delay(delay, output))
    }

    /// Queues a call that never returns.
    #[must_use]
    pub fn then_hang(self) -> Self {
        self.then(ScriptStep::Hang)
    }

    /// Queues a step.
    #[must_use]
    pub fn then(self, step: ScriptStep) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Returns a handle to the call counter.
    #[must_use]
    pub fn call_count_handle(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Returns a handle to the context snapshots seen by each call.
    #[must_use]
    pub fn contexts_handle(&self) -> Arc<Mutex<Vec<Value>>> {
        self.contexts.clone()
    }

    fn shape_output(&self, value: Value) -> WorkerOutput {
        match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("content".to_string(), other);
                map.insert("stage".to_string(), json!(self.stage));
                map
            }
        }
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn stage(&self) -> StageId {
        self.stage
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<WorkerOutput, WorkerCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(ctx.snapshot());
        if let Some(log) = &self.log {
            log.record(self.stage);
        }

        let step = self.script.lock().pop_front();
        match step {
            None => Ok(self.shape_output(self.fallback.clone())),
            Some(ScriptStep::Succeed(output)) => Ok(self.shape_output(output)),
            Some(ScriptStep::Fail(reason)) => Err(WorkerCallError::failed(self.stage, reason)),
            Some(ScriptStep::Delay(delay, output)) => {
                tokio::time::sleep(delay).await;
                Ok(self.shape_output(output))
            }
            Some(ScriptStep::Hang) => std::future::pending().await,
        }
    }
}

/// Builds a dispatcher of scripted workers, all sharing `log`.
///
/// Stages without an entry in `workers` get a default [`ScriptedWorker`].
pub fn scripted_dispatcher(
    workers: Vec<ScriptedWorker>,
    log: &CallLog,
) -> Result<WorkerDispatcher, UnknownStageError> {
    let mut slots: Vec<Option<ScriptedWorker>> = StageId::ALL.iter().map(|_| None).collect();
    for worker in workers {
        let index = worker.stage.index();
        slots[index] = Some(worker);
    }

    StageId::ALL
        .iter()
        .zip(slots)
        .fold(WorkerDispatcher::builder(), |builder, (stage, slot)| {
            let worker = slot.unwrap_or_else(|| ScriptedWorker::new(*stage));
            builder.register(Arc::new(worker.with_log(log.clone())))
        })
        .build()
}

/// An [`InMemoryStore`] that can be told to fail artifact inserts and
/// selected stage-run updates.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    artifact_failures: AtomicUsize,
    completion_failures: Arc<AtomicUsize>,
    retry_bump_failures: Arc<AtomicUsize>,
}

impl FlakyStore {
    /// Creates a store that never fails.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` artifact inserts fail with a persistence error.
    pub fn fail_artifact_inserts(&self, count: usize) {
        self.artifact_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` stage-run updates that mark a stage
    /// COMPLETED or APPROVED fail without committing.
    pub fn fail_stage_completions(&self, count: usize) {
        self.completion_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` stage-run updates that raise `retry_count`
    /// fail without committing.
    pub fn fail_retry_bumps(&self, count: usize) {
        self.retry_bump_failures.store(count, Ordering::SeqCst);
    }

    /// Inserts or replaces a project.
    pub fn insert_project(&self, project: Project) {
        self.inner.insert_project(project);
    }
}

fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PipelineStore for FlakyStore {
    async fn get_project(&self, id: Uuid) -> Result<Project, ForgeflowError> {
        self.inner.get_project(id).await
    }

    async fn insert_pipeline(
        &self,
        pipeline: PipelineInstance,
        stage_runs: Vec<StageRun>,
    ) -> Result<(), ForgeflowError> {
        self.inner.insert_pipeline(pipeline, stage_runs).await
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<PipelineInstance, ForgeflowError> {
        self.inner.get_pipeline(id).await
    }

    async fn modify_pipeline(
        &self,
        id: Uuid,
        update: PipelineUpdate,
    ) -> Result<PipelineInstance, ForgeflowError> {
        self.inner.modify_pipeline(id, update).await
    }

    async fn list_stage_runs(&self, pipeline_id: Uuid) -> Result<Vec<StageRun>, ForgeflowError> {
        self.inner.list_stage_runs(pipeline_id).await
    }

    async fn modify_stage_run(
        &self,
        id: Uuid,
        update: StageRunUpdate,
    ) -> Result<StageRun, ForgeflowError> {
        let completions = self.completion_failures.clone();
        let bumps = self.retry_bump_failures.clone();
        self.inner
            .modify_stage_run(
                id,
                Box::new(move |r| {
                    let retries_before = r.retry_count;
                    update(r)?;
                    let failed = (r.status.is_success() && take_failure(&completions))
                        || (r.retry_count > retries_before && take_failure(&bumps));
                    if failed {
                        return Err(
                            PersistenceError::new("modify_stage_run", "injected failure").into()
                        );
                    }
                    Ok(())
                }),
            )
            .await
    }

    async fn insert_approval(&self, approval: ApprovalRequest) -> Result<(), ForgeflowError> {
        self.inner.insert_approval(approval).await
    }

    async fn get_approval(&self, id: Uuid) -> Result<ApprovalRequest, ForgeflowError> {
        self.inner.get_approval(id).await
    }

    async fn modify_approval(
        &self,
        id: Uuid,
        update: ApprovalUpdate,
    ) -> Result<ApprovalRequest, ForgeflowError> {
        self.inner.modify_approval(id, update).await
    }

    async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>, ForgeflowError> {
        self.inner.list_pending_approvals().await
    }

    async fn insert_artifact(&self, artifact: Artifact) -> Result<(), ForgeflowError> {
        if take_failure(&self.artifact_failures) {
            return Err(PersistenceError::new("insert_artifact", "injected failure").into());
        }
        self.inner.insert_artifact(artifact).await
    }

    async fn list_artifacts(&self, pipeline_id: Uuid) -> Result<Vec<Artifact>, ForgeflowError> {
        self.inner.list_artifacts(pipeline_id).await
    }

    async fn update_artifact_content(
        &self,
        id: Uuid,
        content: String,
    ) -> Result<Artifact, ForgeflowError> {
        self.inner.update_artifact_content(id, content).await
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<(), ForgeflowError> {
        self.inner.delete_artifact(id).await
    }
}
