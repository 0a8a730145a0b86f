//! Executes a single stage: worker call, retries, gate check and artifact.

use super::{CancellationToken, RunEnvironment};
use crate::context::ExecutionContext;
use crate::core::{
    Artifact, ArtifactKind, EventType, PipelineEvent, StageRole, StageRun, StageRunStatus,
};
use crate::errors::{ForgeflowError, WorkerCallError};
use crate::notifications::Notification;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const DEFAULT_REJECTION_REASON: &str = "Rejected by approval agent";

/// How a stage finished when it did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The pipeline may continue.
    Passed,
    /// An approve-role stage rejected. The pipeline must halt.
    Rejected {
        /// Notes from the approval worker.
        reason: String,
    },
}

impl StageOutcome {
    /// Returns true if the pipeline may continue.
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Runs one stage of one pipeline.
#[derive(Debug)]
pub struct StageRunner<'a> {
    env: &'a RunEnvironment,
    token: &'a CancellationToken,
    version: u32,
}

impl<'a> StageRunner<'a> {
    /// Creates a stage runner. `version` is stamped on produced artifacts.
    #[must_use]
    pub fn new(env: &'a RunEnvironment, token: &'a CancellationToken, version: u32) -> Self {
        Self {
            env,
            token,
            version,
        }
    }

    /// Runs the stage with retries.
    ///
    /// Every failed attempt bumps the persisted `retry_count`. Retryable
    /// errors are retried with backoff until the attempt budget is spent,
    /// after which the last error is returned.
    pub async fn run(
        &self,
        run: &StageRun,
        ctx: &mut ExecutionContext,
    ) -> Result<StageOutcome, ForgeflowError> {
        let stage = run.stage_id;
        self.env
            .store
            .modify_stage_run(
                run.id,
                Box::new(|r| {
                    r.status = StageRunStatus::Running;
                    r.started_at = Some(Utc::now());
                    r.completed_at = None;
                    Ok(())
                }),
            )
            .await?;
        self.env
            .store
            .modify_pipeline(
                run.pipeline_id,
                Box::new(move |p| {
                    p.current_stage = Some(stage);
                    Ok(())
                }),
            )
            .await?;

        info!(pipeline_id = %run.pipeline_id, stage = %stage, "Stage started");
        self.env
            .publisher
            .publish(
                PipelineEvent::for_stage(run.pipeline_id, stage, EventType::StageStarted).with_data(
                    json!({ "order": run.order, "domain": run.domain, "role": run.role }),
                ),
            )
            .await;

        let retry = &self.env.config.retry;
        let mut attempt = 1;
        loop {
            let err = match self.attempt(run, ctx).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }

            let retry_count = self.record_failure(run, attempt, &err).await;

            if !retry.has_attempts_after(attempt) {
                warn!(
                    pipeline_id = %run.pipeline_id,
                    stage = %stage,
                    attempt,
                    error = %err,
                    "Stage attempts exhausted"
                );
                return Err(err);
            }

            let delay = retry.delay_after(attempt);
            warn!(
                pipeline_id = %run.pipeline_id,
                stage = %stage,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Stage attempt failed, retrying"
            );
            self.env
                .publisher
                .publish(
                    PipelineEvent::for_stage(run.pipeline_id, stage, EventType::StageRetrying)
                        .with_data(json!({
                            "attempt": attempt,
                            "retry_count": retry_count,
                            "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "error": err.to_string(),
                        })),
                )
                .await;

            if !self.token.sleep(delay).await {
                return Err(self.cancelled());
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        run: &StageRun,
        ctx: &mut ExecutionContext,
    ) -> Result<StageOutcome, ForgeflowError> {
        let stage = run.stage_id;
        let worker = self.env.dispatcher.dispatch(stage);
        let timeout = self.env.config.worker_timeout();

        debug!(pipeline_id = %run.pipeline_id, stage = %stage, worker = worker.name(), "Calling worker");
        let output = match tokio::time::timeout(timeout, worker.run(ctx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(
                    WorkerCallError::timeout(stage, self.env.config.worker_timeout_secs).into(),
                )
            }
        };
        if self.token.is_cancelled() {
            return Err(self.cancelled());
        }

        let output = Value::Object(output);
        let stored = output.clone();
        self.env
            .store
            .modify_stage_run(
                run.id,
                Box::new(move |r| {
                    r.agent_output = Some(stored);
                    Ok(())
                }),
            )
            .await?;
        ctx.record(stage, output.clone());

        let is_gate = run.role == StageRole::Approve;
        if is_gate && !is_approved(&output) {
            return self.reject(run, &output).await;
        }

        if let Some(kind) = ArtifactKind::for_stage(stage) {
            self.persist_artifact(run, kind, &output).await?;
        }

        let approved_by = is_gate.then(|| worker.name().to_string());
        self.env
            .store
            .modify_stage_run(
                run.id,
                Box::new(move |r| {
                    r.status = if is_gate {
                        StageRunStatus::Approved
                    } else {
                        StageRunStatus::Completed
                    };
                    r.completed_at = Some(Utc::now());
                    r.approved_by = approved_by;
                    r.error = None;
                    Ok(())
                }),
            )
            .await?;

        info!(pipeline_id = %run.pipeline_id, stage = %stage, "Stage completed");
        self.env
            .publisher
            .publish(
                PipelineEvent::for_stage(run.pipeline_id, stage, EventType::StageCompleted)
                    .with_data(json!({ "approved": is_gate.then_some(true) })),
            )
            .await;

        Ok(StageOutcome::Passed)
    }

    /// Bumps the persisted `retry_count` and returns the new count.
    ///
    /// A failed write is logged and does not end the retry loop; the count
    /// is then derived from the attempt number.
    async fn record_failure(&self, run: &StageRun, attempt: u32, err: &ForgeflowError) -> u32 {
        let message = err.to_string();
        let bumped = self
            .env
            .store
            .modify_stage_run(
                run.id,
                Box::new(move |r| {
                    r.retry_count += 1;
                    r.error = Some(message);
                    Ok(())
                }),
            )
            .await;
        match bumped {
            Ok(updated) => updated.retry_count,
            Err(store_err) => {
                warn!(
                    pipeline_id = %run.pipeline_id,
                    stage = %run.stage_id,
                    attempt,
                    error = %store_err,
                    "Could not record failed attempt"
                );
                run.retry_count + attempt
            }
        }
    }

    /// Writes the stage's artifact for this pipeline version.
    ///
    /// An attempt that already wrote it, and then failed later, finds it
    /// here: a mutable artifact gets the new content, an immutable one is kept.
    async fn persist_artifact(
        &self,
        run: &StageRun,
        kind: ArtifactKind,
        output: &Value,
    ) -> Result<(), ForgeflowError> {
        let stage = run.stage_id;
        let content = serde_json::to_string(output)?;
        let existing = self
            .env
            .store
            .list_artifacts(run.pipeline_id)
            .await?
            .into_iter()
            .find(|a| a.stage_run_id == run.id && a.version == self.version);

        match existing {
            Some(artifact) if artifact.is_immutable => {
                debug!(pipeline_id = %run.pipeline_id, stage = %stage, artifact_id = %artifact.id, "Artifact already recorded");
            }
            Some(artifact) => {
                debug!(pipeline_id = %run.pipeline_id, stage = %stage, artifact_id = %artifact.id, "Replacing artifact content");
                self.env
                    .store
                    .update_artifact_content(artifact.id, content)
                    .await?;
            }
            None => {
                debug!(pipeline_id = %run.pipeline_id, stage = %stage, kind = %kind, "Persisting artifact");
                self.env
                    .store
                    .insert_artifact(Artifact::for_stage_output(
                        run.pipeline_id,
                        run.id,
                        stage,
                        kind,
                        self.version,
                        content,
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    async fn reject(&self, run: &StageRun, output: &Value) -> Result<StageOutcome, ForgeflowError> {
        let stage = run.stage_id;
        let reason = output
            .get("approval_notes")
            .and_then(Value::as_str)
            .filter(|notes| !notes.trim().is_empty())
            .unwrap_or(DEFAULT_REJECTION_REASON)
            .to_string();

        let rejection = reason.clone();
        self.env
            .store
            .modify_stage_run(
                run.id,
                Box::new(move |r| {
                    r.status = StageRunStatus::Rejected;
                    r.completed_at = Some(Utc::now());
                    r.rejection_reason = Some(rejection);
                    Ok(())
                }),
            )
            .await?;

        warn!(pipeline_id = %run.pipeline_id, stage = %stage, reason = %reason, "Stage rejected");
        self.env.notifications.notify(Notification::Rejected {
            pipeline_id: run.pipeline_id,
            stage,
            reason: reason.clone(),
        });
        self.env
            .publisher
            .publish(
                PipelineEvent::for_stage(run.pipeline_id, stage, EventType::StageFailed)
                    .with_data(json!({ "rejected": true, "reason": reason })),
            )
            .await;

        Ok(StageOutcome::Rejected { reason })
    }

    fn cancelled(&self) -> ForgeflowError {
        ForgeflowError::Cancelled(self.token.reason().unwrap_or_else(|| "cancelled".to_string()))
    }
}

/// Reads the gate verdict. Anything but a boolean `true` rejects.
fn is_approved(output: &Value) -> bool {
    output.get("approved").and_then(Value::as_bool) == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StageId, StageRunStatus};
    use crate::storage::PipelineStore;
    use crate::testing::{ScriptedWorker, TestHarness};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_is_approved_fails_closed() {
        assert!(is_approved(&json!({"approved": true})));
        assert!(!is_approved(&json!({"approved": false})));
        assert!(!is_approved(&json!({"approved": "true"})));
        assert!(!is_approved(&json!({"approval_notes": "looks fine"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_stage_records_output_and_artifact() {
        let harness = TestHarness::architecture_only().await.unwrap();
        let run = harness.stage_run(StageId::Architecture).await.unwrap();
        let mut ctx = harness.context();

        let outcome = StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        assert_eq!(outcome, StageOutcome::Passed);
        assert!(ctx.contains_key("architecture_output"));
        let stored = harness.stage_run(StageId::Architecture).await.unwrap();
        assert_eq!(stored.status, StageRunStatus::Completed);
        assert!(stored.agent_output.is_some());

        let artifacts = harness.store.list_artifacts(harness.pipeline_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, ArtifactKind::ArchitectureDoc);
        assert!(!artifacts[0].is_immutable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_without_verdict_rejects() {
        let harness = TestHarness::architecture_only_with(
            ScriptedWorker::new(StageId::ArchitectureApproval)
                .then_succeed(json!({"approval_notes": ""})),
        )
        .await
        .unwrap();
        let run = harness.stage_run(StageId::ArchitectureApproval).await.unwrap();
        let mut ctx = harness.context();

        let outcome = StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StageOutcome::Rejected {
                reason: DEFAULT_REJECTION_REASON.to_string()
            }
        );
        let stored = harness.stage_run(StageId::ArchitectureApproval).await.unwrap();
        assert_eq!(stored.status, StageRunStatus::Rejected);
        assert!(harness.store.list_artifacts(harness.pipeline_id).await.unwrap().is_empty());
        assert_eq!(harness.events.event_types(), vec!["stage_started", "stage_failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_approval_is_immutable_record() {
        let harness = TestHarness::architecture_only().await.unwrap();
        let run = harness.stage_run(StageId::ArchitectureApproval).await.unwrap();
        let mut ctx = harness.context();

        StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        let stored = harness.stage_run(StageId::ArchitectureApproval).await.unwrap();
        assert_eq!(stored.status, StageRunStatus::Approved);
        assert_eq!(stored.approved_by.as_deref(), Some("Architecture Approval Agent"));

        let artifacts = harness.store.list_artifacts(harness.pipeline_id).await.unwrap();
        assert_eq!(artifacts[0].kind, ArtifactKind::ApprovalRecord);
        assert!(artifacts[0].is_immutable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_review_stage_never_gates() {
        let harness = TestHarness::architecture_only_with(
            ScriptedWorker::new(StageId::ArchitectureReview)
                .then_succeed(json!({"approved": false, "issues": ["naming"]})),
        )
        .await
        .unwrap();
        let run = harness.stage_run(StageId::ArchitectureReview).await.unwrap();
        let mut ctx = harness.context();

        let outcome = StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        assert!(outcome.passed());
        assert!(harness.store.list_artifacts(harness.pipeline_id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_timeout_is_retried() {
        let worker = ScriptedWorker::new(StageId::Architecture)
            .then_hang()
            .then_succeed(json!({"components": []}));
        let calls = worker.call_count_handle();
        let harness = TestHarness::architecture_only_with(worker).await.unwrap();
        let run = harness.stage_run(StageId::Architecture).await.unwrap();
        let mut ctx = harness.context();

        let outcome = StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        assert!(outcome.passed());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let stored = harness.stage_run(StageId::Architecture).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(
            harness.events.event_types(),
            vec!["stage_started", "stage_retrying", "stage_completed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let harness = TestHarness::architecture_only_with(
            ScriptedWorker::new(StageId::Architecture).then_fail("boom"),
        )
        .await
        .unwrap();
        let run = harness.stage_run(StageId::Architecture).await.unwrap();
        let token = harness.token.clone();
        let env = harness.env.clone();
        let mut ctx = harness.context();

        let task = tokio::spawn(async move {
            StageRunner::new(&env, &token, 1).run(&run, &mut ctx).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        harness.token.cancel("user request");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ForgeflowError::Cancelled(reason) if reason == "user request"));
        assert_eq!(harness.stage_run(StageId::Architecture).await.unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_on_artifact_is_retried() {
        let harness = TestHarness::builder()
            .failing_artifact_inserts(1)
            .build()
            .await
            .unwrap();
        let run = harness.stage_run(StageId::Architecture).await.unwrap();
        let mut ctx = harness.context();

        let outcome = StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        assert!(outcome.passed());
        assert_eq!(harness.stage_run(StageId::Architecture).await.unwrap().retry_count, 1);
        assert_eq!(ctx.write_count(StageId::Architecture), 2);
        assert_eq!(
            harness.store.list_artifacts(harness.pipeline_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_completion_keeps_single_approval_record() {
        let harness = TestHarness::architecture_only().await.unwrap();
        harness.store.fail_stage_completions(1);
        let run = harness.stage_run(StageId::ArchitectureApproval).await.unwrap();
        let mut ctx = harness.context();

        let outcome = StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        assert!(outcome.passed());
        let stored = harness.stage_run(StageId::ArchitectureApproval).await.unwrap();
        assert_eq!(stored.status, StageRunStatus::Approved);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(harness.calls.count(StageId::ArchitectureApproval), 2);

        let artifacts = harness.store.list_artifacts(harness.pipeline_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, ArtifactKind::ApprovalRecord);
        assert!(artifacts[0].is_immutable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_completion_replaces_mutable_artifact() {
        let harness = TestHarness::architecture_only_with(
            ScriptedWorker::new(StageId::Architecture)
                .then_succeed(json!({"draft": 1}))
                .then_succeed(json!({"draft": 2})),
        )
        .await
        .unwrap();
        harness.store.fail_stage_completions(1);
        let run = harness.stage_run(StageId::Architecture).await.unwrap();
        let mut ctx = harness.context();

        StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        let artifacts = harness.store.list_artifacts(harness.pipeline_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].content, r#"{"draft":2}"#);
        assert!(artifacts[0].verify());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_retry_bookkeeping_still_retries() {
        let harness = TestHarness::architecture_only_with(
            ScriptedWorker::new(StageId::Architecture).then_fail("upstream 503"),
        )
        .await
        .unwrap();
        harness.store.fail_retry_bumps(1);
        let run = harness.stage_run(StageId::Architecture).await.unwrap();
        let mut ctx = harness.context();

        let outcome = StageRunner::new(&harness.env, &harness.token, 1)
            .run(&run, &mut ctx)
            .await
            .unwrap();

        assert!(outcome.passed());
        assert_eq!(harness.calls.count(StageId::Architecture), 2);
        let stored = harness.stage_run(StageId::Architecture).await.unwrap();
        assert_eq!(stored.status, StageRunStatus::Completed);
        assert_eq!(
            harness.events.event_types(),
            vec!["stage_started", "stage_retrying", "stage_completed"]
        );
        let retrying = &harness.events.events()[1];
        assert_eq!(retrying.data["retry_count"], json!(1));
    }
}
