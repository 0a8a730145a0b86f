//! Drives one pipeline through its stage sequence.

use super::{CancellationToken, RunEnvironment, StageOutcome, StageRunner};
use crate::context::ExecutionContext;
use crate::core::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, EventType, PipelineEvent, PipelineStatus,
    StageId, StageRole, StageRun, StageRunStatus,
};
use crate::errors::ForgeflowError;
use crate::notifications::Notification;
use crate::storage::PipelineUpdate;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

const APPROVAL_TIMEOUT_REASON: &str = "approval timed out";
const ABANDONED_DECISION_REASON: &str = "approval decision was not recorded";
const HUMAN_REJECTION_REASON: &str = "Rejected by human approver";

/// Final result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every enabled stage passed.
    Completed,
    /// An approval gate, automated or human, rejected.
    Rejected {
        /// The gate stage.
        stage: StageId,
        /// Why it rejected.
        reason: String,
    },
    /// A stage failed after exhausting its attempts, or a store call failed.
    Failed {
        /// The failing stage.
        stage: StageId,
        /// Error description.
        error: String,
    },
    /// The run observed cancellation and stopped.
    Cancelled,
}

enum Gate {
    Approved,
    Rejected(String),
    Cancelled,
}

enum Wake {
    Decided(ApprovalDecision),
    Abandoned,
    TimedOut,
    Cancelled,
}

/// Runs the stages of one pipeline in catalog order.
#[derive(Debug)]
pub struct PipelineRunner {
    env: RunEnvironment,
    pipeline_id: Uuid,
    token: CancellationToken,
}

impl PipelineRunner {
    /// Creates a runner for a persisted pipeline.
    #[must_use]
    pub fn new(env: RunEnvironment, pipeline_id: Uuid, token: CancellationToken) -> Self {
        Self {
            env,
            pipeline_id,
            token,
        }
    }

    /// Returns the pipeline this runner drives.
    #[must_use]
    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    /// Runs the pipeline to a terminal outcome.
    ///
    /// The pipeline must be PENDING, or RUNNING when restarted by a retry.
    /// Rejections, stage failures and cancellation are outcomes. Errors are
    /// reserved for store failures outside a stage and illegal transitions.
    pub async fn run(&self) -> Result<PipelineOutcome, ForgeflowError> {
        if self.token.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }

        let store = &self.env.store;
        let pipeline = store.get_pipeline(self.pipeline_id).await?;
        let project = store.get_project(pipeline.project_id).await?;
        let runs = store.list_stage_runs(self.pipeline_id).await?;
        let mut ctx =
            ExecutionContext::for_project(self.pipeline_id, &project, &self.env.config.scale_requirement);

        match pipeline.status {
            PipelineStatus::Pending => {
                let started = self
                    .update_pipeline(Box::new(|p| {
                        p.transition(PipelineStatus::Running)?;
                        p.started_at = Some(Utc::now());
                        Ok(())
                    }))
                    .await?;
                if !started {
                    return Ok(PipelineOutcome::Cancelled);
                }
            }
            PipelineStatus::Running => {}
            other => {
                return Err(ForgeflowError::InvalidState(format!(
                    "pipeline {} cannot run from {other}",
                    self.pipeline_id
                )))
            }
        }

        info!(
            pipeline_id = %self.pipeline_id,
            project = %project.name,
            version = pipeline.version,
            stages = runs.len(),
            "Pipeline started"
        );
        self.publish(PipelineEvent::new(self.pipeline_id, EventType::PipelineStarted).with_data(
            json!({
                "project_id": project.id,
                "triggered_by": pipeline.triggered_by,
                "version": pipeline.version,
            }),
        ))
        .await;

        for run in &runs {
            if !pipeline.runs_domain(run.domain) {
                continue;
            }
            if self.token.is_cancelled() {
                return Ok(PipelineOutcome::Cancelled);
            }

            let outcome = StageRunner::new(&self.env, &self.token, pipeline.version)
                .run(run, &mut ctx)
                .await;
            match outcome {
                Ok(StageOutcome::Passed) => {}
                Ok(StageOutcome::Rejected { reason }) => {
                    return self.reject(run.stage_id, reason).await;
                }
                Err(err) => return self.fail(run, err).await,
            }

            if run.role == StageRole::Approve && self.env.config.human_approval.requires(run.domain) {
                match self.await_human_approval(run).await? {
                    Gate::Approved => {}
                    Gate::Rejected(reason) => {
                        return Ok(PipelineOutcome::Rejected {
                            stage: run.stage_id,
                            reason,
                        })
                    }
                    Gate::Cancelled => return Ok(PipelineOutcome::Cancelled),
                }
            }
        }

        let completed = self
            .update_pipeline(Box::new(|p| {
                p.finish(PipelineStatus::Completed, None)?;
                Ok(())
            }))
            .await?;
        if !completed {
            return Ok(PipelineOutcome::Cancelled);
        }

        info!(pipeline_id = %self.pipeline_id, "Pipeline completed");
        self.publish(PipelineEvent::new(self.pipeline_id, EventType::PipelineCompleted))
            .await;
        self.env.notifications.notify(Notification::Completed {
            pipeline_id: self.pipeline_id,
        });
        Ok(PipelineOutcome::Completed)
    }

    async fn reject(&self, stage: StageId, reason: String) -> Result<PipelineOutcome, ForgeflowError> {
        let status_reason = reason.clone();
        let rejected = self
            .update_pipeline(Box::new(move |p| {
                p.finish(PipelineStatus::Rejected, Some(status_reason))?;
                Ok(())
            }))
            .await?;
        if !rejected {
            return Ok(PipelineOutcome::Cancelled);
        }

        warn!(pipeline_id = %self.pipeline_id, stage = %stage, reason = %reason, "Pipeline rejected");
        self.publish(
            PipelineEvent::for_stage(self.pipeline_id, stage, EventType::PipelineRejected)
                .with_data(json!({ "reason": reason })),
        )
        .await;
        Ok(PipelineOutcome::Rejected { stage, reason })
    }

    async fn fail(&self, run: &StageRun, err: ForgeflowError) -> Result<PipelineOutcome, ForgeflowError> {
        let message = err.to_string();
        let stage_error = message.clone();
        self.env
            .store
            .modify_stage_run(
                run.id,
                Box::new(move |r| {
                    r.status = StageRunStatus::Failed;
                    r.completed_at = Some(Utc::now());
                    r.error = Some(stage_error);
                    Ok(())
                }),
            )
            .await?;

        if matches!(err, ForgeflowError::Cancelled(_)) || self.token.is_cancelled() {
            info!(pipeline_id = %self.pipeline_id, stage = %run.stage_id, "Pipeline run cancelled");
            return Ok(PipelineOutcome::Cancelled);
        }

        let reason = message.clone();
        let failed = self
            .update_pipeline(Box::new(move |p| {
                p.finish(PipelineStatus::Failed, Some(reason))?;
                Ok(())
            }))
            .await?;
        if !failed {
            return Ok(PipelineOutcome::Cancelled);
        }

        error!(pipeline_id = %self.pipeline_id, stage = %run.stage_id, error = %err, "Pipeline failed");
        self.env.notifications.notify(Notification::Failed {
            pipeline_id: self.pipeline_id,
            stage: Some(run.stage_id),
            error: message.clone(),
        });
        self.publish(
            PipelineEvent::for_stage(self.pipeline_id, run.stage_id, EventType::PipelineFailed)
                .with_data(json!({ "error": message })),
        )
        .await;
        Ok(PipelineOutcome::Failed {
            stage: run.stage_id,
            error: message,
        })
    }

    async fn await_human_approval(&self, run: &StageRun) -> Result<Gate, ForgeflowError> {
        let approvals = &self.env.approvals;
        let request = ApprovalRequest::pending(self.pipeline_id, run.stage_id);
        let approval_id = request.id;
        let mut rx = approvals.register(approval_id);

        if let Err(e) = self.env.store.insert_approval(request).await {
            approvals.remove(approval_id);
            return Err(e);
        }
        let waiting = self
            .update_pipeline(Box::new(|p| {
                p.transition(PipelineStatus::WaitingApproval)?;
                Ok(())
            }))
            .await;
        if !matches!(waiting, Ok(true)) {
            approvals.remove(approval_id);
            self.expire(approval_id, "pipeline cancelled").await?;
            return waiting.map(|_| Gate::Cancelled);
        }

        info!(
            pipeline_id = %self.pipeline_id,
            stage = %run.stage_id,
            approval_id = %approval_id,
            "Waiting for human approval"
        );
        self.publish(
            PipelineEvent::for_stage(self.pipeline_id, run.stage_id, EventType::ApprovalRequested)
                .with_data(json!({ "approval_id": approval_id, "domain": run.domain })),
        )
        .await;
        self.env.notifications.notify(Notification::ApprovalRequired {
            approval_id,
            pipeline_id: self.pipeline_id,
            stage: run.stage_id,
            domain: run.domain,
        });

        let timeout = self.env.config.human_approval.timeout();
        let mut wake = tokio::select! {
            decision = &mut rx => decision.map_or(Wake::Abandoned, Wake::Decided),
            () = self.token.cancelled() => Wake::Cancelled,
            () = tokio::time::sleep(timeout) => Wake::TimedOut,
        };
        if matches!(wake, Wake::TimedOut) && !approvals.remove(approval_id) {
            // A decision claimed the request just before the deadline.
            wake = rx.await.map_or(Wake::Abandoned, Wake::Decided);
        }

        match wake {
            Wake::Decided(ApprovalDecision::Approve) => {
                let resumed = self
                    .update_pipeline(Box::new(|p| {
                        p.transition(PipelineStatus::Running)?;
                        Ok(())
                    }))
                    .await?;
                if !resumed {
                    return Ok(Gate::Cancelled);
                }
                info!(pipeline_id = %self.pipeline_id, stage = %run.stage_id, "Human approval granted");
                Ok(Gate::Approved)
            }
            Wake::Decided(ApprovalDecision::Reject) => {
                let pipeline = self.env.store.get_pipeline(self.pipeline_id).await?;
                let reason = pipeline
                    .status_reason
                    .unwrap_or_else(|| HUMAN_REJECTION_REASON.to_string());
                self.announce_rejection(run.stage_id, &reason).await;
                Ok(Gate::Rejected(reason))
            }
            Wake::TimedOut => {
                warn!(pipeline_id = %self.pipeline_id, approval_id = %approval_id, "Human approval timed out");
                self.reject_unanswered(run, approval_id, APPROVAL_TIMEOUT_REASON)
                    .await
            }
            Wake::Abandoned => {
                self.reject_unanswered(run, approval_id, ABANDONED_DECISION_REASON)
                    .await
            }
            Wake::Cancelled => {
                approvals.remove(approval_id);
                self.expire(approval_id, "pipeline cancelled").await?;
                Ok(Gate::Cancelled)
            }
        }
    }

    /// Expires a request nobody decided and rejects the pipeline.
    async fn reject_unanswered(
        &self,
        run: &StageRun,
        approval_id: Uuid,
        reason: &'static str,
    ) -> Result<Gate, ForgeflowError> {
        let request = self.expire(approval_id, reason).await?;
        self.publish(
            PipelineEvent::for_stage(self.pipeline_id, run.stage_id, EventType::ApprovalDecided)
                .with_data(json!({
                    "approval_id": approval_id,
                    "status": request.status,
                })),
        )
        .await;

        let pipeline = self.env.store.get_pipeline(self.pipeline_id).await?;
        if pipeline.status != PipelineStatus::Rejected {
            let rejected = self
                .update_pipeline(Box::new(move |p| {
                    p.finish(PipelineStatus::Rejected, Some(reason.to_string()))?;
                    Ok(())
                }))
                .await?;
            if !rejected {
                return Ok(Gate::Cancelled);
            }
        }
        self.announce_rejection(run.stage_id, reason).await;
        Ok(Gate::Rejected(reason.to_string()))
    }

    async fn expire(&self, approval_id: Uuid, notes: &str) -> Result<ApprovalRequest, ForgeflowError> {
        let notes = notes.to_string();
        self.env
            .store
            .modify_approval(
                approval_id,
                Box::new(move |a| {
                    a.decide(ApprovalStatus::Expired, None, Some(notes));
                    Ok(())
                }),
            )
            .await
    }

    async fn announce_rejection(&self, stage: StageId, reason: &str) {
        warn!(pipeline_id = %self.pipeline_id, stage = %stage, reason = %reason, "Pipeline rejected");
        self.env.notifications.notify(Notification::Rejected {
            pipeline_id: self.pipeline_id,
            stage,
            reason: reason.to_string(),
        });
        self.publish(
            PipelineEvent::for_stage(self.pipeline_id, stage, EventType::PipelineRejected)
                .with_data(json!({ "reason": reason })),
        )
        .await;
    }

    /// Applies a pipeline update. Returns false when the update lost a race
    /// with cancellation, which has already moved the pipeline to FAILED.
    async fn update_pipeline(&self, update: PipelineUpdate) -> Result<bool, ForgeflowError> {
        match self.env.store.modify_pipeline(self.pipeline_id, update).await {
            Ok(_) => Ok(true),
            Err(ForgeflowError::InvalidTransition(_)) if self.token.is_cancelled() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, event: PipelineEvent) {
        self.env.publisher.publish(event).await;
    }
}
