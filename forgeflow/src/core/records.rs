//! Persisted rows: projects, pipeline instances, stage runs and approval requests.

use super::{Domain, PipelineStatus, StageId, StageRole, StageRunStatus, Timestamp};
use crate::catalog::StageDefinition;
use crate::errors::InvalidTransitionError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The project a pipeline builds. Owned by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier.
    pub id: Uuid,
    /// Project name.
    pub name: String,
    /// Free-form requirements text.
    pub requirements: String,
    /// Domains whose stages run.
    pub enabled_domains: Vec<Domain>,
    /// Whether the devops stages run.
    pub deployment_enabled: bool,
    /// Target deployment environment, e.g. "aws".
    pub target_cloud: String,
}

impl Project {
    /// Creates a project with every domain enabled and deployment disabled.
    #[must_use]
    pub fn new(name: impl Into<String>, requirements: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            requirements: requirements.into(),
            enabled_domains: Domain::ALL.to_vec(),
            deployment_enabled: false,
            target_cloud: "aws".to_string(),
        }
    }

    /// Restricts the enabled domains.
    #[must_use]
    pub fn with_domains(mut self, domains: impl IntoIterator<Item = Domain>) -> Self {
        self.enabled_domains = domains.into_iter().collect();
        self
    }

    /// Sets the deployment flag.
    #[must_use]
    pub fn with_deployment(mut self, enabled: bool) -> Self {
        self.deployment_enabled = enabled;
        self
    }

    /// Sets the target cloud.
    #[must_use]
    pub fn with_target_cloud(mut self, cloud: impl Into<String>) -> Self {
        self.target_cloud = cloud.into();
        self
    }
}

/// One execution of the stage sequence for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInstance {
    /// Unique identifier.
    pub id: Uuid,
    /// The project being built.
    pub project_id: Uuid,
    /// Who started it.
    pub triggered_by: String,
    /// Lifecycle status.
    pub status: PipelineStatus,
    /// The stage most recently started.
    pub current_stage: Option<StageId>,
    /// When the runner first moved it to RUNNING.
    pub started_at: Option<Timestamp>,
    /// When it reached a terminal status.
    pub completed_at: Option<Timestamp>,
    /// Domains whose stages run, copied from the project at creation.
    pub enabled_domains: Vec<Domain>,
    /// Whether devops stages run, copied from the project at creation.
    pub deployment_enabled: bool,
    /// Bumped on every retry.
    pub version: u32,
    /// Rejection reason or failure description.
    pub status_reason: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
}

impl PipelineInstance {
    /// Creates a PENDING pipeline for a project.
    #[must_use]
    pub fn new(project: &Project, triggered_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project.id,
            triggered_by: triggered_by.into(),
            status: PipelineStatus::Pending,
            current_stage: None,
            started_at: None,
            completed_at: None,
            enabled_domains: project.enabled_domains.clone(),
            deployment_enabled: project.deployment_enabled,
            version: 1,
            status_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Moves the pipeline to `next` if the transition table allows it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransitionError` and leaves the row untouched otherwise.
    pub fn transition(&mut self, next: PipelineStatus) -> Result<(), InvalidTransitionError> {
        self.status = self.status.transition_to(next)?;
        Ok(())
    }

    /// Moves the pipeline to a terminal status, stamping completion time and reason.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransitionError` when the edge is not in the table.
    pub fn finish(
        &mut self,
        next: PipelineStatus,
        reason: Option<String>,
    ) -> Result<(), InvalidTransitionError> {
        self.transition(next)?;
        self.completed_at = Some(Utc::now());
        self.status_reason = reason;
        Ok(())
    }

    /// Returns true if the domain's stages should run.
    #[must_use]
    pub fn runs_domain(&self, domain: Domain) -> bool {
        self.enabled_domains.contains(&domain)
            && (domain != Domain::Devops || self.deployment_enabled)
    }
}

/// The execution record of one stage within one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning pipeline.
    pub pipeline_id: Uuid,
    /// The stage.
    pub stage_id: StageId,
    /// Domain of the stage.
    pub domain: Domain,
    /// Role of the stage.
    pub role: StageRole,
    /// Run status.
    pub status: StageRunStatus,
    /// Position in the catalog (1..=15).
    pub order: u8,
    /// Start of the current run.
    pub started_at: Option<Timestamp>,
    /// End of the current run.
    pub completed_at: Option<Timestamp>,
    /// Output of the last worker call.
    pub agent_output: Option<serde_json::Value>,
    /// Worker that approved, for approve-role stages.
    pub approved_by: Option<String>,
    /// Why the gate rejected.
    pub rejection_reason: Option<String>,
    /// Failed attempts across the pipeline's lifetime.
    pub retry_count: u32,
    /// Last error seen.
    pub error: Option<String>,
}

impl StageRun {
    /// Creates a PENDING stage run for a catalog entry.
    #[must_use]
    pub fn new(pipeline_id: Uuid, definition: &StageDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            stage_id: definition.stage_id,
            domain: definition.domain,
            role: definition.role,
            status: StageRunStatus::Pending,
            order: definition.order,
            started_at: None,
            completed_at: None,
            agent_output: None,
            approved_by: None,
            rejection_reason: None,
            retry_count: 0,
            error: None,
        }
    }

    /// Clears the run for a pipeline retry. `retry_count` survives.
    pub fn reset(&mut self) {
        self.status = StageRunStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.agent_output = None;
        self.approved_by = None;
        self.rejection_reason = None;
        self.error = None;
    }
}

/// Status of a human approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a decision.
    #[default]
    Pending,
    /// A human approved.
    Approved,
    /// A human rejected.
    Rejected,
    /// No decision before the timeout, or the pipeline was cancelled.
    Expired,
}

impl ApprovalStatus {
    /// Returns the snake_case name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human decision on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Let the pipeline continue.
    Approve,
    /// Stop the pipeline.
    Reject,
}

impl ApprovalDecision {
    /// The request status this decision records.
    #[must_use]
    pub const fn status(&self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Reject => ApprovalStatus::Rejected,
        }
    }
}

/// A human approval gate raised after an approve-role stage passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning pipeline.
    pub pipeline_id: Uuid,
    /// The approve-role stage that raised it.
    pub stage_id: StageId,
    /// Domain being signed off.
    pub domain: Domain,
    /// Decision status.
    pub status: ApprovalStatus,
    /// Who decided.
    pub decided_by: Option<String>,
    /// When it was decided.
    pub decided_at: Option<Timestamp>,
    /// Decision comment.
    pub notes: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
}

impl ApprovalRequest {
    /// Creates a pending request for a stage.
    #[must_use]
    pub fn pending(pipeline_id: Uuid, stage_id: StageId) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            stage_id,
            domain: stage_id.domain(),
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    /// Records a final status. Only pending requests can be decided.
    ///
    /// Returns false and leaves the request untouched if it was already decided.
    pub fn decide(
        &mut self,
        status: ApprovalStatus,
        decided_by: Option<String>,
        notes: Option<String>,
    ) -> bool {
        if self.status != ApprovalStatus::Pending || status == ApprovalStatus::Pending {
            return false;
        }
        self.status = status;
        self.decided_by = decided_by;
        self.decided_at = Some(Utc::now());
        self.notes = notes;
        true
    }
}
