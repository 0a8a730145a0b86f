//! Pipeline lifecycle events.

use super::{StageId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of lifecycle transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A runner began executing the pipeline.
    PipelineStarted,
    /// A stage began its first attempt.
    StageStarted,
    /// A stage attempt failed and will be retried.
    StageRetrying,
    /// A stage finished and the pipeline may continue.
    StageCompleted,
    /// A stage was rejected or exhausted its attempts.
    StageFailed,
    /// The pipeline is waiting for a human decision.
    ApprovalRequested,
    /// A human decision arrived.
    ApprovalDecided,
    /// Every enabled stage finished.
    PipelineCompleted,
    /// The pipeline stopped on an error.
    PipelineFailed,
    /// An approval gate stopped the pipeline.
    PipelineRejected,
    /// The pipeline was cancelled.
    PipelineCancelled,
}

impl EventType {
    /// Returns the snake_case name of the event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline_started",
            Self::StageStarted => "stage_started",
            Self::StageRetrying => "stage_retrying",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalDecided => "approval_decided",
            Self::PipelineCompleted => "pipeline_completed",
            Self::PipelineFailed => "pipeline_failed",
            Self::PipelineRejected => "pipeline_rejected",
            Self::PipelineCancelled => "pipeline_cancelled",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published while a pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// The pipeline the event belongs to.
    pub pipeline_id: Uuid,
    /// The stage the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<StageId>,
    /// What happened.
    pub event_type: EventType,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// When the event was created.
    pub timestamp: Timestamp,
}

impl PipelineEvent {
    /// Creates a pipeline-level event with an empty payload.
    #[must_use]
    pub fn new(pipeline_id: Uuid, event_type: EventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            pipeline_id,
            stage_id: None,
            event_type,
            data: serde_json::json!({}),
            timestamp: Utc::now(),
        }
    }

    /// Creates a stage-level event.
    #[must_use]
    pub fn for_stage(pipeline_id: Uuid, stage_id: StageId, event_type: EventType) -> Self {
        Self {
            stage_id: Some(stage_id),
            ..Self::new(pipeline_id, event_type)
        }
    }

    /// Replaces the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Returns true if this event concerns the given pipeline.
    #[must_use]
    pub fn is_for(&self, pipeline_id: Uuid) -> bool {
        self.pipeline_id == pipeline_id
    }
}
