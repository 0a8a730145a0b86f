//! Core domain types: stage identity, statuses, events, artifacts and persisted rows.

mod artifact;
mod event;
mod records;
mod stage;
mod status;

pub use artifact::{checksum, Artifact, ArtifactKind};
pub use event::{EventType, PipelineEvent};
pub use records::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, PipelineInstance, Project, StageRun,
};
pub use stage::{Domain, StageId, StageRole};
pub use status::{PipelineStatus, StageRunStatus};

/// UTC timestamp used on every persisted row and event.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
