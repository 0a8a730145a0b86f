//! Pipeline and stage-run status enums, and the legal transition table.

use crate::errors::InvalidTransitionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, no runner has picked it up yet.
    #[default]
    Pending,
    /// A runner is advancing it.
    Running,
    /// Suspended on a human approval decision.
    WaitingApproval,
    /// A human approved the gate; about to resume.
    Approved,
    /// An approval gate rejected it.
    Rejected,
    /// Every enabled stage finished.
    Completed,
    /// An unrecoverable error or a cancellation stopped it.
    Failed,
}

impl PipelineStatus {
    /// Returns the statuses reachable from `self`.
    #[must_use]
    pub const fn valid_next(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed],
            Self::Running => &[
                Self::WaitingApproval,
                Self::Completed,
                Self::Failed,
                Self::Rejected,
            ],
            Self::WaitingApproval => &[Self::Approved, Self::Rejected, Self::Failed],
            Self::Approved => &[Self::Running, Self::Completed],
            Self::Rejected | Self::Failed => &[Self::Running],
            Self::Completed => &[],
        }
    }

    /// Returns true if `self -> next` is in the transition table.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_next().contains(&next)
    }

    /// Validates `self -> next` against the transition table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransitionError` when the edge is not in the table.
    pub fn transition_to(&self, next: Self) -> Result<Self, InvalidTransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransitionError::new(*self, next))
        }
    }

    /// Statuses a pipeline may be cancelled from.
    #[must_use]
    pub const fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::WaitingApproval)
    }

    /// Statuses a pipeline may be retried from.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Rejected)
    }

    /// Returns true once no runner will move the pipeline without an external action.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Returns the snake_case name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    /// Not started.
    #[default]
    Pending,
    /// Worker attempts in progress.
    Running,
    /// Execute or review stage finished.
    Completed,
    /// Approve-role stage passed its gate.
    Approved,
    /// Approve-role stage rejected.
    Rejected,
    /// Retries exhausted or run cancelled mid-stage.
    Failed,
}

impl StageRunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Approved | Self::Rejected | Self::Failed
        )
    }

    /// Returns true if the stage let the pipeline continue.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Approved)
    }

    /// Returns the snake_case name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StageRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PipelineStatus; 7] = [
        PipelineStatus::Pending,
        PipelineStatus::Running,
        PipelineStatus::WaitingApproval,
        PipelineStatus::Approved,
        PipelineStatus::Rejected,
        PipelineStatus::Completed,
        PipelineStatus::Failed,
    ];

    #[test]
    fn test_valid_transitions() {
        assert!(PipelineStatus::Pending.can_transition_to(PipelineStatus::Running));
        assert!(PipelineStatus::Running.can_transition_to(PipelineStatus::Completed));
        assert!(PipelineStatus::Running.can_transition_to(PipelineStatus::Rejected));
        assert!(PipelineStatus::WaitingApproval.can_transition_to(PipelineStatus::Approved));
        assert!(PipelineStatus::Approved.can_transition_to(PipelineStatus::Running));
        assert!(PipelineStatus::Failed.can_transition_to(PipelineStatus::Running));
        assert!(PipelineStatus::Rejected.can_transition_to(PipelineStatus::Running));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!PipelineStatus::Pending.can_transition_to(PipelineStatus::Completed));
        assert!(!PipelineStatus::Completed.can_transition_to(PipelineStatus::Running));
        assert!(!PipelineStatus::Failed.can_transition_to(PipelineStatus::Completed));
        assert!(!PipelineStatus::Rejected.can_transition_to(PipelineStatus::Pending));

        let err = PipelineStatus::Completed
            .transition_to(PipelineStatus::Failed)
            .unwrap_err();
        assert_eq!(err.from, PipelineStatus::Completed);
        assert_eq!(err.to, PipelineStatus::Failed);
    }

    #[test]
    fn test_completed_is_a_sink() {
        for to in ALL {
            assert!(!PipelineStatus::Completed.can_transition_to(to));
        }
    }

    #[test]
    fn test_cancel_and_retry_sets() {
        let cancellable: Vec<_> = ALL.into_iter().filter(PipelineStatus::is_cancellable).collect();
        assert_eq!(
            cancellable,
            vec![
                PipelineStatus::Pending,
                PipelineStatus::Running,
                PipelineStatus::WaitingApproval
            ]
        );
        // every cancellable status must be able to reach FAILED
        for status in cancellable {
            assert!(status.can_transition_to(PipelineStatus::Failed));
        }
        for status in ALL.into_iter().filter(PipelineStatus::is_retryable) {
            assert!(status.can_transition_to(PipelineStatus::Running));
        }
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&PipelineStatus::WaitingApproval).unwrap();
        assert_eq!(json, r#""waiting_approval""#);
        assert_eq!(StageRunStatus::Approved.to_string(), "approved");
    }

    #[test]
    fn test_stage_run_status_terminal() {
        assert!(StageRunStatus::Rejected.is_terminal());
        assert!(!StageRunStatus::Rejected.is_success());
        assert!(StageRunStatus::Approved.is_success());
        assert!(!StageRunStatus::Running.is_terminal());
    }
}
