//! Fire-and-forget alerts about pipeline outcomes.
//!
//! Delivery runs on a bounded pool of background tasks. A failed delivery
//! is logged and never changes a pipeline's outcome.

use crate::core::{Domain, StageId};
use crate::errors::NotificationError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An alert for humans watching the pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// An approval gate rejected the pipeline.
    Rejected {
        /// The pipeline.
        pipeline_id: Uuid,
        /// The rejecting stage.
        stage: StageId,
        /// Rejection reason.
        reason: String,
    },
    /// The pipeline failed.
    Failed {
        /// The pipeline.
        pipeline_id: Uuid,
        /// The failing stage, if one was running.
        stage: Option<StageId>,
        /// Failure description.
        error: String,
    },
    /// The pipeline completed.
    Completed {
        /// The pipeline.
        pipeline_id: Uuid,
    },
    /// A human approval is needed.
    ApprovalRequired {
        /// The approval request.
        approval_id: Uuid,
        /// The pipeline.
        pipeline_id: Uuid,
        /// The stage awaiting sign-off.
        stage: StageId,
        /// Domain awaiting sign-off.
        domain: Domain,
    },
}

impl Notification {
    /// Returns the pipeline the notification concerns.
    #[must_use]
    pub fn pipeline_id(&self) -> Uuid {
        match self {
            Self::Rejected { pipeline_id, .. }
            | Self::Failed { pipeline_id, .. }
            | Self::Completed { pipeline_id }
            | Self::ApprovalRequired { pipeline_id, .. } => *pipeline_id,
        }
    }

    /// Returns a one-line human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Rejected { stage, reason, .. } => {
                format!("Pipeline rejected at {stage}: {reason}")
            }
            Self::Failed {
                stage: Some(stage),
                error,
                ..
            } => format!("Pipeline failed at {stage}: {error}"),
            Self::Failed { error, .. } => format!("Pipeline failed: {error}"),
            Self::Completed { .. } => "Pipeline completed".to_string(),
            Self::ApprovalRequired { stage, domain, .. } => {
                format!("Human approval required for {domain} ({stage})")
            }
        }
    }
}

/// Delivers notifications to a channel such as Slack or email.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification.
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// A notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            pipeline_id = %notification.pipeline_id(),
            "Notification: {}",
            notification.summary()
        );
        Ok(())
    }
}

/// A notifier that records notifications for tests.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    delivered: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    /// Creates a new collecting notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the notifications delivered so far.
    #[must_use]
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.delivered.lock().push(notification.clone());
        Ok(())
    }
}

/// Runs notification deliveries on a bounded pool of background tasks.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl NotificationDispatcher {
    /// Creates a dispatcher allowing `concurrency` deliveries in flight.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, concurrency: usize) -> Self {
        Self {
            notifier,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Schedules a delivery and returns immediately.
    pub fn notify(&self, notification: Notification) {
        let notifier = self.notifier.clone();
        let permits = self.permits.clone();
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match notifier.deliver(&notification).await {
                Ok(()) => debug!(pipeline_id = %notification.pipeline_id(), "Notification delivered"),
                Err(e) => warn!(
                    pipeline_id = %notification.pipeline_id(),
                    error = %e,
                    "Notification delivery failed"
                ),
            }
        });
    }

    /// Returns the number of deliveries not yet reaped.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Waits for every scheduled delivery to finish.
    pub async fn flush(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Notification task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("available_permits", &self.permits.available_permits())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn deliver(&self, _n: &Notification) -> Result<(), NotificationError> {
            Err(NotificationError::new("slack", "invalid webhook"))
        }
    }

    #[tokio::test]
    async fn test_flush_waits_for_deliveries() {
        let notifier = Arc::new(CollectingNotifier::new());
        let dispatcher = NotificationDispatcher::new(notifier.clone(), 2);
        let id = Uuid::new_v4();

        dispatcher.notify(Notification::Completed { pipeline_id: id });
        dispatcher.notify(Notification::Failed {
            pipeline_id: id,
            stage: None,
            error: "boom".into(),
        });
        dispatcher.flush().await;

        assert_eq!(notifier.delivered().len(), 2);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let dispatcher = NotificationDispatcher::new(Arc::new(BrokenNotifier), 1);
        dispatcher.notify(Notification::Completed {
            pipeline_id: Uuid::new_v4(),
        });
        dispatcher.flush().await;
    }

    #[test]
    fn test_summary() {
        let n = Notification::Rejected {
            pipeline_id: Uuid::nil(),
            stage: StageId::DevelopmentApproval,
            reason: "missing tests".into(),
        };
        assert_eq!(
            n.summary(),
            "Pipeline rejected at development_approval: missing tests"
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "rejected");
    }
}
