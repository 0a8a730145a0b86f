//! Event subscriber trait and implementations.

use crate::core::PipelineEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};

/// Receives pipeline events published in-process.
///
/// A failing or panicking subscriber never affects the publisher or the
/// other subscribers.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in logs when the subscriber fails.
    fn name(&self) -> &str {
        "subscriber"
    }

    /// Handles one event.
    async fn on_event(&self, event: &PipelineEvent) -> Result<(), String>;
}

/// A subscriber that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingSubscriber {
    level: Level,
}

impl Default for LoggingSubscriber {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingSubscriber {
    /// Creates a new logging subscriber with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging subscriber.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl EventSubscriber for LoggingSubscriber {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_event(&self, event: &PipelineEvent) -> Result<(), String> {
        let stage = event.stage_id.map(|s| s.as_str()).unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(
                pipeline_id = %event.pipeline_id,
                stage,
                event_type = %event.event_type,
                data = %event.data,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                pipeline_id = %event.pipeline_id,
                stage,
                event_type = %event.event_type,
                data = %event.data,
                "Event: {}", event.event_type
            );
        }
        Ok(())
    }
}

/// A collecting subscriber for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingSubscriber {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingSubscriber {
    /// Creates a new collecting subscriber.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event type names in arrival order.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .read()
            .iter()
            .map(|e| e.event_type.as_str())
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSubscriber for CollectingSubscriber {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn on_event(&self, event: &PipelineEvent) -> Result<(), String> {
        self.events.write().push(event.clone());
        Ok(())
    }
}

/// A subscriber that forwards events into an unbounded channel.
///
/// Useful for transports that push events to clients, such as a WebSocket
/// session per connected user.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSubscriber {
    /// Creates a subscriber and the receiving end of its channel.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSubscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        "channel"
    }

    async fn on_event(&self, event: &PipelineEvent) -> Result<(), String> {
        self.tx
            .send(event.clone())
            .map_err(|_| "receiver dropped".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventType, StageId};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_collecting_subscriber() {
        let sub = CollectingSubscriber::new();
        let id = Uuid::new_v4();
        sub.on_event(&PipelineEvent::new(id, EventType::PipelineStarted))
            .await
            .unwrap();
        sub.on_event(&PipelineEvent::for_stage(
            id,
            StageId::Architecture,
            EventType::StageStarted,
        ))
        .await
        .unwrap();

        assert_eq!(sub.event_types(), vec!["pipeline_started", "stage_started"]);
        sub.clear();
        assert!(sub.is_empty());
    }

    #[tokio::test]
    async fn test_channel_subscriber_reports_closed_receiver() {
        let (sub, mut rx) = ChannelSubscriber::channel();
        let event = PipelineEvent::new(Uuid::new_v4(), EventType::PipelineCompleted);

        sub.on_event(&event).await.unwrap();
        assert_eq!(rx.recv().await.map(|e| e.event_id), Some(event.event_id));

        drop(rx);
        assert!(sub.on_event(&event).await.is_err());
    }

    #[tokio::test]
    async fn test_logging_subscriber_never_fails() {
        let sub = LoggingSubscriber::debug();
        let event = PipelineEvent::new(Uuid::new_v4(), EventType::PipelineFailed);
        assert!(sub.on_event(&event).await.is_ok());
    }
}
