//! Best-effort fan-out of pipeline events.

use super::forwarder::{ForwardingMetrics, ForwardingQueue};
use super::subscriber::EventSubscriber;
use crate::core::PipelineEvent;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};
use uuid::Uuid;

/// Handle returned by [`EventPublisher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(Uuid);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Upper bound on a single subscriber delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes events to in-process subscribers and, optionally, to a forwarding queue.
///
/// Every subscriber is invoked concurrently on the publishing task. Errors,
/// panics and deliveries that outlive the delivery timeout are logged and
/// never reach the publisher or the other subscribers.
pub struct EventPublisher {
    subscribers: DashMap<SubscriberId, Arc<dyn EventSubscriber>>,
    forwarding: Option<ForwardingQueue>,
    delivery_timeout: Duration,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self {
            subscribers: DashMap::new(),
            forwarding: None,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

impl EventPublisher {
    /// Creates a publisher with no subscribers and no forwarding path.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides how long a single subscriber may take to handle an event.
    #[must_use]
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Adds a forwarding path.
    #[must_use]
    pub fn with_forwarding(mut self, queue: ForwardingQueue) -> Self {
        self.forwarding = Some(queue);
        self
    }

    /// Registers a subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        let id = SubscriberId(Uuid::new_v4());
        self.subscribers.insert(id, subscriber);
        id
    }

    /// Removes a subscriber. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Returns the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publishes an event.
    pub async fn publish(&self, event: PipelineEvent) {
        trace!(
            pipeline_id = %event.pipeline_id,
            event_type = %event.event_type,
            "Publishing event"
        );

        if let Some(queue) = &self.forwarding {
            queue.enqueue(&event);
        }

        // Snapshot so subscribe/unsubscribe never wait on a slow subscriber.
        let targets: Vec<(SubscriberId, Arc<dyn EventSubscriber>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let event = &event;
        let limit = self.delivery_timeout;
        let deliveries = targets.into_iter().map(|(id, subscriber)| async move {
            let delivery = AssertUnwindSafe(subscriber.on_event(event)).catch_unwind();
            let Ok(outcome) = tokio::time::timeout(limit, delivery).await else {
                warn!(
                    subscriber = subscriber.name(),
                    subscriber_id = %id,
                    event_type = %event.event_type,
                    timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "Event subscriber timed out"
                );
                return;
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(
                    subscriber = subscriber.name(),
                    subscriber_id = %id,
                    event_type = %event.event_type,
                    error = %error,
                    "Event subscriber failed"
                ),
                Err(_) => warn!(
                    subscriber = subscriber.name(),
                    subscriber_id = %id,
                    event_type = %event.event_type,
                    "Event subscriber panicked"
                ),
            }
        });
        join_all(deliveries).await;
    }

    /// Returns forwarding metrics, if a forwarding path is configured.
    #[must_use]
    pub fn forwarding_metrics(&self) -> Option<&ForwardingMetrics> {
        self.forwarding.as_ref().map(ForwardingQueue::metrics)
    }

    /// Drains and closes the forwarding path.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.forwarding {
            queue.shutdown().await;
        }
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscribers", &self.subscribers.len())
            .field("forwarding", &self.forwarding)
            .finish()
    }
}
