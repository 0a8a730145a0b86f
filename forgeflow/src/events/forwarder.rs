//! Bounded forwarding of events to an external durable log.

use crate::core::PipelineEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writes events to an external durable log, e.g. a Kafka topic.
#[async_trait]
pub trait EventForwarder: Send + Sync {
    /// Forwards one event.
    async fn forward(&self, event: &PipelineEvent) -> Result<(), String>;
}

/// Counters for the forwarding path.
#[derive(Debug, Default)]
pub struct ForwardingMetrics {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl ForwardingMetrics {
    /// Number of events accepted onto the queue.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Number of events dropped because the queue was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of events the forwarder accepted.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Number of events the forwarder rejected.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Returns the drop rate as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn drop_rate(&self) -> f64 {
        let enqueued = self.enqueued();
        let dropped = self.dropped();
        let total = enqueued + dropped;
        if total == 0 {
            0.0
        } else {
            (dropped as f64 / total as f64) * 100.0
        }
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "enqueued": self.enqueued(),
            "dropped": self.dropped(),
            "forwarded": self.forwarded(),
            "failed": self.failed(),
            "drop_rate_percent": (self.drop_rate() * 100.0).round() / 100.0
        })
    }
}

/// A bounded queue drained by a background task into an [`EventForwarder`].
///
/// Enqueueing never blocks: when the queue is full the event is dropped and
/// counted. Forward failures are logged and swallowed.
pub struct ForwardingQueue {
    tx: Mutex<Option<mpsc::Sender<PipelineEvent>>>,
    capacity: usize,
    metrics: Arc<ForwardingMetrics>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardingQueue {
    /// Creates the queue and spawns its drain task on the current runtime.
    #[must_use]
    pub fn spawn(forwarder: Arc<dyn EventForwarder>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<PipelineEvent>(capacity);
        let metrics = Arc::new(ForwardingMetrics::default());
        let worker_metrics = metrics.clone();

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match forwarder.forward(&event).await {
                    Ok(()) => {
                        worker_metrics.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(error) => {
                        worker_metrics.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            event_id = %event.event_id,
                            event_type = %event.event_type,
                            error = %error,
                            "Failed to forward event"
                        );
                    }
                }
            }
            debug!("Forwarding queue drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            capacity,
            metrics,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues an event without waiting. Returns false if it was dropped.
    pub fn enqueue(&self, event: &PipelineEvent) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match tx.try_send(event.clone()) {
            Ok(()) => {
                self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %event.event_type,
                    queue_size = self.capacity - tx.capacity(),
                    dropped_total = self.metrics.dropped(),
                    "Event dropped due to backpressure"
                );
                false
            }
        }
    }

    /// Returns the number of events waiting to be forwarded.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| self.capacity - tx.capacity())
    }

    /// Returns the metrics.
    #[must_use]
    pub fn metrics(&self) -> &ForwardingMetrics {
        &self.metrics
    }

    /// Closes the queue and waits until every accepted event was handed to the forwarder.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Forwarding task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for ForwardingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingQueue")
            .field("capacity", &self.capacity)
            .field("queue_size", &self.queue_size())
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventType;
    use tokio::sync::Notify;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingForwarder {
        seen: parking_lot::Mutex<Vec<Uuid>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl EventForwarder for RecordingForwarder {
        async fn forward(&self, event: &PipelineEvent) -> Result<(), String> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.seen.lock().push(event.event_id);
            if self.fail {
                Err("broker unavailable".into())
            } else {
                Ok(())
            }
        }
    }

    fn event() -> PipelineEvent {
        PipelineEvent::new(Uuid::new_v4(), EventType::StageStarted)
    }

    #[test]
    fn test_metrics_default() {
        let metrics = ForwardingMetrics::default();
        assert_eq!(metrics.enqueued(), 0);
        assert_eq!(metrics.drop_rate(), 0.0);
        assert_eq!(metrics.to_dict()["dropped"], 0);
    }

    #[tokio::test]
    async fn test_forwards_in_order_and_drains_on_shutdown() {
        let forwarder = Arc::new(RecordingForwarder::default());
        let queue = ForwardingQueue::spawn(forwarder.clone(), 16);
        let events: Vec<_> = (0..5).map(|_| event()).collect();

        for e in &events {
            assert!(queue.enqueue(e));
        }
        queue.shutdown().await;

        let ids: Vec<_> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(*forwarder.seen.lock(), ids);
        assert_eq!(queue.metrics().forwarded(), 5);
        assert!(!queue.enqueue(&event()));
    }

    #[tokio::test]
    async fn test_drops_when_full() {
        let gate = Arc::new(Notify::new());
        let forwarder = Arc::new(RecordingForwarder {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = ForwardingQueue::spawn(forwarder, 2);

        // The drain task may hold one event while blocked on the gate.
        let accepted = (0..10).filter(|_| queue.enqueue(&event())).count();

        assert!(accepted <= 3);
        assert_eq!(queue.metrics().dropped(), (10 - accepted) as u64);
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn test_forward_failures_are_counted() {
        let forwarder = Arc::new(RecordingForwarder {
            fail: true,
            ..Default::default()
        });
        let queue = ForwardingQueue::spawn(forwarder, 4);

        queue.enqueue(&event());
        queue.enqueue(&event());
        queue.shutdown().await;

        assert_eq!(queue.metrics().failed(), 2);
        assert_eq!(queue.metrics().forwarded(), 0);
    }
}
