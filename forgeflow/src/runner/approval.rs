//! Rendezvous between runners suspended on a human approval and the decision API.

use crate::core::ApprovalDecision;
use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Registry of runners waiting on approval decisions, keyed by approval id.
#[derive(Debug, Default)]
pub struct ApprovalWaiters {
    waiters: DashMap<Uuid, oneshot::Sender<ApprovalDecision>>,
}

impl ApprovalWaiters {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter and returns the receiving end.
    ///
    /// Register before the request becomes visible so a fast decision is not lost.
    pub fn register(&self, approval_id: Uuid) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(approval_id, tx);
        rx
    }

    /// Takes ownership of a waiter so that a decision can be delivered later.
    ///
    /// Whoever claims or removes the waiter first owns the request's outcome.
    pub fn claim(&self, approval_id: Uuid) -> Option<oneshot::Sender<ApprovalDecision>> {
        self.waiters.remove(&approval_id).map(|(_, tx)| tx)
    }

    /// Wakes the runner waiting on an approval. Returns false if none was waiting.
    pub fn resolve(&self, approval_id: Uuid, decision: ApprovalDecision) -> bool {
        self.claim(approval_id)
            .is_some_and(|tx| tx.send(decision).is_ok())
    }

    /// Drops a waiter without a decision.
    pub fn remove(&self, approval_id: Uuid) -> bool {
        self.waiters.remove(&approval_id).is_some()
    }

    /// Returns the number of waiting runners.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.waiters.len()
    }
}
