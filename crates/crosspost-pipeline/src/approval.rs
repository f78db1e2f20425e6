//! Manual approval gate between captioning and publishing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crosspost_analytics::ContentId;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

/// A run waiting on an operator decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub content_id: ContentId,
    pub run_id: Uuid,
    pub title: String,
    pub caption: String,
    pub requested_at: DateTime<Utc>,
}

struct Waiter {
    request: ApprovalRequest,
    decision: oneshot::Sender<Decision>,
}

/// Routes operator decisions to waiting runs.
///
/// Cloning shares the pending set.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    waiting: Arc<DashMap<ContentId, Waiter>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a run until someone decides. The returned ticket withdraws the
    /// request when dropped, so abandoned waits never linger.
    pub(crate) fn request(&self, request: ApprovalRequest) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let content_id = request.content_id.clone();
        let run_id = request.run_id;

        info!(content_id = %content_id, run_id = %run_id, "awaiting approval");
        self.waiting.insert(
            content_id.clone(),
            Waiter {
                request,
                decision: tx,
            },
        );

        Ticket {
            waiting: Arc::clone(&self.waiting),
            content_id,
            run_id,
            decision: rx,
        }
    }

    /// Deliver a decision. Returns false when nothing is waiting on `content_id`.
    pub fn decide(&self, content_id: &ContentId, decision: Decision) -> bool {
        let Some((_, waiter)) = self.waiting.remove(content_id) else {
            debug!(content_id = %content_id, "no pending approval");
            return false;
        };

        info!(content_id = %content_id, ?decision, "approval decision received");
        waiter.decision.send(decision).is_ok()
    }

    pub fn approve(&self, content_id: &ContentId) -> bool {
        self.decide(content_id, Decision::Approve)
    }

    pub fn reject(&self, content_id: &ContentId) -> bool {
        self.decide(content_id, Decision::Reject)
    }

    /// Requests still waiting, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self.waiting.iter().map(|w| w.request.clone()).collect();
        pending.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        pending
    }
}

/// A run's handle on its pending approval.
pub(crate) struct Ticket {
    waiting: Arc<DashMap<ContentId, Waiter>>,
    content_id: ContentId,
    run_id: Uuid,
    decision: oneshot::Receiver<Decision>,
}

impl Ticket {
    /// Wait for a decision. `None` if the request was dropped without one.
    pub(crate) async fn decision(&mut self) -> Option<Decision> {
        (&mut self.decision).await.ok()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let run_id = self.run_id;
        self.waiting
            .remove_if(&self.content_id, |_, w| w.request.run_id == run_id);
    }
}
