//! Registry of in-flight runs, keyed by content id.

use std::sync::Arc;

use crosspost_analytics::ContentId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

/// Guarantees at most one active run per content id.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ActiveRunRegistry {
    active: Arc<DashMap<ContentId, Uuid>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `content_id`, or `None` if another run holds it.
    pub fn try_acquire(&self, content_id: &ContentId, run_id: Uuid) -> Option<RunSlot> {
        match self.active.entry(content_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(run_id);
                Some(RunSlot {
                    active: Arc::clone(&self.active),
                    content_id: content_id.clone(),
                    run_id,
                })
            }
        }
    }

    pub fn is_active(&self, content_id: &ContentId) -> bool {
        self.active.contains_key(content_id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Snapshot of active runs.
    pub fn active(&self) -> Vec<(ContentId, Uuid)> {
        let mut runs: Vec<_> = self
            .active
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        runs.sort();
        runs
    }
}

/// Held by a run for its whole lifetime. Dropping it releases the content id,
/// including when the run task unwinds or is aborted.
#[derive(Debug)]
pub struct RunSlot {
    active: Arc<DashMap<ContentId, Uuid>>,
    content_id: ContentId,
    run_id: Uuid,
}

impl RunSlot {
    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        let run_id = self.run_id;
        self.active.remove_if(&self.content_id, |_, owner| *owner == run_id);
    }
}
