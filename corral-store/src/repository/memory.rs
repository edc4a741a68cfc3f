//! In-memory repository
//!
//! Every operation takes one mutex, so compare-and-set and priority
//! recomputation are trivially atomic.

use async_trait::async_trait;
use chrono::Utc;
use corral_core::domain::{Event, Request, WorkItem, WorkItemState};
use corral_core::priority::derived_priority;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{PriorityChange, RepoError, Repository, Result, Transition, reuse_rank};

#[derive(Default)]
struct State {
    requests: HashMap<Uuid, Request>,
    work_items: HashMap<Uuid, WorkItem>,
    events: Vec<Event>,
}

impl State {
    fn committed_for(&self, work_item_id: Uuid) -> impl Iterator<Item = &Request> {
        self.requests
            .values()
            .filter(move |r| r.is_committed() && r.work_item_id == Some(work_item_id))
    }
}

/// Repository backed by process memory
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| RepoError::Poisoned)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_request(&self, request: &Request) -> Result<()> {
        self.lock()?.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn update_request(&self, request: &Request) -> Result<()> {
        let mut state = self.lock()?;
        let mut updated = request.clone();
        updated.modified_at = Utc::now();
        state.requests.insert(request.id, updated);
        Ok(())
    }

    async fn find_request(&self, id: Uuid) -> Result<Option<Request>> {
        Ok(self.lock()?.requests.get(&id).cloned())
    }

    async fn find_committed_requests_for(&self, work_item_id: Uuid) -> Result<Vec<Request>> {
        Ok(self.lock()?.committed_for(work_item_id).cloned().collect())
    }

    async fn find_committed_children_of(&self, work_item_id: Uuid) -> Result<Vec<Request>> {
        Ok(self
            .lock()?
            .requests
            .values()
            .filter(|r| r.is_committed() && r.requesting_work_item_id == Some(work_item_id))
            .cloned()
            .collect())
    }

    async fn attach_request(&self, request: &Request, new_item: Option<&WorkItem>) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(item) = new_item {
            state.work_items.insert(item.id, item.clone());
        }
        let mut updated = request.clone();
        updated.modified_at = Utc::now();
        state.requests.insert(request.id, updated);
        Ok(())
    }

    async fn insert_work_item(&self, item: &WorkItem) -> Result<()> {
        self.lock()?.work_items.insert(item.id, item.clone());
        Ok(())
    }

    async fn find_work_item(&self, id: Uuid) -> Result<Option<WorkItem>> {
        Ok(self.lock()?.work_items.get(&id).cloned())
    }

    async fn find_reusable_work_item(&self, fingerprint: &str) -> Result<Option<WorkItem>> {
        Ok(self
            .lock()?
            .work_items
            .values()
            .filter(|w| w.fingerprint == fingerprint)
            .filter_map(|w| reuse_rank(w).map(|rank| (rank, w)))
            .min_by_key(|(rank, w)| (*rank, w.created_at))
            .map(|(_, w)| w.clone()))
    }

    async fn list_work_items(&self, states: &[WorkItemState]) -> Result<Vec<WorkItem>> {
        let mut items: Vec<WorkItem> = self
            .lock()?
            .work_items
            .values()
            .filter(|w| states.is_empty() || states.contains(&w.state))
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(items)
    }

    async fn transition_work_item(
        &self,
        id: Uuid,
        expected: WorkItemState,
        transition: &Transition,
    ) -> Result<Option<WorkItem>> {
        let mut state = self.lock()?;
        let Some(item) = state.work_items.get_mut(&id) else {
            return Ok(None);
        };
        if item.state != expected {
            return Ok(None);
        }

        item.state = transition.state;
        item.locked_by = transition.locked_by.clone();
        item.exit_code = transition.exit_code;
        item.output = transition.output.clone();
        item.log = transition.log.clone();
        item.modified_at = Utc::now();
        Ok(Some(item.clone()))
    }

    async fn recompute_priority(&self, id: Uuid) -> Result<Option<PriorityChange>> {
        let mut state = self.lock()?;
        let (priority, committed_requests) = {
            let committed: Vec<&Request> = state.committed_for(id).collect();
            (derived_priority(committed.iter().copied()), committed.len())
        };

        let Some(item) = state.work_items.get_mut(&id) else {
            return Ok(None);
        };
        let previous = item.priority;
        if previous != priority {
            item.priority = priority;
            item.modified_at = Utc::now();
        }

        Ok(Some(PriorityChange {
            previous,
            committed_requests,
            item: item.clone(),
        }))
    }

    async fn find_priority_mismatches(&self) -> Result<Vec<Uuid>> {
        let state = self.lock()?;
        Ok(state
            .work_items
            .values()
            .filter(|w| !w.state.is_terminal())
            .filter(|w| {
                let committed: Vec<&Request> = state.committed_for(w.id).collect();
                let orphaned = w.state == WorkItemState::Queued && committed.is_empty();
                orphaned || w.priority != derived_priority(committed)
            })
            .map(|w| w.id)
            .collect())
    }

    async fn insert_event(&self, event: &Event) -> Result<()> {
        self.lock()?.events.push(event.clone());
        Ok(())
    }

    async fn find_events(&self, work_item_id: Uuid) -> Result<Vec<Event>> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.work_item_id == work_item_id)
            .cloned()
            .collect())
    }
}

/// Test-only access used to simulate races the periodic sweep repairs
#[cfg(test)]
impl MemoryRepository {
    pub(crate) fn force_priority(&self, id: Uuid, priority: i64) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(item) = state.work_items.get_mut(&id) {
                item.priority = priority;
            }
        }
    }
}
