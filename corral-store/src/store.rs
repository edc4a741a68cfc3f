//! In-process store handle
//!
//! [`Store`] bundles a repository with the change notifier the priority
//! sweeper listens on. It is the axum router state and implements
//! [`WorkItemApi`] so the dispatcher and runner can be driven against it
//! directly in tests.

use async_trait::async_trait;
use corral_core::domain::{Event, Request, WorkItem, WorkItemState};
use corral_core::dto::request::CreateRequest;
use corral_core::dto::work_item::{RecordEvent, StateReport};
use corral_core::{StoreError, WorkItemApi};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::repository::{MemoryRepository, Repository};
use crate::service::event::EventError;
use crate::service::request::RequestError;
use crate::service::work_item::WorkItemError;
use crate::service::{event_service, request_service, work_item_service};

#[derive(Clone)]
pub struct Store {
    repo: Arc<dyn Repository>,
    changes: Arc<Notify>,
}

impl Store {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            changes: Arc::new(Notify::new()),
        }
    }

    /// Store backed by a fresh [`MemoryRepository`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRepository::new()))
    }

    pub fn repository(&self) -> &dyn Repository {
        self.repo.as_ref()
    }

    /// Signalled after every Request write
    pub fn changes(&self) -> Arc<Notify> {
        self.changes.clone()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub async fn create_request(&self, req: CreateRequest) -> Result<Request, RequestError> {
        let request = request_service::create_request(self.repository(), req).await?;
        self.changes.notify_one();
        Ok(request)
    }

    pub async fn commit(&self, id: Uuid) -> Result<Request, RequestError> {
        let request = request_service::commit(self.repository(), id).await?;
        self.changes.notify_one();
        Ok(request)
    }

    pub async fn set_priority(&self, id: Uuid, priority: i64) -> Result<Request, RequestError> {
        let request = request_service::set_priority(self.repository(), id, priority).await?;
        self.changes.notify_one();
        Ok(request)
    }

    pub async fn cancel_request(&self, id: Uuid) -> Result<Request, RequestError> {
        let request = request_service::cancel_request(self.repository(), id).await?;
        self.changes.notify_one();
        Ok(request)
    }

    pub async fn get_request(&self, id: Uuid) -> Result<Request, RequestError> {
        request_service::get_request(self.repository(), id).await
    }

    // =========================================================================
    // Work Items
    // =========================================================================

    pub async fn find_work_item(&self, id: Uuid) -> Result<WorkItem, WorkItemError> {
        work_item_service::get_work_item(self.repository(), id).await
    }

    pub async fn work_items(&self, states: &[WorkItemState]) -> Result<Vec<WorkItem>, WorkItemError> {
        work_item_service::list_work_items(self.repository(), states).await
    }

    pub async fn lock_item(&self, id: Uuid, identity: &str) -> Result<WorkItem, WorkItemError> {
        work_item_service::lock(self.repository(), id, identity).await
    }

    pub async fn unlock_item(&self, id: Uuid, identity: &str) -> Result<WorkItem, WorkItemError> {
        work_item_service::unlock(self.repository(), id, identity).await
    }

    pub async fn apply_report(&self, id: Uuid, report: StateReport) -> Result<WorkItem, WorkItemError> {
        work_item_service::report_state(self.repository(), id, report).await
    }

    pub async fn add_event(&self, id: Uuid, event: RecordEvent) -> Result<Event, EventError> {
        event_service::record_event(self.repository(), id, event).await
    }

    pub async fn events(&self, id: Uuid) -> Result<Vec<Event>, EventError> {
        event_service::list_events(self.repository(), id).await
    }

    /// Runs one priority repair pass without taking the sweep lock
    pub async fn sweep_unlocked(&self) -> Result<usize, WorkItemError> {
        work_item_service::sweep_priorities(self.repository()).await
    }
}

// =============================================================================
// Error mapping
// =============================================================================

impl From<WorkItemError> for StoreError {
    fn from(err: WorkItemError) -> Self {
        match err {
            WorkItemError::NotFound(id) => StoreError::NotFound(format!("work item {}", id)),
            WorkItemError::InvalidState(msg) => StoreError::InvalidState(msg),
            WorkItemError::Conflict(msg) => StoreError::Conflict(msg),
            WorkItemError::ValidationError(msg) => StoreError::Validation(msg),
            WorkItemError::DatabaseError(err) => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<EventError> for StoreError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::WorkItemNotFound(id) => StoreError::NotFound(format!("work item {}", id)),
            EventError::ValidationError(msg) => StoreError::Validation(msg),
            EventError::DatabaseError(err) => StoreError::Unavailable(err.to_string()),
        }
    }
}

#[async_trait]
impl WorkItemApi for Store {
    async fn get_work_item(&self, id: Uuid) -> Result<WorkItem, StoreError> {
        Ok(self.find_work_item(id).await?)
    }

    async fn list_work_items(&self, states: &[WorkItemState]) -> Result<Vec<WorkItem>, StoreError> {
        Ok(self.work_items(states).await?)
    }

    async fn lock(&self, id: Uuid, identity: &str) -> Result<WorkItem, StoreError> {
        Ok(self.lock_item(id, identity).await?)
    }

    async fn unlock(&self, id: Uuid, identity: &str) -> Result<WorkItem, StoreError> {
        Ok(self.unlock_item(id, identity).await?)
    }

    async fn report_state(&self, id: Uuid, report: StateReport) -> Result<WorkItem, StoreError> {
        Ok(self.apply_report(id, report).await?)
    }

    async fn record_event(&self, id: Uuid, event: RecordEvent) -> Result<(), StoreError> {
        self.add_event(id, event).await?;
        Ok(())
    }
}
