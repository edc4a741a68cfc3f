//! Work-Item Store collaborator interface
//!
//! The dispatcher and runner only see the store through this trait. The
//! store crate implements it in-process, the client crate over HTTP.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::work_item::{WorkItem, WorkItemState};
use crate::dto::work_item::{RecordEvent, StateReport};
use crate::error::StoreError;

#[async_trait]
pub trait WorkItemApi: Send + Sync {
    /// Fetches the authoritative Work Item record
    async fn get_work_item(&self, id: Uuid) -> Result<WorkItem, StoreError>;

    /// Lists Work Items in any of the given states (all states when empty)
    async fn list_work_items(&self, states: &[WorkItemState]) -> Result<Vec<WorkItem>, StoreError>;

    /// Queued -> Locked compare-and-set. Exactly one concurrent claimant wins.
    async fn lock(&self, id: Uuid, identity: &str) -> Result<WorkItem, StoreError>;

    /// Locked -> Queued, only by the identity holding the lock
    async fn unlock(&self, id: Uuid, identity: &str) -> Result<WorkItem, StoreError>;

    /// Applies a state transition reported by the dispatcher or runner
    async fn report_state(&self, id: Uuid, report: StateReport) -> Result<WorkItem, StoreError>;

    /// Attaches a diagnostic event to a Work Item
    async fn record_event(&self, id: Uuid, event: RecordEvent) -> Result<(), StoreError>;
}
