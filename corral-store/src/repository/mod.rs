//! Repository Module
//!
//! Data access layer for the store. The [`Repository`] trait is the only
//! place state is read or written; it owns the two atomic primitives the
//! reconciliation model relies on:
//!
//! - compare-and-set of a Work Item's state keyed by (id, expected state)
//! - recomputation of a Work Item's priority from its Committed Requests
//!
//! Two backends are provided: an in-memory one and PostgreSQL.

pub mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use async_trait::async_trait;
use corral_core::domain::{Event, Request, WorkItem, WorkItemState};
use uuid::Uuid;

/// Repository error type
#[derive(Debug)]
pub enum RepoError {
    DatabaseError(sqlx::Error),
    /// A stored row could not be decoded into a domain value
    Corrupt(String),
    /// In-memory state poisoned by a panicking writer
    Poisoned,
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        RepoError::DatabaseError(err)
    }
}

impl std::fmt::Display for RepoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepoError::DatabaseError(err) => write!(f, "database error: {}", err),
            RepoError::Corrupt(msg) => write!(f, "corrupt record: {}", msg),
            RepoError::Poisoned => write!(f, "repository lock poisoned"),
        }
    }
}

impl std::error::Error for RepoError {}

pub type Result<T> = std::result::Result<T, RepoError>;

/// New values for the mutable state fields of a Work Item
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: WorkItemState,
    pub locked_by: Option<String>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub log: Option<String>,
}

impl Transition {
    pub fn locked(identity: &str) -> Self {
        Self {
            state: WorkItemState::Locked,
            locked_by: Some(identity.to_string()),
            exit_code: None,
            output: None,
            log: None,
        }
    }

    pub fn queued() -> Self {
        Self {
            state: WorkItemState::Queued,
            locked_by: None,
            exit_code: None,
            output: None,
            log: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: WorkItemState::Cancelled,
            locked_by: None,
            exit_code: None,
            output: None,
            log: None,
        }
    }
}

/// Result of an atomic priority recomputation
#[derive(Debug, Clone)]
pub struct PriorityChange {
    /// Priority before recomputation
    pub previous: i64,
    /// Number of Committed Requests referencing the item, any priority
    pub committed_requests: usize,
    pub item: WorkItem,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // =========================================================================
    // Requests
    // =========================================================================

    async fn insert_request(&self, request: &Request) -> Result<()>;

    async fn update_request(&self, request: &Request) -> Result<()>;

    async fn find_request(&self, id: Uuid) -> Result<Option<Request>>;

    /// Committed Requests whose Work Item is `work_item_id`
    async fn find_committed_requests_for(&self, work_item_id: Uuid) -> Result<Vec<Request>>;

    /// Committed Requests issued from inside `work_item_id`
    async fn find_committed_children_of(&self, work_item_id: Uuid) -> Result<Vec<Request>>;

    /// Writes `request` and, when given, inserts `new_item` in one atomic
    /// step. A freshly created Work Item is never visible without the
    /// Request that commits to it.
    async fn attach_request(&self, request: &Request, new_item: Option<&WorkItem>) -> Result<()>;

    // =========================================================================
    // Work Items
    // =========================================================================

    async fn insert_work_item(&self, item: &WorkItem) -> Result<()>;

    async fn find_work_item(&self, id: Uuid) -> Result<Option<WorkItem>>;

    /// Best reuse candidate with this fingerprint: Complete (exit 0, with
    /// output) first, then Running, Locked, Queued; oldest first within a
    /// state. Cancelled and failed items never match.
    async fn find_reusable_work_item(&self, fingerprint: &str) -> Result<Option<WorkItem>>;

    /// Work Items in any of `states`, all items when `states` is empty.
    /// Ordered by priority (highest first), then creation time.
    async fn list_work_items(&self, states: &[WorkItemState]) -> Result<Vec<WorkItem>>;

    /// Applies `transition` iff the item's current state is `expected`.
    ///
    /// Returns the updated item, or `None` when the item is missing or its
    /// state differs (lost race).
    async fn transition_work_item(
        &self,
        id: Uuid,
        expected: WorkItemState,
        transition: &Transition,
    ) -> Result<Option<WorkItem>>;

    /// Atomically sets the item's priority to the max over its positive
    /// Committed Requests (0 when none).
    async fn recompute_priority(&self, id: Uuid) -> Result<Option<PriorityChange>>;

    /// Non-terminal items whose stored priority disagrees with their
    /// Committed Requests, plus Queued items no Committed Request references
    async fn find_priority_mismatches(&self) -> Result<Vec<Uuid>>;

    // =========================================================================
    // Events
    // =========================================================================

    async fn insert_event(&self, event: &Event) -> Result<()>;

    async fn find_events(&self, work_item_id: Uuid) -> Result<Vec<Event>>;
}

/// Rank used to pick among reuse candidates, lower is better
pub(crate) fn reuse_rank(item: &WorkItem) -> Option<u8> {
    match item.state {
        WorkItemState::Complete if item.is_reusable_result() => Some(0),
        WorkItemState::Running => Some(1),
        WorkItemState::Locked => Some(2),
        WorkItemState::Queued => Some(3),
        _ => None,
    }
}
