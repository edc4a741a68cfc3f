//! Request Service
//!
//! Business logic for Request creation, commit, priority edits and
//! cancellation. Every write funnels into a Work Item reconciliation.

use chrono::Utc;
use corral_core::domain::{Request, RequestState, WorkItem};
use corral_core::dto::request::CreateRequest;
use uuid::Uuid;

use crate::repository::{RepoError, Repository};
use crate::service::work_item::{self, WorkItemError};

/// Service error type
#[derive(Debug)]
pub enum RequestError {
    NotFound(Uuid),
    WorkItemNotFound(Uuid),
    InvalidState(String),
    ValidationError(String),
    Conflict(String),
    DatabaseError(RepoError),
}

impl From<RepoError> for RequestError {
    fn from(err: RepoError) -> Self {
        RequestError::DatabaseError(err)
    }
}

impl From<WorkItemError> for RequestError {
    fn from(err: WorkItemError) -> Self {
        match err {
            WorkItemError::NotFound(id) => RequestError::WorkItemNotFound(id),
            WorkItemError::InvalidState(msg) => RequestError::InvalidState(msg),
            WorkItemError::Conflict(msg) => RequestError::Conflict(msg),
            WorkItemError::ValidationError(msg) => RequestError::ValidationError(msg),
            WorkItemError::DatabaseError(err) => RequestError::DatabaseError(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, RequestError>;

/// Create a new Uncommitted Request, committing it right away if asked
pub async fn create_request(repo: &dyn Repository, req: CreateRequest) -> Result<Request> {
    if let Some(priority) = req.priority {
        validate_priority(priority)?;
    }

    let now = Utc::now();
    let request = Request {
        id: Uuid::new_v4(),
        name: req.name,
        state: RequestState::Uncommitted,
        priority: req.priority,
        work_item_id: None,
        requesting_work_item_id: req.requesting_work_item_id,
        runtime_constraints: req.runtime_constraints,
        scheduling: req.scheduling,
        spec: req.spec,
        use_existing: req.use_existing,
        created_at: now,
        modified_at: now,
    };

    repo.insert_request(&request).await?;
    tracing::info!("Request created: {}", request.id);

    if req.commit {
        return commit(repo, request.id).await;
    }
    Ok(request)
}

/// Get a Request by ID
pub async fn get_request(repo: &dyn Repository, id: Uuid) -> Result<Request> {
    repo.find_request(id)
        .await?
        .ok_or(RequestError::NotFound(id))
}

/// Commit a Request.
///
/// Validates priority and constraints, then attaches the Request to a
/// reusable Work Item or creates a new Queued one. Attaching to a Complete
/// item finalizes the Request immediately.
pub async fn commit(repo: &dyn Repository, id: Uuid) -> Result<Request> {
    let mut request = get_request(repo, id).await?;

    if request.state != RequestState::Uncommitted {
        return Err(RequestError::InvalidState(format!(
            "Request {} is {}, only Uncommitted requests can be committed",
            id,
            request.state.as_str()
        )));
    }

    let priority = request.priority.ok_or_else(|| {
        RequestError::ValidationError("priority is required to commit".to_string())
    })?;
    validate_priority(priority)?;
    request
        .runtime_constraints
        .validate()
        .map_err(RequestError::ValidationError)?;
    request.spec.validate().map_err(RequestError::ValidationError)?;

    if requester_finished(repo, &request).await? {
        request.priority = Some(0);
    }

    let reusable = if request.use_existing {
        let fingerprint =
            corral_core::domain::work_item::fingerprint(&request.spec, &request.runtime_constraints);
        repo.find_reusable_work_item(&fingerprint).await?
    } else {
        None
    };

    let (item, created) = match reusable {
        Some(item) => {
            tracing::info!("Request {} reuses work item {}", id, item.id);
            (item, false)
        }
        None => {
            let item = WorkItem::new(
                request.spec.clone(),
                request.runtime_constraints.clone(),
                request.scheduling.clone(),
            );
            (item, true)
        }
    };

    request.work_item_id = Some(item.id);
    request.state = if item.is_reusable_result() {
        RequestState::Final
    } else {
        RequestState::Committed
    };
    // A new item and its first Committed Request land together, otherwise a
    // concurrent sweep would see an unreferenced Queued item and cancel it
    repo.attach_request(&request, created.then_some(&item)).await?;
    if created {
        tracing::info!("Work item {} created for request {}", item.id, id);
    }

    work_item::reconcile(repo, vec![item.id]).await?;

    // The item may have finished between the reuse lookup and our write.
    // Finalization is idempotent, so re-run it for a late attach.
    let current = work_item::get_work_item(repo, item.id).await?;
    if request.state == RequestState::Committed && current.state.is_terminal() {
        let mut late = get_request(repo, id).await?;
        if late.state == RequestState::Committed {
            late.state = RequestState::Final;
            if current.state == corral_core::domain::WorkItemState::Cancelled {
                late.priority = Some(0);
            }
            repo.update_request(&late).await?;
            work_item::reconcile(repo, vec![item.id]).await?;
        }
    }

    get_request(repo, id).await
}

/// Change a Request's priority and recompute its Work Item
pub async fn set_priority(repo: &dyn Repository, id: Uuid, priority: i64) -> Result<Request> {
    validate_priority(priority)?;
    let mut request = get_request(repo, id).await?;

    if request.state == RequestState::Final {
        return Err(RequestError::InvalidState(format!(
            "Request {} is Final; its priority can no longer change",
            id
        )));
    }

    request.priority = if requester_finished(repo, &request).await? {
        Some(0)
    } else {
        Some(priority)
    };
    repo.update_request(&request).await?;

    tracing::info!(
        "Request {} priority set to {:?}",
        id,
        request.priority.unwrap_or(0)
    );

    if let (RequestState::Committed, Some(work_item_id)) = (request.state, request.work_item_id) {
        work_item::reconcile(repo, vec![work_item_id]).await?;
    }

    get_request(repo, id).await
}

/// Cancel a Request: it becomes Final with priority 0. Cancelling a Final
/// Request is a no-op.
pub async fn cancel_request(repo: &dyn Repository, id: Uuid) -> Result<Request> {
    let mut request = get_request(repo, id).await?;

    if request.state == RequestState::Final {
        return Ok(request);
    }

    let was_committed = request.is_committed();
    request.state = RequestState::Final;
    request.priority = Some(0);
    repo.update_request(&request).await?;

    tracing::info!("Request {} cancelled", id);

    if let (true, Some(work_item_id)) = (was_committed, request.work_item_id) {
        work_item::reconcile(repo, vec![work_item_id]).await?;
    }

    get_request(repo, id).await
}

/// Whether the Work Item that issued this Request has already finished
async fn requester_finished(repo: &dyn Repository, request: &Request) -> Result<bool> {
    let Some(parent) = request.requesting_work_item_id else {
        return Ok(false);
    };
    let parent = repo
        .find_work_item(parent)
        .await?
        .ok_or(RequestError::WorkItemNotFound(parent))?;
    Ok(parent.state.is_terminal())
}

// =============================================================================
// Validation
// =============================================================================

fn validate_priority(priority: i64) -> Result<()> {
    if priority < 0 {
        return Err(RequestError::ValidationError(format!(
            "priority must be non-negative, got {}",
            priority
        )));
    }
    Ok(())
}
