//! Work Item Service
//!
//! State machine enforcement, priority reconciliation and cascades.

use corral_core::domain::{RequestState, WorkItem, WorkItemState};
use corral_core::dto::work_item::StateReport;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::repository::{RepoError, Repository, Transition};

/// Re-reads after a lost compare-and-set before giving up
const MAX_CAS_ATTEMPTS: usize = 5;

/// Service error type
#[derive(Debug)]
pub enum WorkItemError {
    NotFound(Uuid),
    InvalidState(String),
    /// Lost a race or the caller does not hold the lock
    Conflict(String),
    ValidationError(String),
    DatabaseError(RepoError),
}

impl From<RepoError> for WorkItemError {
    fn from(err: RepoError) -> Self {
        WorkItemError::DatabaseError(err)
    }
}

pub type Result<T> = std::result::Result<T, WorkItemError>;

/// Get a Work Item by ID
pub async fn get_work_item(repo: &dyn Repository, id: Uuid) -> Result<WorkItem> {
    repo.find_work_item(id)
        .await?
        .ok_or(WorkItemError::NotFound(id))
}

/// List Work Items in the given states
pub async fn list_work_items(
    repo: &dyn Repository,
    states: &[WorkItemState],
) -> Result<Vec<WorkItem>> {
    Ok(repo.list_work_items(states).await?)
}

// =============================================================================
// Locking
// =============================================================================

/// Claim a Queued Work Item. Exactly one concurrent claimant wins.
pub async fn lock(repo: &dyn Repository, id: Uuid, identity: &str) -> Result<WorkItem> {
    validate_identity(identity)?;
    let item = get_work_item(repo, id).await?;

    if item.state != WorkItemState::Queued {
        return Err(WorkItemError::Conflict(format!(
            "Work item {} is {}, not Queued",
            id, item.state
        )));
    }
    if item.priority <= 0 {
        return Err(WorkItemError::InvalidState(format!(
            "Work item {} has priority 0 and cannot be locked",
            id
        )));
    }

    let locked = repo
        .transition_work_item(id, WorkItemState::Queued, &Transition::locked(identity))
        .await?
        .ok_or_else(|| {
            WorkItemError::Conflict(format!("Work item {} was claimed concurrently", id))
        })?;

    tracing::info!("Work item {} locked by {}", id, identity);
    Ok(locked)
}

/// Release a Locked Work Item back to Queued.
///
/// An item whose priority dropped to 0 while it was locked is cancelled
/// instead of being left in the queue.
pub async fn unlock(repo: &dyn Repository, id: Uuid, identity: &str) -> Result<WorkItem> {
    let item = get_work_item(repo, id).await?;

    if item.state != WorkItemState::Locked {
        return Err(WorkItemError::InvalidState(format!(
            "Work item {} is {}, not Locked",
            id, item.state
        )));
    }
    if !item.is_held_by(identity) {
        return Err(WorkItemError::Conflict(format!(
            "Work item {} is locked by {:?}, not {}",
            id, item.locked_by, identity
        )));
    }

    let queued = repo
        .transition_work_item(id, WorkItemState::Locked, &Transition::queued())
        .await?
        .ok_or_else(|| {
            WorkItemError::Conflict(format!("Work item {} changed state concurrently", id))
        })?;

    tracing::info!("Work item {} unlocked by {}", id, identity);

    if queued.priority == 0 {
        return cancel_queued(repo, queued).await;
    }
    Ok(queued)
}

// =============================================================================
// State Reports
// =============================================================================

/// Apply a state report from the dispatcher or runner.
///
/// Missing or terminal Work Items are reported as errors. A lost
/// compare-and-set is resolved by re-reading and re-validating.
pub async fn report_state(repo: &dyn Repository, id: Uuid, report: StateReport) -> Result<WorkItem> {
    for _ in 0..MAX_CAS_ATTEMPTS {
        let item = get_work_item(repo, id).await?;
        let transition = validate_report(&item, &report)?;

        match repo.transition_work_item(id, item.state, &transition).await? {
            Some(updated) => {
                tracing::info!(
                    "Work item {} transitioned {} -> {}",
                    id,
                    item.state,
                    updated.state
                );
                if updated.state.is_terminal() {
                    let affected = finalize(repo, &updated).await?;
                    reconcile(repo, affected).await?;
                    return get_work_item(repo, id).await;
                }
                return Ok(updated);
            }
            None => {
                tracing::debug!("Lost state race on work item {}, re-reading", id);
            }
        }
    }

    Err(WorkItemError::Conflict(format!(
        "Work item {} kept changing state; report {:?} not applied",
        id, report.state
    )))
}

fn validate_report(item: &WorkItem, report: &StateReport) -> Result<Transition> {
    if item.state.is_terminal() {
        return Err(WorkItemError::InvalidState(format!(
            "Work item {} is already {}",
            item.id, item.state
        )));
    }
    if !item.state.can_transition_to(report.state) {
        return Err(WorkItemError::InvalidState(format!(
            "Work item {} cannot go from {} to {}",
            item.id, item.state, report.state
        )));
    }

    let holds_lock = report
        .identity
        .as_deref()
        .is_some_and(|identity| item.is_held_by(identity));

    match report.state {
        WorkItemState::Running => {
            if !holds_lock {
                return Err(WorkItemError::Conflict(format!(
                    "Work item {} is locked by {:?}; reporter does not hold the lock",
                    item.id, item.locked_by
                )));
            }
            Ok(Transition {
                state: WorkItemState::Running,
                locked_by: item.locked_by.clone(),
                exit_code: None,
                output: None,
                log: None,
            })
        }
        WorkItemState::Complete => {
            let exit_code = report.exit_code.ok_or_else(|| {
                WorkItemError::ValidationError("Complete requires an exit code".to_string())
            })?;
            if report.identity.is_some() && !holds_lock {
                return Err(WorkItemError::Conflict(format!(
                    "Work item {} is locked by {:?}; reporter does not hold the lock",
                    item.id, item.locked_by
                )));
            }
            Ok(Transition {
                state: WorkItemState::Complete,
                locked_by: None,
                exit_code: Some(exit_code),
                output: report.output.clone(),
                log: report.log.clone(),
            })
        }
        WorkItemState::Cancelled => Ok(Transition::cancelled()),
        WorkItemState::Queued => {
            if !holds_lock {
                return Err(WorkItemError::Conflict(format!(
                    "Work item {} can only be released by its lock holder",
                    item.id
                )));
            }
            Ok(Transition::queued())
        }
        WorkItemState::Locked => Err(WorkItemError::InvalidState(
            "Work items are claimed through lock, not a state report".to_string(),
        )),
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Recomputes priorities starting from `ids` and follows cascades until no
/// further Work Item is affected.
///
/// A Queued item whose priority falls to 0 is cancelled when it previously
/// had positive priority or when no Committed Request references it any
/// more. Cancelling cascades through [`finalize`].
pub async fn reconcile(repo: &dyn Repository, ids: Vec<Uuid>) -> Result<()> {
    let mut pending: VecDeque<Uuid> = ids.into();

    while let Some(id) = pending.pop_front() {
        let Some(change) = repo.recompute_priority(id).await? else {
            tracing::warn!("Skipping priority recomputation for missing work item {}", id);
            continue;
        };

        if change.previous != change.item.priority {
            tracing::debug!(
                "Work item {} priority {} -> {}",
                id,
                change.previous,
                change.item.priority
            );
        }

        let item = change.item;
        let abandoned = change.previous > 0 || change.committed_requests == 0;
        if item.state == WorkItemState::Queued && item.priority == 0 && abandoned {
            if let Some(cancelled) = repo
                .transition_work_item(id, WorkItemState::Queued, &Transition::cancelled())
                .await?
            {
                tracing::info!("Work item {} cancelled: priority dropped to 0", id);
                pending.extend(finalize(repo, &cancelled).await?);
            }
        }
    }

    Ok(())
}

/// Applies the cascades of a Work Item reaching a terminal state.
///
/// Committed Requests referencing the item become Final (priority 0 when
/// the item was cancelled). Committed Requests issued from inside the item
/// get priority 0. Returns the Work Items whose priority must be recomputed.
async fn finalize(repo: &dyn Repository, item: &WorkItem) -> Result<Vec<Uuid>> {
    let mut affected = vec![item.id];

    for mut request in repo.find_committed_requests_for(item.id).await? {
        request.state = RequestState::Final;
        if item.state == WorkItemState::Cancelled {
            request.priority = Some(0);
        }
        repo.update_request(&request).await?;
        tracing::debug!("Request {} finalized by work item {}", request.id, item.id);
    }

    for mut child in repo.find_committed_children_of(item.id).await? {
        child.priority = Some(0);
        repo.update_request(&child).await?;
        tracing::info!(
            "Child request {} of finished work item {} forced to priority 0",
            child.id,
            item.id
        );
        if let Some(child_item) = child.work_item_id {
            affected.push(child_item);
        }
    }

    Ok(affected)
}

async fn cancel_queued(repo: &dyn Repository, item: WorkItem) -> Result<WorkItem> {
    let id = item.id;
    if let Some(cancelled) = repo
        .transition_work_item(id, WorkItemState::Queued, &Transition::cancelled())
        .await?
    {
        tracing::info!("Work item {} cancelled on release at priority 0", id);
        let affected = finalize(repo, &cancelled).await?;
        reconcile(repo, affected).await?;
    }
    get_work_item(repo, id).await
}

/// Repairs every Work Item whose stored priority disagrees with its
/// Committed Requests. Returns the number of items examined.
pub async fn sweep_priorities(repo: &dyn Repository) -> Result<usize> {
    let mismatched = repo.find_priority_mismatches().await?;
    let count = mismatched.len();
    if count > 0 {
        tracing::info!("Priority sweep repairing {} work item(s)", count);
    }
    reconcile(repo, mismatched).await?;
    Ok(count)
}

// =============================================================================
// Validation
// =============================================================================

fn validate_identity(identity: &str) -> Result<()> {
    if identity.trim().is_empty() {
        return Err(WorkItemError::ValidationError(
            "identity cannot be empty".to_string(),
        ));
    }
    Ok(())
}
